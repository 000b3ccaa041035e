//! Server endpoint: the listener, its driver, and the server identity.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use log::info;

use crate::driver::Driver;
use crate::engine::Engine;
use crate::event::{ConnId, Update};
use crate::Config;

/// Default timeout for one [`Server::update`] cycle.
pub const SOCKET_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// The VERSION artifact at the repository root, compiled in and reported
/// through the `Server:` header.
const VERSION: &str = include_str!("../VERSION");

/// The identity string sent in `Server:` headers.
pub fn server_identifier() -> String {
    format!("sockmux/{}", VERSION.trim())
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interface to bind
    pub bind_address: String,
    /// Port to bind
    pub port: u16,
}

impl ServerOptions {
    /// Bind every interface on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: "0.0.0.0".to_owned(),
            port,
        }
    }

    /// Set the bind interface.
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new(80)
    }
}

/// A listening WebSocket server.
///
/// Thin façade over a [`Driver`] that owns the listener: `update` runs one
/// multiplexing cycle and returns the events it produced, and connections
/// are driven through [`Server::connection_mut`].
pub struct Server {
    driver: Driver,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listener and set up the driver.
    pub fn bind(options: &ServerOptions, config: Config) -> io::Result<Self> {
        let listener = TcpListener::bind((options.bind_address.as_str(), options.port))?;
        let local_addr = listener.local_addr()?;
        let driver = Driver::with_listener(listener, config, server_identifier())?;
        info!("listening on {}", local_addr);
        Ok(Self { driver, local_addr })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run one update cycle. `None` blocks until something is ready;
    /// [`SOCKET_ACCEPT_TIMEOUT`] is the conventional periodic timeout.
    pub fn update(&mut self, timeout: Option<Duration>) -> Vec<Update> {
        self.driver.update(timeout)
    }

    /// Look up a connection by index.
    pub fn connection(&self, id: ConnId) -> Option<&Engine> {
        self.driver.connection(id)
    }

    /// Look up a connection by index, mutably.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Engine> {
        self.driver.connection_mut(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.driver.len()
    }

    /// Whether the server has no live connections.
    pub fn is_empty(&self) -> bool {
        self.driver.is_empty()
    }

    /// The underlying driver, for direct control.
    pub fn driver_mut(&mut self) -> &mut Driver {
        &mut self.driver
    }
}

//! Client-side connection establishment.
//!
//! Connecting produces an [`Engine`] in the handshaking phase with the
//! upgrade request already staged; hand it to a [`crate::Driver`] to pump.
//! The engine yields `ConnectionAccepted` when the server answers 101 and
//! `ConnectionDenied` otherwise.

use std::net::TcpStream;

use log::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::transport::{TcpTransport, Transport};
use crate::Config;

/// Where and what to connect to.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Remote host name or address
    pub address: String,
    /// Remote port
    pub port: u16,
    /// Request path
    pub path: String,
}

impl ClientOptions {
    /// Options for `address:port` with the root path.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            path: "/".to_owned(),
        }
    }

    /// Set the request path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// The `host:port` form used in the Host header.
    pub fn host_header(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Open a TCP connection and stage the upgrade request.
///
/// The connect itself is blocking; the returned engine and its transport
/// are nonblocking.
pub fn connect(options: &ClientOptions, config: &Config) -> Result<Engine> {
    let stream = TcpStream::connect((options.address.as_str(), options.port))?;
    let transport = TcpTransport::new(stream)?;
    let remote = transport.peer_addr().ok();
    debug!("connected to {}:{}", options.address, options.port);

    let mut engine = Engine::client(
        Box::new(transport),
        &options.host_header(),
        &options.path,
        config.clone(),
    );
    engine.set_remote_addr(remote);
    Ok(engine)
}

/// Stage the upgrade request over a caller-supplied transport.
///
/// This is the entry point for wrapped byte channels. A TLS stream that
/// implements [`Transport`] connects here and the engine never knows the
/// difference.
pub fn handshake_over(
    transport: Box<dyn Transport>,
    options: &ClientOptions,
    config: &Config,
) -> Engine {
    Engine::client(transport, &options.host_header(), &options.path, config.clone())
}

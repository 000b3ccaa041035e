//! # sockmux: RFC 6455 WebSocket endpoints over a readiness loop
//!
//! A WebSocket library built around three pieces:
//!
//! - **Frame codec** ([`frame`]): bit-exact encode/decode of the RFC 6455
//!   wire format, with masking and minimal-length enforcement.
//! - **Connection engine** ([`engine`]): a nonblocking per-connection state
//!   machine that consumes byte chunks of any size, reassembles fragmented
//!   messages, keeps control frames ahead of data on the write path, and
//!   runs the closing handshake.
//! - **Event driver** ([`driver`]): multiplexes any number of engines (and
//!   the server listener) behind one readiness primitive and surfaces
//!   everything as [`Update`] events.
//!
//! Scheduling is single-threaded and cooperative: the only blocking call is
//! the driver's poller wait. Transports are plain nonblocking byte channels
//! behind the [`transport::Transport`] trait, so TLS wrappers slot in
//! without the engine noticing.
//!
//! ## Server example
//!
//! ```no_run
//! use sockmux::{Config, Server, ServerOptions, Update, SOCKET_ACCEPT_TIMEOUT};
//!
//! let options = ServerOptions::new(8080);
//! let mut server = Server::bind(&options, Config::default()).unwrap();
//! loop {
//!     for update in server.update(Some(SOCKET_ACCEPT_TIMEOUT)) {
//!         match update {
//!             Update::NewConnection { id } => {
//!                 server.connection_mut(id).unwrap().accept(None).unwrap();
//!             }
//!             Update::Read { id, opcode, payload } => {
//!                 // Echo
//!                 let conn = server.connection_mut(id).unwrap();
//!                 conn.write(&payload, opcode, true).unwrap();
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

pub mod client;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod server;
pub mod transport;
pub mod utf8;

pub use client::ClientOptions;
pub use driver::{Driver, ACCEPT_TIMEOUT_SECS};
pub use engine::{Engine, Phase, Role};
pub use error::{CloseReason, Error, Result};
pub use event::{ConnId, Update};
pub use frame::{FrameHeader, OpCode};
pub use server::{server_identifier, Server, ServerOptions, SOCKET_ACCEPT_TIMEOUT};
pub use transport::{TcpTransport, Transport};

/// WebSocket GUID appended to the key for the accept token (RFC 6455 §1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload encodable in the 7-bit length field
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload encodable in the 16-bit extended length field
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Maximum frame header size (2 + 8 + 4 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Default bytes moved per connection per I/O cycle
pub const DEFAULT_IO_RATE: usize = 16384;

/// Default cap on the size of a handshake head
pub const HANDSHAKE_MAXLENGTH: usize = 8192;

/// Per-engine tunables.
///
/// # Example
///
/// ```
/// use sockmux::Config;
///
/// let config = Config::builder()
///     .read_rate(32 * 1024)
///     .write_rate(32 * 1024)
///     .max_handshake_length(4096)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes read from the transport per cycle (default: 16384)
    pub read_rate: usize,
    /// Bytes written to the transport per cycle (default: 16384)
    pub write_rate: usize,
    /// Maximum handshake head size before teardown (default: 8192)
    pub max_handshake_length: usize,
    /// Accept incoming frames with RSV1 set (default: false)
    pub allow_rsv1: bool,
    /// Accept incoming frames with RSV2 set (default: false)
    pub allow_rsv2: bool,
    /// Accept incoming frames with RSV3 set (default: false)
    pub allow_rsv3: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_rate: DEFAULT_IO_RATE,
            write_rate: DEFAULT_IO_RATE,
            max_handshake_length: HANDSHAKE_MAXLENGTH,
            allow_rsv1: false,
            allow_rsv2: false,
            allow_rsv3: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the per-cycle read cap in bytes
    pub fn read_rate(mut self, bytes: usize) -> Self {
        self.config.read_rate = bytes;
        self
    }

    /// Set the per-cycle write cap in bytes
    pub fn write_rate(mut self, bytes: usize) -> Self {
        self.config.write_rate = bytes;
        self
    }

    /// Set the handshake size limit
    pub fn max_handshake_length(mut self, bytes: usize) -> Self {
        self.config.max_handshake_length = bytes;
        self
    }

    /// Allow incoming frames with RSV1 set
    pub fn allow_rsv1(mut self, allow: bool) -> Self {
        self.config.allow_rsv1 = allow;
        self
    }

    /// Allow incoming frames with RSV2 set
    pub fn allow_rsv2(mut self, allow: bool) -> Self {
        self.config.allow_rsv2 = allow;
        self
    }

    /// Allow incoming frames with RSV3 set
    pub fn allow_rsv3(mut self, allow: bool) -> Self {
        self.config.allow_rsv3 = allow;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::ClientOptions;
    pub use crate::driver::Driver;
    pub use crate::engine::{Engine, Phase, Role};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::event::{ConnId, Update};
    pub use crate::frame::OpCode;
    pub use crate::server::{Server, ServerOptions};
    pub use crate::Config;
}

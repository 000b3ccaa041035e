//! The event driver: pumps many engines behind one readiness primitive.
//!
//! The driver owns the authoritative connection table, keyed by a
//! monotonically increasing index, plus the listener on the server side.
//! Each [`Driver::update`] cycle re-arms interest for every transport
//! (readable always, writable only when an engine has output pending),
//! blocks on the poller up to the given timeout, and then pumps whatever
//! became ready: accept first, then reads, then writes, then the server's
//! accept-timeout sweep. Events from all engines are collected into one
//! vector for the caller to drain.
//!
//! Interest is registered oneshot and re-armed per cycle, which gives the
//! poller the same mutate-the-sets semantics a select() loop rebuilds by
//! hand.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use log::{debug, trace, warn};
use polling::{Event as PollEvent, Events, Poller};

use crate::engine::Engine;
use crate::event::{ConnId, Update};
use crate::transport::TcpTransport;
use crate::Config;

/// Seconds a server connection may sit with a valid but unaccepted
/// handshake before it is denied with 408. Compared at whole-second
/// granularity.
pub const ACCEPT_TIMEOUT_SECS: u64 = 1;

/// Poller key reserved for the listener.
///
/// `usize::MAX` is reserved by `polling` itself for internal notifications,
/// so the next value down is used instead.
const LISTENER_KEY: usize = usize::MAX - 1;

/// Multiplexes engines over a [`polling::Poller`].
pub struct Driver {
    poller: Poller,
    events: Events,
    listener: Option<TcpListener>,
    connections: HashMap<ConnId, Engine>,
    next_id: ConnId,
    config: Config,
    server_id: String,
}

impl Driver {
    /// A driver with no listener, for client-side connections.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            events: Events::new(),
            listener: None,
            connections: HashMap::new(),
            next_id: 1,
            config: Config::default(),
            server_id: String::new(),
        })
    }

    /// A server driver. Accepted connections start in the handshaking
    /// phase with `config` and answer with `server_id` in their `Server:`
    /// header.
    pub fn with_listener(
        listener: TcpListener,
        config: Config,
        server_id: impl Into<String>,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let poller = Poller::new()?;
        // SAFETY: the listener outlives the poller registration; it is
        // owned by the driver and deregistration is not needed before drop.
        unsafe {
            poller.add(listener.as_raw_fd(), PollEvent::readable(LISTENER_KEY))?;
        }
        Ok(Self {
            poller,
            events: Events::new(),
            listener: Some(listener),
            connections: HashMap::new(),
            next_id: 1,
            config,
            server_id: server_id.into(),
        })
    }

    /// Adopt an engine, assigning it the next connection index.
    pub fn attach(&mut self, mut engine: Engine) -> io::Result<ConnId> {
        let id = self.next_id;
        self.next_id += 1;
        engine.set_id(id);
        // SAFETY: the transport fd stays valid while the engine lives in
        // the table; it is deleted from the poller before removal.
        unsafe {
            self.poller
                .add(engine.raw_fd(), Self::interest(&engine, id))?;
        }
        trace!("connection {}: attached", id);
        self.connections.insert(id, engine);
        Ok(id)
    }

    /// Look up a connection by index.
    pub fn connection(&self, id: ConnId) -> Option<&Engine> {
        self.connections.get(&id)
    }

    /// Look up a connection by index, mutably: the handle for `accept`,
    /// `deny`, `write`, and `send_close`.
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Engine> {
        self.connections.get_mut(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the driver has no live connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate over live connection indices.
    pub fn connection_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.connections.keys().copied()
    }

    fn interest(engine: &Engine, id: ConnId) -> PollEvent {
        if engine.wants_write() {
            PollEvent::all(id as usize)
        } else {
            PollEvent::readable(id as usize)
        }
    }

    /// Run one update cycle and return every event it produced.
    ///
    /// `None` blocks until something is ready.
    pub fn update(&mut self, timeout: Option<Duration>) -> Vec<Update> {
        let mut out = Vec::new();

        if let Err(error) = self.arm() {
            out.push(Update::SelectError { error });
            return out;
        }

        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return out,
            Err(error) => {
                out.push(Update::SelectError { error });
                return out;
            }
        }

        let mut accept_ready = false;
        let mut readable = Vec::new();
        let mut writable = Vec::new();
        for ev in self.events.iter() {
            if ev.key == LISTENER_KEY {
                accept_ready = true;
                continue;
            }
            let id = ev.key as ConnId;
            if ev.readable {
                readable.push(id);
            }
            if ev.writable {
                writable.push(id);
            }
        }

        if accept_ready {
            self.accept_pending(&mut out);
        }
        for id in readable {
            if let Some(engine) = self.connections.get_mut(&id) {
                engine.handle_read(&mut out);
            }
        }
        for id in writable {
            if let Some(engine) = self.connections.get_mut(&id) {
                engine.handle_write(&mut out);
            }
        }

        if self.listener.is_some() {
            self.sweep_accept_timeouts(&mut out);
        }
        self.reap();

        out
    }

    /// Re-arm oneshot interest for the listener and every live transport.
    fn arm(&mut self) -> io::Result<()> {
        if let Some(listener) = &self.listener {
            // SAFETY: fd is valid for the duration of the call.
            let fd = unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) };
            self.poller.modify(fd, PollEvent::readable(LISTENER_KEY))?;
        }
        for (&id, engine) in &self.connections {
            if engine.is_closed() {
                continue;
            }
            // SAFETY: fd is valid for the duration of the call.
            let fd = unsafe { BorrowedFd::borrow_raw(engine.raw_fd()) };
            self.poller.modify(fd, Self::interest(engine, id))?;
        }
        Ok(())
    }

    /// Drain the listener's accept backlog into new handshaking engines.
    fn accept_pending(&mut self, out: &mut Vec<Update>) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let transport = match TcpTransport::new(stream) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("failed to prepare accepted socket: {}", e);
                            continue;
                        }
                    };
                    let engine = Engine::server(
                        Box::new(transport),
                        Some(addr),
                        self.config.clone(),
                        self.server_id.clone(),
                    );
                    match self.attach(engine) {
                        Ok(id) => debug!("connection {}: accepted from {}", id, addr),
                        Err(e) => warn!("failed to register accepted socket: {}", e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.push(Update::SelectError { error: e });
                    break;
                }
            }
        }
    }

    /// Deny connections whose valid handshake the caller has not accepted
    /// within [`ACCEPT_TIMEOUT_SECS`].
    fn sweep_accept_timeouts(&mut self, out: &mut Vec<Update>) {
        for (&id, engine) in self.connections.iter_mut() {
            if engine.has_handshake()
                && !engine.handshake_accepted()
                && !engine.is_disconnecting()
                && engine.opened().elapsed().as_secs() >= ACCEPT_TIMEOUT_SECS
            {
                debug!("connection {}: accept timeout", id);
                out.push(Update::AcceptTimeoutPassed { id });
                let _ = engine.deny(408);
            }
        }
    }

    /// Drop engines whose transport has shut down.
    fn reap(&mut self) {
        let closed: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, e)| e.is_closed())
            .map(|(&id, _)| id)
            .collect();
        for id in closed {
            if let Some(engine) = self.connections.remove(&id) {
                let fd: RawFd = engine.raw_fd();
                // SAFETY: fd is valid for the duration of the call; the
                // transport shutdown does not close the descriptor.
                let _ = self.poller.delete(unsafe { BorrowedFd::borrow_raw(fd) });
                trace!("connection {}: reaped", id);
            }
        }
    }
}

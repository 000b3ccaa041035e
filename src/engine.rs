//! The per-connection protocol engine.
//!
//! One engine owns one transport and runs it through the connection
//! lifecycle: the HTTP upgrade, the open frame exchange, the closing
//! handshake, teardown. It is pumped from outside: [`Engine::handle_read`]
//! and [`Engine::handle_write`] each perform at most one transport call and
//! append whatever happened to the caller's event vector, so arbitrarily
//! many engines can share a single thread behind one readiness primitive.
//!
//! Outbound traffic is queued as wire-ready bytes. Control frames
//! (Close/Ping/Pong) wait in their own queue and are always promoted before
//! queued data frames, but never preempt a frame whose bytes are already
//! mid-flight.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace};

use crate::error::{CloseReason, Error, Result};
use crate::event::{ConnId, Update};
use crate::frame::{decode_header, decode_payload, encode_frame, OpCode};
use crate::handshake::{self, ServerHandshake, UpgradeRequest};
use crate::mask::generate_mask;
use crate::transport::Transport;
use crate::utf8::validate_utf8;
use crate::Config;

/// Endpoint role. Decides masking direction and close-latch behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake; masks outgoing frames.
    Client,
    /// Accepts the handshake; sends unmasked frames.
    Server,
}

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Upgrade exchange in progress.
    Handshaking,
    /// Frames flow in both directions.
    Open,
    /// A Close frame has been sent or received.
    Closing,
    /// Transport is shut down; the engine is inert.
    Closed,
}

/// Per-connection protocol state machine.
pub struct Engine {
    id: ConnId,
    role: Role,
    phase: Phase,
    transport: Box<dyn Transport>,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    control_queue: VecDeque<Bytes>,
    data_queue: VecDeque<Bytes>,
    partial_message: BytesMut,
    partial_opcode: Option<OpCode>,
    next_read_hint: Option<usize>,
    close_after_write: bool,
    peer_sent_close: bool,
    local_sent_close: bool,
    has_handshake: bool,
    handshake_accepted: bool,
    request: Option<UpgradeRequest>,
    /// Client only: the Sec-WebSocket-Key we sent, kept to check the
    /// server's accept token.
    sent_key: Option<String>,
    remote_addr: Option<SocketAddr>,
    opened: Instant,
    server_id: String,
    config: Config,
}

impl Engine {
    /// Create a server-side engine for a freshly accepted transport.
    pub fn server(
        transport: Box<dyn Transport>,
        remote_addr: Option<SocketAddr>,
        config: Config,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            role: Role::Server,
            phase: Phase::Handshaking,
            transport,
            read_buffer: BytesMut::new(),
            write_buffer: BytesMut::new(),
            control_queue: VecDeque::new(),
            data_queue: VecDeque::new(),
            partial_message: BytesMut::new(),
            partial_opcode: None,
            next_read_hint: None,
            close_after_write: false,
            peer_sent_close: false,
            local_sent_close: false,
            has_handshake: false,
            handshake_accepted: false,
            request: None,
            sent_key: None,
            remote_addr,
            opened: Instant::now(),
            server_id: server_id.into(),
            config,
        }
    }

    /// Create a client-side engine. The upgrade request for `host`/`path`
    /// is staged for transmission immediately.
    pub fn client(transport: Box<dyn Transport>, host: &str, path: &str, config: Config) -> Self {
        let key = handshake::generate_key();
        let request = handshake::build_request(host, path, &key);

        Self {
            id: 0,
            role: Role::Client,
            phase: Phase::Handshaking,
            transport,
            read_buffer: BytesMut::new(),
            write_buffer: BytesMut::from(request.as_ref()),
            control_queue: VecDeque::new(),
            data_queue: VecDeque::new(),
            partial_message: BytesMut::new(),
            partial_opcode: None,
            next_read_hint: None,
            close_after_write: false,
            peer_sent_close: false,
            local_sent_close: false,
            has_handshake: false,
            handshake_accepted: false,
            request: None,
            sent_key: Some(key),
            remote_addr: None,
            opened: Instant::now(),
            server_id: String::new(),
            config,
        }
    }

    /// Connection index. Zero until the driver adopts the engine.
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ConnId) {
        self.id = id;
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    /// Endpoint role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current connection phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the engine was constructed.
    pub fn opened(&self) -> Instant {
        self.opened
    }

    /// The validated upgrade request (server side, after `NewConnection`).
    pub fn request(&self) -> Option<&UpgradeRequest> {
        self.request.as_ref()
    }

    /// Whether a valid upgrade request has been read (server side).
    pub fn has_handshake(&self) -> bool {
        self.has_handshake
    }

    /// Whether the handshake has been accepted, by `accept()` on the
    /// server, by the remote 101 on the client.
    pub fn handshake_accepted(&self) -> bool {
        self.handshake_accepted
    }

    /// Whether the transport has been shut down.
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Whether the closing handshake is underway in either direction.
    pub fn is_disconnecting(&self) -> bool {
        self.peer_sent_close || self.local_sent_close || self.close_after_write
    }

    /// Whether the engine has bytes to put on the wire.
    pub fn wants_write(&self) -> bool {
        if self.phase == Phase::Closed {
            return false;
        }
        !self.write_buffer.is_empty()
            || !self.control_queue.is_empty()
            || !self.data_queue.is_empty()
            || self.close_after_write
    }

    /// File descriptor of the underlying transport.
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.transport.raw_fd()
    }

    // ------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------

    /// Frame `payload` and enqueue it. Control opcodes join the priority
    /// queue; data opcodes queue behind other data.
    pub fn write(&mut self, payload: &[u8], opcode: OpCode, fin: bool) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(Error::InvalidState("connection is closed"));
        }
        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if payload.len() > crate::SMALL_PAYLOAD_THRESHOLD {
                return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
            }
        }

        let frame = self.encode(opcode, payload, fin);
        if opcode.is_control() {
            self.control_queue.push_back(frame);
        } else {
            self.data_queue.push_back(frame);
        }
        Ok(())
    }

    /// Split `payload` into a fragmented message of `frame_size`-byte
    /// frames: the first frame carries `opcode` with FIN clear, the rest
    /// are continuations, the last sets FIN.
    pub fn write_multi(&mut self, payload: &[u8], opcode: OpCode, frame_size: usize) -> Result<()> {
        if !matches!(opcode, OpCode::Text | OpCode::Binary) {
            return Err(Error::InvalidState("write_multi requires a data opcode"));
        }
        if frame_size == 0 {
            return Err(Error::InvalidState("frame size must be nonzero"));
        }
        if self.phase == Phase::Closed {
            return Err(Error::InvalidState("connection is closed"));
        }

        let mut chunks = payload.chunks(frame_size).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let op = if first { opcode } else { OpCode::Continuation };
            let frame = self.encode(op, chunk, last);
            self.data_queue.push_back(frame);
            first = false;
        }
        if first {
            // Empty payload still produces one (empty) final frame.
            let frame = self.encode(opcode, &[], true);
            self.data_queue.push_back(frame);
        }
        Ok(())
    }

    /// Enqueue a Close frame with `code` and `reason`. Does not touch the
    /// transport; pair with [`Engine::close_after_write`] to shut down once
    /// everything has drained.
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if self.phase == Phase::Closed {
            return Err(Error::InvalidState("connection is closed"));
        }
        self.queue_close(code, reason);
        Ok(())
    }

    /// Latch: shut the transport down once every queue and buffer is empty.
    pub fn close_after_write(&mut self) {
        self.close_after_write = true;
    }

    /// Accept a validated upgrade request (server side), optionally
    /// committing to one of the requested subprotocols.
    pub fn accept(&mut self, protocol: Option<&str>) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::InvalidState("accept() is server-side only"));
        }
        if !self.has_handshake {
            return Err(Error::InvalidState("no validated handshake to accept"));
        }
        if self.handshake_accepted {
            return Err(Error::InvalidState("handshake already accepted"));
        }

        let key = match &self.request {
            Some(req) => req.key.as_str(),
            None => return Err(Error::InvalidState("no validated handshake to accept")),
        };
        let token = handshake::accept_key(key);
        let response = handshake::build_accept_response(&token, &self.server_id, protocol);
        self.stage_head(response);
        self.handshake_accepted = true;
        debug!("connection {}: handshake accepted", self.id);
        Ok(())
    }

    /// Reject the connection with an HTTP error response and schedule
    /// teardown once it has been written.
    pub fn deny(&mut self, status: u16) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::InvalidState("deny() is server-side only"));
        }
        if self.phase == Phase::Closed {
            return Err(Error::InvalidState("connection is closed"));
        }
        let response = handshake::build_error_response(status, &self.server_id);
        self.stage_head(response);
        self.close_after_write = true;
        debug!("connection {}: denied with {}", self.id, status);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Consume one transport read and decode whatever it completes,
    /// appending yielded events to `out`.
    pub fn handle_read(&mut self, out: &mut Vec<Update>) {
        if self.phase == Phase::Closed {
            let mut scratch = [0u8; 64];
            if matches!(self.transport.read(&mut scratch), Ok(n) if n > 0) {
                out.push(Update::ReadUnhandled { id: self.id });
            }
            return;
        }

        let want = self
            .next_read_hint
            .unwrap_or(self.config.read_rate)
            .clamp(1, self.config.read_rate);
        let mut chunk = vec![0u8; want];

        match self.transport.read(&mut chunk) {
            Ok(0) => {
                if self.peer_sent_close {
                    out.push(Update::SockDisconnect { id: self.id });
                } else {
                    out.push(Update::ReadUnexpectedDisconnect { id: self.id });
                }
                self.teardown();
            }
            Ok(n) => {
                trace!("connection {}: read {} bytes", self.id, n);
                self.read_buffer.extend_from_slice(&chunk[..n]);
                // Closed is impossible here: the guard above returned.
                if self.phase == Phase::Handshaking {
                    self.process_handshake(out);
                } else {
                    self.process_frames(out);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                out.push(Update::ReadEmpty { id: self.id });
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                out.push(Update::ReadError {
                    id: self.id,
                    error: e,
                });
                self.teardown();
            }
        }
    }

    /// Handshake phase: wait for the request/response head, validate it,
    /// then hand any trailing bytes to the frame decoder.
    fn process_handshake(&mut self, out: &mut Vec<Update>) {
        if self.close_after_write {
            // A denial is already on its way out; drop whatever else the
            // peer has to say.
            self.read_buffer.clear();
            return;
        }

        let head_end = match find_head_end(&self.read_buffer) {
            Some(end) => end,
            None => {
                if self.read_buffer.len() > self.config.max_handshake_length {
                    out.push(Update::HandshakeTooLarge { id: self.id });
                    self.teardown();
                }
                return;
            }
        };
        if head_end > self.config.max_handshake_length {
            out.push(Update::HandshakeTooLarge { id: self.id });
            self.teardown();
            return;
        }

        let head = self.read_buffer.split_to(head_end);

        match self.role {
            Role::Server => match handshake::parse_request(&head) {
                Ok(ServerHandshake::Valid(request)) => {
                    debug!(
                        "connection {}: upgrade request for {:?}",
                        self.id, request.path
                    );
                    self.request = Some(request);
                    self.has_handshake = true;
                    self.phase = Phase::Open;
                    out.push(Update::NewConnection { id: self.id });
                    if !self.read_buffer.is_empty() {
                        self.process_frames(out);
                    }
                }
                Ok(ServerHandshake::Invalid { status }) => {
                    out.push(Update::HandshakeFailure {
                        id: self.id,
                        status,
                    });
                    let response = handshake::build_error_response(status, &self.server_id);
                    self.stage_head(response);
                    self.close_after_write = true;
                }
                Err(_) => {
                    out.push(Update::ReadInvalidHeaders { id: self.id });
                    let response = handshake::build_error_response(400, &self.server_id);
                    self.stage_head(response);
                    self.close_after_write = true;
                }
            },
            Role::Client => match handshake::parse_response(&head) {
                Ok(res) if res.status == 101 => {
                    let expected = self.sent_key.as_deref().map(handshake::accept_key);
                    if let (Some(expected), Some(got)) = (&expected, &res.accept) {
                        if expected != got {
                            debug!("connection {}: accept token mismatch", self.id);
                            out.push(Update::ConnectionDenied { id: self.id });
                            self.teardown();
                            return;
                        }
                    }
                    self.handshake_accepted = true;
                    self.phase = Phase::Open;
                    out.push(Update::ConnectionAccepted { id: self.id });
                    if !self.read_buffer.is_empty() {
                        self.process_frames(out);
                    }
                }
                Ok(res) => {
                    debug!("connection {}: handshake denied with {}", self.id, res.status);
                    out.push(Update::ConnectionDenied { id: self.id });
                    self.teardown();
                }
                Err(_) => {
                    out.push(Update::ReadInvalidHeaders { id: self.id });
                    self.teardown();
                }
            },
        }
    }

    /// Open/Closing phase: decode as many complete frames as the buffer
    /// holds. Stops early on protocol violations.
    fn process_frames(&mut self, out: &mut Vec<Update>) {
        let expect_masked = self.role == Role::Server;
        let mut pings: Vec<Bytes> = Vec::new();
        self.next_read_hint = None;

        loop {
            if self.read_buffer.is_empty() {
                break;
            }

            let header = match decode_header(&self.read_buffer, expect_masked) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    debug!("connection {}: frame decode error: {}", self.id, e);
                    self.protocol_close(CloseReason::PROTOCOL_ERROR, "Protocol error");
                    out.push(Update::ReadProtocolError { id: self.id });
                    break;
                }
            };

            if (header.rsv1 && !self.config.allow_rsv1)
                || (header.rsv2 && !self.config.allow_rsv2)
                || (header.rsv3 && !self.config.allow_rsv3)
            {
                self.protocol_close(CloseReason::PROTOCOL_ERROR, "Unexpected RSV bit set");
                out.push(Update::ReadRsvBitSet { id: self.id });
                break;
            }

            let total = header.frame_len();
            if self.read_buffer.len() < total {
                self.next_read_hint = Some(total - self.read_buffer.len());
                break;
            }

            let mut frame = self.read_buffer.split_to(total);
            let payload = decode_payload(&mut frame, &header);
            trace!(
                "connection {}: frame {:?} fin={} len={}",
                self.id,
                header.opcode,
                header.fin,
                payload.len()
            );

            match header.opcode {
                OpCode::Continuation => {
                    if self.partial_opcode.is_none() {
                        self.protocol_close(
                            CloseReason::PROTOCOL_ERROR,
                            "Continuation without a message",
                        );
                        out.push(Update::ReadProtocolError { id: self.id });
                        break;
                    }
                    self.partial_message.extend_from_slice(&payload);
                    if header.fin && !self.finish_message(out) {
                        break;
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.partial_opcode.is_some() {
                        self.protocol_close(
                            CloseReason::PROTOCOL_ERROR,
                            "Data frame inside a fragmented message",
                        );
                        out.push(Update::ReadInvalidPayload { id: self.id });
                        break;
                    }
                    self.partial_opcode = Some(header.opcode);
                    self.partial_message.extend_from_slice(&payload);
                    if header.fin && !self.finish_message(out) {
                        break;
                    }
                }
                OpCode::Close => self.handle_close_frame(&payload, out),
                OpCode::Ping => {
                    out.push(Update::Ping {
                        id: self.id,
                        payload: payload.clone(),
                    });
                    pings.push(payload);
                }
                OpCode::Pong => {
                    trace!("connection {}: pong received", self.id);
                }
            }
        }

        // Pong replies go out after the whole batch, and not at all once
        // the closing handshake has started.
        if !self.is_disconnecting() {
            for ping in pings {
                let frame = self.encode(OpCode::Pong, &ping, true);
                self.control_queue.push_back(frame);
            }
        }
    }

    /// Complete the buffered message and yield `Read`. Returns false when
    /// the message failed validation and decoding must stop.
    fn finish_message(&mut self, out: &mut Vec<Update>) -> bool {
        let opcode = match self.partial_opcode.take() {
            Some(op) => op,
            None => return true,
        };
        let payload = self.partial_message.split().freeze();

        if opcode == OpCode::Text && !validate_utf8(&payload) {
            self.protocol_close(CloseReason::INVALID_PAYLOAD, "Invalid UTF-8 in text message");
            out.push(Update::ReadInvalidPayload { id: self.id });
            return false;
        }

        out.push(Update::Read {
            id: self.id,
            opcode,
            payload,
        });
        true
    }

    /// React to a received Close frame: validate its payload, echo or
    /// remap, and record the peer's intent.
    fn handle_close_frame(&mut self, payload: &[u8], out: &mut Vec<Update>) {
        let (code, reason) = if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason_bytes = &payload[2..];
            if !CloseReason::is_valid_code(code) || !validate_utf8(reason_bytes) {
                (CloseReason::PROTOCOL_ERROR, "Invalid close frame".to_owned())
            } else {
                (code, String::from_utf8_lossy(reason_bytes).into_owned())
            }
        } else {
            (CloseReason::NORMAL, String::new())
        };

        debug!("connection {}: close received ({})", self.id, code);

        if !self.local_sent_close {
            self.queue_close(code, &reason);
        }
        self.peer_sent_close = true;
        if self.phase == Phase::Open {
            self.phase = Phase::Closing;
        }
        if self.role == Role::Server {
            self.close_after_write = true;
        }

        out.push(Update::ReadDisconnect {
            id: self.id,
            code,
            reason,
        });
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Drain up to one write-rate's worth of outbound bytes. At most one
    /// error event is appended to `out`.
    pub fn handle_write(&mut self, out: &mut Vec<Update>) {
        if self.phase == Phase::Closed {
            return;
        }

        if self.write_buffer.is_empty() {
            // Strict priority: any queued control frame goes before any
            // queued data frame. Frames already in the write buffer are
            // atomic and are never preempted.
            if let Some(next) = self
                .control_queue
                .pop_front()
                .or_else(|| self.data_queue.pop_front())
            {
                self.write_buffer.extend_from_slice(&next);
            }
        }

        if !self.write_buffer.is_empty() {
            let n = self.write_buffer.len().min(self.config.write_rate);
            match self.transport.write(&self.write_buffer[..n]) {
                Ok(written) => {
                    trace!("connection {}: wrote {} bytes", self.id, written);
                    self.write_buffer.advance(written);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    out.push(Update::WriteError {
                        id: self.id,
                        error: e,
                    });
                    self.teardown();
                    return;
                }
            }
        }

        if self.close_after_write
            && self.write_buffer.is_empty()
            && self.control_queue.is_empty()
            && self.data_queue.is_empty()
        {
            debug!("connection {}: output drained, closing", self.id);
            self.teardown();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn encode(&self, opcode: OpCode, payload: &[u8], fin: bool) -> Bytes {
        let mask = match self.role {
            Role::Client => Some(generate_mask()),
            Role::Server => None,
        };
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, mask);
        buf.freeze()
    }

    fn queue_close(&mut self, code: u16, reason: &str) {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        let frame = self.encode(OpCode::Close, &payload, true);
        self.control_queue.push_back(frame);
        self.local_sent_close = true;
        if self.phase == Phase::Open {
            self.phase = Phase::Closing;
        }
    }

    /// Close with `code` and latch teardown, as required for every
    /// in-engine protocol violation.
    fn protocol_close(&mut self, code: u16, reason: &str) {
        if !self.local_sent_close {
            self.queue_close(code, reason);
        }
        self.close_after_write = true;
        if self.phase == Phase::Open {
            self.phase = Phase::Closing;
        }
    }

    /// Put an HTTP head (101 or error body) on the wire ahead of any
    /// queued frame.
    fn stage_head(&mut self, head: Bytes) {
        if self.write_buffer.is_empty() {
            self.write_buffer.extend_from_slice(&head);
        } else {
            self.control_queue.push_front(head);
        }
    }

    fn teardown(&mut self) {
        let _ = self.transport.close();
        self.phase = Phase::Closed;
    }
}

/// Index one past the `\r\n\r\n` head terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

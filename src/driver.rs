// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The driver state machine: the single entry point that ties the handshake, frame
//! codecs and message assembler together into a byte-stream-in/byte-stream-out protocol
//! engine.
//!
//! A [`Driver`] never touches a socket. It is fed inbound bytes through [`Driver::parse`]
//! and writes outbound bytes through whatever [`WriteBytes`] sink it was built with;
//! everything it learns along the way — the handshake completing, a message arriving, a
//! ping needing a pong, the connection closing — is reported through an [`EventSink`].

use crate::assembler::Assembler;
use crate::buffer::{ByteBuffer, Parsing};
use crate::data::{Message, PendingPings, PongCallback};
use crate::domain::DomainCheck;
use crate::event::{Event, EventSink, WriteBytes};
use crate::frame::{hixie, hybi};
use crate::handshake::{self, hixie75, hixie76, hybi as hs_hybi, Variant};
use crate::opcode::OpCode;
use std::collections::VecDeque;
use std::fmt;

/// Default maximum size, in bytes, of a single frame or a fully reassembled message.
pub const DEFAULT_MAX_SIZE: u64 = 256 * 1024 * 1024;

/// The driver's position in the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The opening handshake hasn't completed yet. Sends are queued, not written.
    Connecting,
    /// The handshake completed; messages may be sent and received.
    Open,
    /// A close handshake is in progress: we've sent or received a close frame, not both.
    Closing,
    /// The connection is fully closed. The driver accepts no further input.
    Closed
}

/// Configuration shared by every variant, set before the driver starts.
#[derive(Debug, Clone)]
pub struct Config {
    max_message_size: u64,
    max_frame_size: u64,
    protocols: Vec<String>,
    origin_policy: DomainCheck<String>
}

impl Config {
    /// Defaults: 256 MiB size limits, no subprotocols offered/accepted, any origin allowed.
    pub fn new() -> Self {
        Config {
            max_message_size: DEFAULT_MAX_SIZE,
            max_frame_size: DEFAULT_MAX_SIZE,
            protocols: Vec::new(),
            origin_policy: DomainCheck::AllowAny
        }
    }

    /// Cap the size of a single reassembled message. Exceeding it closes with code 1009.
    pub fn max_message_size(mut self, n: u64) -> Self {
        self.max_message_size = n;
        self
    }

    /// Cap the size of a single frame. Exceeding it closes with code 1009.
    pub fn max_frame_size(mut self, n: u64) -> Self {
        self.max_frame_size = n;
        self
    }

    /// Subprotocols this side offers (client) or accepts, in preference order (server).
    pub fn protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    /// The origin/host access-control policy applied during the server handshake.
    pub fn origin_policy(mut self, policy: DomainCheck<String>) -> Self {
        self.origin_policy = policy;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

enum Role {
    Server,
    Client { host: String, resource: String }
}

enum HandshakeState {
    ServerPending,
    ServerHixie76(hixie76::ServerHandshake),
    ClientHybiPending(hs_hybi::ClientHandshake),
    ClientHixie76Pending(hixie76::ClientHandshake),
    ClientHixie75Pending
}

enum QueuedSend {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>, Option<PongCallback>),
    Pong(Vec<u8>),
    Close(u16, String)
}

/// An error surfaced by the driver. Every variant maps to a close code via
/// [`DriverError::close_code`], which the driver uses to build the outgoing close frame
/// (Hybi) or simply to report in the [`Event::Close`] it emits (Hixie).
#[derive(Debug)]
pub enum DriverError {
    /// The opening handshake failed.
    Handshake(handshake::Error),
    /// A Hybi frame was malformed.
    Frame(hybi::Error),
    /// A Hixie frame was malformed.
    HixieFrame(hixie::Error),
    /// A message violated the fragmentation rules or wasn't valid UTF-8.
    Assembly(crate::assembler::Error),
    /// A single frame or fully reassembled message exceeded the configured size limit.
    MessageTooLarge {
        /// The size that was rejected.
        size: u64,
        /// The configured maximum.
        maximum: u64
    },
    /// An operation was attempted that the current [`ReadyState`] doesn't allow, e.g.
    /// calling [`Driver::parse`] after the connection closed.
    InvalidState,
    /// A peer's close frame carried a code outside the ranges RFC 6455 permits on the
    /// wire (a 1-byte body, or one of the reserved codes 1004/1005/1006/1015).
    InvalidCloseCode(u16)
}

impl DriverError {
    /// The close code this error should be reported/sent with.
    pub fn close_code(&self) -> u16 {
        match self {
            DriverError::Handshake(_) => 1002,
            DriverError::Frame(e) => e.close_code(),
            DriverError::HixieFrame(_) => 1002,
            DriverError::Assembly(e) => e.close_code(),
            DriverError::MessageTooLarge { .. } => 1009,
            DriverError::InvalidState => 1011,
            DriverError::InvalidCloseCode(_) => 1002
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Handshake(e) => write!(f, "handshake failed: {}", e),
            DriverError::Frame(e) => write!(f, "frame error: {}", e),
            DriverError::HixieFrame(e) => write!(f, "frame error: {}", e),
            DriverError::Assembly(e) => write!(f, "message assembly error: {}", e),
            DriverError::MessageTooLarge { size, maximum } => write!(f, "message too large: {} > {}", size, maximum),
            DriverError::InvalidState => f.write_str("operation not valid in the current state"),
            DriverError::InvalidCloseCode(c) => write!(f, "close code {} must not appear on the wire", c)
        }
    }
}

impl std::error::Error for DriverError {}

/// The protocol driver.
///
/// Construct one with [`Driver::server`] or [`Driver::client`], feed it inbound bytes
/// with [`Driver::parse`], and issue outbound sends with [`Driver::text`],
/// [`Driver::binary`], [`Driver::ping`] and [`Driver::close`]. Every send before the
/// handshake completes is queued and flushed, in order, immediately after the `Open`
/// event is emitted.
pub struct Driver {
    role: Role,
    config: Config,
    state: ReadyState,
    variant: Option<Variant>,
    handshake: HandshakeState,
    inbound: ByteBuffer,
    assembler: Assembler,
    pending_pings: PendingPings,
    outbound_queue: VecDeque<QueuedSend>,
    protocol: Option<String>,
    hybi_version: Option<u8>,
    close_sent: bool,
    close_received: bool,
    local_close_code: Option<u16>
}

impl Driver {
    /// A driver that will accept an incoming opening handshake of any of the three
    /// variants, detected from the request's headers.
    pub fn server(config: Config) -> Self {
        Driver {
            role: Role::Server,
            config,
            state: ReadyState::Connecting,
            variant: None,
            handshake: HandshakeState::ServerPending,
            inbound: ByteBuffer::new(),
            assembler: Assembler::new(),
            pending_pings: PendingPings::new(),
            outbound_queue: VecDeque::new(),
            protocol: None,
            hybi_version: None,
            close_sent: false,
            close_received: false,
            local_close_code: None
        }
    }

    /// A driver that will perform the RFC 6455 (Hybi) client handshake against `host`.
    pub fn client(config: Config, host: impl Into<String>, resource: impl Into<String>) -> Self {
        Driver {
            role: Role::Client { host: host.into(), resource: resource.into() },
            config,
            state: ReadyState::Connecting,
            variant: Some(Variant::Hybi),
            handshake: HandshakeState::ClientHybiPending(hs_hybi::ClientHandshake::new()),
            inbound: ByteBuffer::new(),
            assembler: Assembler::new(),
            pending_pings: PendingPings::new(),
            outbound_queue: VecDeque::new(),
            protocol: None,
            hybi_version: Some(13),
            close_sent: false,
            close_received: false,
            local_close_code: None
        }
    }

    /// A driver that will perform the legacy Hixie-76 client handshake against `host`.
    pub fn client_hixie76(config: Config, host: impl Into<String>, resource: impl Into<String>) -> Self {
        Driver {
            role: Role::Client { host: host.into(), resource: resource.into() },
            config,
            state: ReadyState::Connecting,
            variant: Some(Variant::Hixie76),
            handshake: HandshakeState::ClientHixie76Pending(hixie76::ClientHandshake::new()),
            inbound: ByteBuffer::new(),
            assembler: Assembler::new(),
            pending_pings: PendingPings::new(),
            outbound_queue: VecDeque::new(),
            protocol: None,
            hybi_version: None,
            close_sent: false,
            close_received: false,
            local_close_code: None
        }
    }

    /// A driver that will perform the legacy Hixie-75 client handshake against `host`.
    pub fn client_hixie75(config: Config, host: impl Into<String>, resource: impl Into<String>) -> Self {
        Driver {
            role: Role::Client { host: host.into(), resource: resource.into() },
            config,
            state: ReadyState::Connecting,
            variant: Some(Variant::Hixie75),
            handshake: HandshakeState::ClientHixie75Pending,
            inbound: ByteBuffer::new(),
            assembler: Assembler::new(),
            pending_pings: PendingPings::new(),
            outbound_queue: VecDeque::new(),
            protocol: None,
            hybi_version: None,
            close_sent: false,
            close_received: false,
            local_close_code: None
        }
    }

    /// The current connection state.
    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// The variant/version string per the spec's `version()` operation: `"hixie-75"`,
    /// `"hixie-76"`, or `"hybi-$N"` (`$N` is 8 or 13). `None` until the variant is known
    /// (a server driver that hasn't yet seen enough of the opening request).
    pub fn version(&self) -> Option<String> {
        match self.variant? {
            Variant::Hixie75 => Some("hixie-75".to_string()),
            Variant::Hixie76 => Some("hixie-76".to_string()),
            Variant::Hybi => Some(format!("hybi-{}", self.hybi_version.unwrap_or(13)))
        }
    }

    /// The negotiated protocol variant, once known (after the handshake begins on the
    /// server side, or immediately for a client, which chooses its variant up front).
    pub fn variant(&self) -> Option<Variant> {
        self.variant
    }

    /// The negotiated subprotocol, once the handshake has completed.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Write the client opening handshake request. Only meaningful for a client driver;
    /// a no-op for a server driver (which instead waits for a request via [`Driver::parse`]).
    pub fn start(&mut self, sink: &mut impl WriteBytes) {
        if let Role::Client { host, resource } = &self.role {
            let mut out = Vec::new();
            match &self.handshake {
                HandshakeState::ClientHybiPending(hs) => hs.build_request(host, resource, &self.config.protocols, &mut out),
                HandshakeState::ClientHixie76Pending(hs) => hs.build_request(host, resource, &mut out),
                HandshakeState::ClientHixie75Pending => {
                    out.extend_from_slice(b"GET ");
                    out.extend_from_slice(resource.as_bytes());
                    out.extend_from_slice(b" HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nHost: ");
                    out.extend_from_slice(host.as_bytes());
                    out.extend_from_slice(b"\r\n\r\n");
                }
                HandshakeState::ServerPending | HandshakeState::ServerHixie76(_) => unreachable!("client role never holds server handshake state")
            }
            sink.write(&out);
        }
    }

    /// Queue a text message, or send it immediately if the connection is already open.
    pub fn text(&mut self, text: impl Into<String>, sink: &mut impl WriteBytes) {
        self.send_or_queue(QueuedSend::Text(text.into()), sink);
    }

    /// Queue a binary message, or send it immediately if the connection is already open.
    pub fn binary(&mut self, data: impl Into<Vec<u8>>, sink: &mut impl WriteBytes) {
        self.send_or_queue(QueuedSend::Binary(data.into()), sink);
    }

    /// Queue a ping, or send it immediately if the connection is already open. `callback`,
    /// if given, runs once a matching pong is observed.
    pub fn ping(&mut self, payload: impl Into<Vec<u8>>, callback: Option<PongCallback>, sink: &mut impl WriteBytes) {
        self.send_or_queue(QueuedSend::Ping(payload.into(), callback), sink);
    }

    /// Begin the close handshake: send a close frame (Hybi) or the close signal (Hixie-76)
    /// and move to `Closing`, or, if a close was already received, finish closing now.
    pub fn close(&mut self, code: u16, reason: impl Into<String>, sink: &mut impl WriteBytes) {
        if self.state == ReadyState::Closed {
            return
        }
        if self.state == ReadyState::Connecting {
            self.outbound_queue.push_back(QueuedSend::Close(code, reason.into()));
            return
        }
        self.send_close(code, &reason.into(), sink);
    }

    fn send_or_queue(&mut self, send: QueuedSend, sink: &mut impl WriteBytes) {
        match self.state {
            ReadyState::Connecting => self.outbound_queue.push_back(send),
            ReadyState::Open => self.write_send(send, sink),
            ReadyState::Closing | ReadyState::Closed => {}
        }
    }

    fn write_send(&mut self, send: QueuedSend, sink: &mut impl WriteBytes) {
        let is_client = matches!(self.role, Role::Client { .. });
        let mut out = Vec::new();
        match send {
            QueuedSend::Text(text) => {
                match self.variant {
                    Some(Variant::Hybi) => hybi::encode(OpCode::Text, true, text.as_bytes(), is_client, &mut out),
                    Some(Variant::Hixie75) | Some(Variant::Hixie76) => hixie::encode_text(text.as_bytes(), &mut out),
                    None => return
                }
                sink.write(&out);
            }
            QueuedSend::Binary(data) => {
                if let Some(Variant::Hybi) = self.variant {
                    hybi::encode(OpCode::Binary, true, &data, is_client, &mut out);
                    sink.write(&out);
                }
                // Hixie-75/76 have no binary message framing; silently dropped, matching
                // the variant's actual wire capability.
            }
            QueuedSend::Ping(payload, callback) => {
                if let Some(Variant::Hybi) = self.variant {
                    hybi::encode(OpCode::Ping, true, &payload, is_client, &mut out);
                    self.pending_pings.push(payload, callback);
                    sink.write(&out);
                }
            }
            QueuedSend::Pong(payload) => {
                if let Some(Variant::Hybi) = self.variant {
                    hybi::encode(OpCode::Pong, true, &payload, is_client, &mut out);
                    sink.write(&out);
                }
            }
            QueuedSend::Close(code, reason) => self.send_close(code, &reason, sink)
        }
    }

    fn send_close(&mut self, code: u16, reason: &str, sink: &mut impl WriteBytes) {
        if self.close_sent {
            return
        }
        log::trace!("sending close frame: code = {}", code);
        self.local_close_code = Some(code);
        let is_client = matches!(self.role, Role::Client { .. });
        match self.variant {
            Some(Variant::Hybi) => {
                let mut payload = code.to_be_bytes().to_vec();
                payload.extend_from_slice(reason.as_bytes());
                let mut out = Vec::new();
                hybi::encode(OpCode::Close, true, &payload, is_client, &mut out);
                sink.write(&out);
            }
            Some(Variant::Hixie76) => {
                sink.write(&[0xff, 0x00]);
            }
            Some(Variant::Hixie75) | None => {}
        }
        self.close_sent = true;
        if self.close_received || self.variant != Some(Variant::Hybi) {
            self.state = ReadyState::Closed;
        } else {
            self.state = ReadyState::Closing;
        }
    }

    fn flush_queue(&mut self, sink: &mut impl WriteBytes) {
        let queued: Vec<QueuedSend> = self.outbound_queue.drain(..).collect();
        for send in queued {
            self.write_send(send, sink);
        }
    }

    /// Feed newly-arrived bytes into the driver. Drives the handshake to completion, then
    /// decodes frames, assembles messages and reports everything through `events`,
    /// writing any reply bytes (handshake response, pong, close) through `sink`.
    pub fn parse(&mut self, bytes: &[u8], sink: &mut impl WriteBytes, events: &mut impl EventSink) {
        if self.state == ReadyState::Closed {
            return
        }
        self.inbound.extend(bytes);

        if self.state == ReadyState::Connecting {
            match self.drive_handshake(sink, events) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.fail(e, sink, events);
                    return
                }
            }
        }

        self.drive_frames(sink, events);
    }

    /// Returns `Ok(true)` once the handshake has completed (or failed), `Ok(false)` if
    /// more bytes are still needed.
    fn drive_handshake(&mut self, sink: &mut impl WriteBytes, events: &mut impl EventSink) -> Result<bool, DriverError> {
        match &self.role {
            Role::Server => self.drive_server_handshake(sink, events),
            Role::Client { .. } => self.drive_client_handshake(sink, events)
        }
    }

    fn drive_server_handshake(&mut self, sink: &mut impl WriteBytes, events: &mut impl EventSink) -> Result<bool, DriverError> {
        if self.variant.is_none() {
            let data = self.inbound.peek_n(self.inbound.len());
            match handshake::detect_variant(data).map_err(DriverError::Handshake)? {
                Parsing::NeedMore => return Ok(false),
                Parsing::Done { value, .. } => {
                    self.variant = Some(value);
                    if value == Variant::Hixie76 {
                        self.handshake = HandshakeState::ServerHixie76(hixie76::ServerHandshake::new());
                    }
                }
            }
        }

        let data = self.inbound.peek_n(self.inbound.len()).to_vec();
        match self.variant.expect("set above") {
            Variant::Hybi => match hs_hybi::parse_request(&data).map_err(DriverError::Handshake)? {
                Parsing::NeedMore => Ok(false),
                Parsing::Done { value, offset } => {
                    let protocol = hs_hybi::negotiate_protocol(&value.protocols, &self.config.protocols);
                    if let Some(origin) = &value.origin {
                        if !self.config.origin_policy.is_allowed(origin.as_bytes()) {
                            return Err(DriverError::Handshake(handshake::Error::ForbiddenOrigin))
                        }
                    }
                    let mut out = Vec::new();
                    hs_hybi::build_response(&value.key, protocol.as_deref(), &mut out);
                    sink.write(&out);
                    self.protocol = protocol;
                    self.hybi_version = Some(value.version);
                    self.inbound.consume(offset);
                    self.open(sink, events);
                    Ok(true)
                }
            },
            Variant::Hixie76 => {
                let hs = match &mut self.handshake {
                    HandshakeState::ServerHixie76(hs) => hs,
                    _ => unreachable!("variant Hixie76 always carries ServerHixie76 handshake state")
                };
                match hs.parse(&data).map_err(DriverError::Handshake)? {
                    Parsing::NeedMore => Ok(false),
                    Parsing::Done { value, offset } => {
                        if let Some(origin) = &value.origin {
                            if !self.config.origin_policy.is_allowed(origin.as_bytes()) {
                                return Err(DriverError::Handshake(handshake::Error::ForbiddenOrigin))
                            }
                        }
                        let response = value.challenge_response().map_err(DriverError::Handshake)?;
                        let origin = value.origin.clone().unwrap_or_default();
                        let location = format!("ws://{}{}", value.host.clone().unwrap_or_default(), value.resource);
                        let mut out = Vec::new();
                        hixie76::build_response(&origin, &location, &response, &mut out);
                        sink.write(&out);
                        self.inbound.consume(offset);
                        self.open(sink, events);
                        Ok(true)
                    }
                }
            }
            Variant::Hixie75 => match hixie75::parse_request(&data).map_err(DriverError::Handshake)? {
                Parsing::NeedMore => Ok(false),
                Parsing::Done { value, offset } => {
                    if let Some(origin) = &value.origin {
                        if !self.config.origin_policy.is_allowed(origin.as_bytes()) {
                            return Err(DriverError::Handshake(handshake::Error::ForbiddenOrigin))
                        }
                    }
                    let origin = value.origin.clone().unwrap_or_default();
                    let location = format!("ws://{}{}", value.host.clone().unwrap_or_default(), value.resource);
                    let mut out = Vec::new();
                    hixie75::build_response(&origin, &location, &mut out);
                    sink.write(&out);
                    self.inbound.consume(offset);
                    self.open(sink, events);
                    Ok(true)
                }
            }
        }
    }

    fn drive_client_handshake(&mut self, sink: &mut impl WriteBytes, events: &mut impl EventSink) -> Result<bool, DriverError> {
        let data = self.inbound.peek_n(self.inbound.len()).to_vec();
        match &self.handshake {
            HandshakeState::ClientHybiPending(hs) => match hs.parse_response(&data, &self.config.protocols).map_err(DriverError::Handshake)? {
                Parsing::NeedMore => Ok(false),
                Parsing::Done { value, offset } => {
                    self.protocol = value.protocol;
                    self.inbound.consume(offset);
                    self.open(sink, events);
                    Ok(true)
                }
            },
            HandshakeState::ClientHixie76Pending(hs) => {
                // The server's response body (the 16-byte MD5 digest) follows the header
                // block's blank line with no length framing of its own, so we look for the
                // blank line first, then require 16 more bytes after it.
                match find_header_end(&data) {
                    None => Ok(false),
                    Some(header_end) => {
                        if data.len() < header_end + 16 {
                            return Ok(false)
                        }
                        let digest = &data[header_end..header_end + 16];
                        if !hs.verify_response(digest).map_err(DriverError::Handshake)? {
                            return Err(DriverError::Handshake(handshake::Error::InvalidSecWebSocketAccept))
                        }
                        self.inbound.consume(header_end + 16);
                        self.open(sink, events);
                        Ok(true)
                    }
                }
            }
            HandshakeState::ClientHixie75Pending => match find_header_end(&data) {
                None => Ok(false),
                Some(header_end) => {
                    self.inbound.consume(header_end);
                    self.open(sink, events);
                    Ok(true)
                }
            },
            HandshakeState::ServerPending | HandshakeState::ServerHixie76(_) => unreachable!("client role never holds server handshake state")
        }
    }

    fn open(&mut self, sink: &mut impl WriteBytes, events: &mut impl EventSink) {
        log::debug!("handshake complete: variant = {:?}, protocol = {:?}", self.variant, self.protocol);
        self.state = ReadyState::Open;
        events.on_event(Event::Open { protocol: self.protocol.clone() });
        self.flush_queue(sink);
    }

    fn drive_frames(&mut self, sink: &mut impl WriteBytes, events: &mut impl EventSink) {
        loop {
            if self.state == ReadyState::Closed {
                return
            }
            let data = self.inbound.peek_n(self.inbound.len()).to_vec();
            if data.is_empty() {
                return
            }
            let result = match self.variant {
                Some(Variant::Hybi) => self.step_hybi(&data, sink, events),
                Some(Variant::Hixie75) | Some(Variant::Hixie76) => self.step_hixie(&data, sink, events),
                None => return
            };
            match result {
                Ok(Some(offset)) => self.inbound.consume(offset),
                Ok(None) => return,
                Err(e) => {
                    self.fail(e, sink, events);
                    return
                }
            }
        }
    }

    fn step_hybi(&mut self, data: &[u8], sink: &mut impl WriteBytes, events: &mut impl EventSink) -> Result<Option<usize>, DriverError> {
        let is_server = matches!(self.role, Role::Server);
        match hybi::decode(data, is_server, self.config.max_frame_size).map_err(DriverError::Frame)? {
            Parsing::NeedMore => Ok(None),
            Parsing::Done { value: frame, offset } => {
                log::trace!("recv frame: opcode = {:?}, fin = {}, len = {}", frame.opcode, frame.fin, frame.payload.len());
                if self.state == ReadyState::Closing && frame.opcode != OpCode::Close {
                    log::debug!("frame received while closing, forcing connection closed");
                    self.state = ReadyState::Closed;
                    events.on_event(Event::Close { code: self.local_close_code.unwrap_or(1000), reason: String::new() });
                    return Ok(Some(offset))
                }
                match frame.opcode {
                    OpCode::Ping => {
                        events.on_event(Event::Ping(frame.payload.clone()));
                        self.write_send(QueuedSend::Pong(frame.payload), sink);
                    }
                    OpCode::Pong => {
                        self.pending_pings.resolve(&frame.payload);
                        events.on_event(Event::Pong(frame.payload));
                    }
                    OpCode::Close => {
                        if frame.payload.len() == 1 {
                            log::warn!("close frame with a 1-byte payload (no room for a code)");
                            return Err(DriverError::InvalidCloseCode(0))
                        }
                        let (code, reason) = decode_close_payload(&frame.payload);
                        if !frame.payload.is_empty() && !is_valid_close_code(code) {
                            log::warn!("close frame carried a code that must not appear on the wire: {}", code);
                            return Err(DriverError::InvalidCloseCode(code))
                        }
                        self.close_received = true;
                        log::debug!("peer close frame: code = {}", code);
                        events.on_event(Event::Close { code, reason: reason.clone() });
                        if !self.close_sent {
                            // 1005 is synthesized for the embedder, not a real wire value;
                            // echo 1000 when the peer sent no code of its own.
                            let echo_code = if frame.payload.is_empty() { 1000 } else { code };
                            self.send_close(echo_code, &reason, sink);
                        } else {
                            self.state = ReadyState::Closed;
                        }
                    }
                    OpCode::Text | OpCode::Binary | OpCode::Continue => {
                        let size = self.assembler.buffered_len() as u64 + frame.payload.len() as u64;
                        if size > self.config.max_message_size {
                            log::warn!("accumulated message length {} exceeds maximum {}", size, self.config.max_message_size);
                            return Err(DriverError::MessageTooLarge { size, maximum: self.config.max_message_size })
                        }
                        if let Some(message) = self.assembler.push(frame.opcode, frame.fin, frame.payload).map_err(DriverError::Assembly)? {
                            events.on_event(Event::Message(message));
                        }
                    }
                    OpCode::Reserved(_) => return Err(DriverError::Frame(hybi::Error::UnknownOpCode))
                }
                Ok(Some(offset))
            }
        }
    }

    fn step_hixie(&mut self, data: &[u8], sink: &mut impl WriteBytes, events: &mut impl EventSink) -> Result<Option<usize>, DriverError> {
        match hixie::decode(data).map_err(DriverError::HixieFrame)? {
            Parsing::NeedMore => Ok(None),
            Parsing::Done { value: frame, offset } => {
                log::trace!("recv hixie frame: {:?}", frame);
                match frame {
                    hixie::Frame::Text(payload) => {
                        crate::utf8::validate(&payload).map_err(|e| DriverError::Assembly(crate::assembler::Error::InvalidUtf8(e)))?;
                        let text = String::from_utf8(payload).expect("just validated as utf-8");
                        events.on_event(Event::Message(Message::Text(text)));
                    }
                    hixie::Frame::Data(_) => {
                        // No Hixie binary message concept; nothing to deliver.
                    }
                    hixie::Frame::Close => {
                        self.close_received = true;
                        events.on_event(Event::Close { code: 1000, reason: String::new() });
                        if !self.close_sent {
                            self.send_close(1000, "", sink);
                        } else {
                            self.state = ReadyState::Closed;
                        }
                    }
                }
                Ok(Some(offset))
            }
        }
    }

    fn fail(&mut self, error: DriverError, sink: &mut impl WriteBytes, events: &mut impl EventSink) {
        let code = error.close_code();
        log::warn!("closing connection due to error: {}", error);
        events.on_event(Event::Error(error.to_string()));
        if !self.close_sent {
            self.send_close(code, "", sink);
        }
        events.on_event(Event::Close { code, reason: String::new() });
        self.state = ReadyState::Closed;
    }
}

/// Is `code` one RFC 6455 allows a peer to actually put on the wire? 1004, 1005 and 1006
/// are reserved for internal/synthesized use only and must never be sent in a close
/// frame; 1015 (TLS handshake failure) is likewise synthesized, never sent.
fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Decode a close frame's payload into the code/reason to report to the embedder. An
/// empty payload means the peer sent no code at all, which is reported as the
/// synthesized 1005 ("no status code present") rather than a real wire value.
fn decode_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.is_empty() {
        return (1005, String::new())
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventLog;

    fn init_logging() {
        let _ = env_logger::try_init();
    }

    #[test]
    fn hybi_accept_key_end_to_end_handshake() {
        init_logging();
        let mut server = Driver::server(Config::new());
        let request = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
                         Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                         Sec-WebSocket-Version: 13\r\n\r\n";
        let mut written = Vec::new();
        let mut log = EventLog::default();
        server.parse(request, &mut |b: &[u8]| written.extend_from_slice(b), &mut log);

        assert_eq!(server.ready_state(), ReadyState::Open);
        let response = String::from_utf8(written).unwrap();
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(matches!(log.0[0], Event::Open { .. }));
        assert_eq!(server.version().as_deref(), Some("hybi-13"));
    }

    #[test]
    fn version_reflects_each_variant() {
        assert_eq!(Driver::client(Config::new(), "x", "/").version().as_deref(), Some("hybi-13"));
        assert_eq!(Driver::client_hixie76(Config::new(), "x", "/").version().as_deref(), Some("hixie-76"));
        assert_eq!(Driver::client_hixie75(Config::new(), "x", "/").version().as_deref(), Some("hixie-75"));
        assert_eq!(Driver::server(Config::new()).version(), None);
    }

    #[test]
    fn masked_text_frame_is_delivered_as_a_message() {
        let mut server = Driver::server(Config::new());
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let mut sink = |_: &[u8]| {};
        let mut log = EventLog::default();
        server.parse(request, &mut sink, &mut log);

        let frame = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        server.parse(&frame, &mut sink, &mut log);

        assert_eq!(log.0.last(), Some(&Event::Message(Message::Text("Hello".into()))));
    }

    #[test]
    fn queued_send_before_open_is_flushed_immediately_after() {
        let mut driver = Driver::client(Config::new(), "example.com", "/");
        let mut written = Vec::new();
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            driver.text("a", &mut sink);
        }
        assert!(driver.outbound_queue.len() == 1 || written.is_empty());

        let key = match &driver.handshake {
            HandshakeState::ClientHybiPending(hs) => hs.key().to_string(),
            _ => panic!("expected a pending hybi client handshake")
        };
        let mut response = Vec::new();
        hs_hybi::build_response(&key, None, &mut response);

        written.clear();
        let mut log = EventLog::default();
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            driver.parse(&response, &mut sink, &mut log);
        }

        assert_eq!(driver.ready_state(), ReadyState::Open);
        // The queued "a" text frame should have gone out right after the handshake
        // response was processed, unmasked-check aside (client frames are masked).
        assert!(!written.is_empty());
    }

    #[test]
    fn close_handshake_echoes_and_completes() {
        let mut server = Driver::server(Config::new());
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let mut written = Vec::new();
        let mut log = EventLog::default();
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.parse(request, &mut sink, &mut log);
        }

        written.clear();
        // Masked (client-to-server) close frame, code 1000, no reason, mask key all zero.
        let close_frame = [0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xe8];
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.parse(&close_frame, &mut sink, &mut log);
        }

        assert_eq!(server.ready_state(), ReadyState::Closed);
        assert_eq!(written[0], 0x88);
        assert!(log.0.iter().any(|e| matches!(e, Event::Close { code: 1000, .. })));
    }

    #[test]
    fn hixie76_server_handshake_completes_with_challenge_response() {
        let mut server = Driver::server(Config::new());
        let head = b"GET /demo HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\
                      Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\nSec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n";
        let mut full = head.to_vec();
        full.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);

        let mut written = Vec::new();
        let mut log = EventLog::default();
        let mut sink = |b: &[u8]| written.extend_from_slice(b);
        server.parse(&full, &mut sink, &mut log);

        assert_eq!(server.ready_state(), ReadyState::Open);
        assert!(written.ends_with(&[0x3f, 0x4a, 0xe6, 0xb5, 0xf6, 0xf2, 0xb2, 0xb6, 0xaa, 0x3c, 0x6e, 0x0f, 0x6f, 0xe3, 0xb4, 0xa5]));
    }

    fn open_server() -> Driver {
        let mut server = Driver::server(Config::new());
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let mut sink = |_: &[u8]| {};
        let mut log = EventLog::default();
        server.parse(request, &mut sink, &mut log);
        server
    }

    #[test]
    fn reserved_close_code_is_rejected_with_protocol_error() {
        let mut server = open_server();
        let mut written = Vec::new();
        let mut log = EventLog::default();
        // Masked close frame carrying reserved code 1005.
        let close_frame = [0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xed];
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.parse(&close_frame, &mut sink, &mut log);
        }
        assert_eq!(server.ready_state(), ReadyState::Closed);
        assert!(log.0.iter().any(|e| matches!(e, Event::Close { code: 1002, .. })));
    }

    #[test]
    fn one_byte_close_payload_is_a_protocol_error() {
        let mut server = open_server();
        let mut written = Vec::new();
        let mut log = EventLog::default();
        let close_frame = [0x88, 0x81, 0x00, 0x00, 0x00, 0x00, 0x03];
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.parse(&close_frame, &mut sink, &mut log);
        }
        assert_eq!(server.ready_state(), ReadyState::Closed);
        assert!(log.0.iter().any(|e| matches!(e, Event::Close { code: 1002, .. })));
    }

    #[test]
    fn empty_close_payload_reports_1005_but_echoes_1000_on_the_wire() {
        let mut server = open_server();
        let mut written = Vec::new();
        let mut log = EventLog::default();
        // Masked close frame with a zero-length payload: no code on the wire at all.
        let close_frame = [0x88, 0x80, 0x00, 0x00, 0x00, 0x00];
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.parse(&close_frame, &mut sink, &mut log);
        }
        assert_eq!(server.ready_state(), ReadyState::Closed);
        assert!(log.0.iter().any(|e| matches!(e, Event::Close { code: 1005, .. })));
        // The echoed close frame must never carry 1005 on the wire.
        assert_eq!(&written[2..4], &1000_u16.to_be_bytes());
    }

    #[test]
    fn frame_received_while_closing_forces_the_connection_closed() {
        init_logging();
        let mut server = open_server();
        let mut written = Vec::new();
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.close(1000, "bye", &mut sink);
        }
        assert_eq!(server.ready_state(), ReadyState::Closing);

        // Masked text frame "x" sent by the peer instead of a matching close frame.
        let text_frame = [0x81, 0x81, 0x00, 0x00, 0x00, 0x00, b'x'];
        let mut log = EventLog::default();
        {
            let mut sink = |b: &[u8]| written.extend_from_slice(b);
            server.parse(&text_frame, &mut sink, &mut log);
        }

        assert_eq!(server.ready_state(), ReadyState::Closed);
        assert!(log.0.iter().any(|e| matches!(e, Event::Close { code: 1000, .. })));
        assert!(!log.0.iter().any(|e| matches!(e, Event::Message(_))));
    }
}

// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A transport-decoupled driver for the websocket wire protocol, covering Hixie-75,
//! Hixie-76 and Hybi ([RFC 6455][rfc6455]).
//!
//! This crate performs no I/O of its own. A [`Driver`] is fed bytes read from a socket
//! by whatever means the embedder chooses — blocking, non-blocking, an async runtime, a
//! test harness — and in turn hands the embedder bytes to write out and [`Event`]s
//! describing what happened, through the [`WriteBytes`] and [`EventSink`] traits. This
//! keeps the protocol state machine usable from any I/O model without committing to one.
//!
//! # Basic usage
//!
//! ```
//! use ws_driver::{Config, Driver, EventLog};
//!
//! let mut driver = Driver::server(Config::new());
//! let mut out = Vec::new();
//! let mut sink = |bytes: &[u8]| out.extend_from_slice(bytes);
//! let mut log = EventLog::default();
//!
//! let request = b"GET /chat HTTP/1.1\r\n\
//!                 Host: example.com\r\n\
//!                 Upgrade: websocket\r\n\
//!                 Connection: Upgrade\r\n\
//!                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
//!                 Sec-WebSocket-Version: 13\r\n\r\n";
//! driver.parse(request, &mut sink, &mut log);
//! assert_eq!(driver.ready_state(), ws_driver::ReadyState::Open);
//!
//! driver.text("hi", &mut sink);
//! ```
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455
#![deny(missing_docs)]

mod assembler;
mod buffer;
mod data;
mod domain;
mod driver;
mod event;
mod frame;
mod handshake;
mod mask;
mod opcode;
mod utf8;

pub use data::Message;
pub use domain::DomainCheck;
pub use driver::{Config, Driver, DriverError, ReadyState, DEFAULT_MAX_SIZE};
pub use event::{Event, EventLog, EventSink, WriteBytes};
pub use handshake::Variant;

// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The Hixie-75 opening handshake: no challenge, no body, just a header exchange.

use super::{header_contains_token, trim_ascii, Error, Headers};
use crate::buffer::Parsing;

/// A successfully parsed client opening handshake request.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// The `Host` header, if present.
    pub host: Option<String>,
    /// The `Origin` header, if present.
    pub origin: Option<String>,
    /// The request target.
    pub resource: String
}

/// Parse an incoming Hixie-75 client handshake request out of `data`.
pub fn parse_request(data: &[u8]) -> Result<Parsing<ServerRequest>, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut header_buf);

    let offset = match request.parse(data)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(Parsing::NeedMore)
    };

    if !request.method.map_or(false, |m| m.eq_ignore_ascii_case("GET")) {
        return Err(Error::InvalidRequestMethod)
    }

    let mut headers = Headers::new();
    for h in request.headers.iter() {
        if let Ok(v) = std::str::from_utf8(trim_ascii(h.value)) {
            headers.push(h.name, v);
        }
    }

    if !headers.get("Upgrade").map_or(false, |v| v.eq_ignore_ascii_case("websocket")) {
        return Err(Error::UnexpectedHeader("Upgrade"))
    }
    if !headers.get("Connection").map_or(false, |v| header_contains_token(v, "upgrade")) {
        return Err(Error::UnexpectedHeader("Connection"))
    }

    Ok(Parsing::Done {
        value: ServerRequest {
            host: headers.get("Host").map(String::from),
            origin: headers.get("Origin").map(String::from),
            resource: request.path.unwrap_or("/").to_string()
        },
        offset
    })
}

/// Build the `101` response. Hixie-75 carries no accept key and no body.
pub fn build_response(origin: &str, location: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
    out.extend_from_slice(b"Upgrade: WebSocket\r\n");
    out.extend_from_slice(b"Connection: Upgrade\r\n");
    out.extend_from_slice(b"WebSocket-Origin: ");
    out.extend_from_slice(origin.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"WebSocket-Location: ");
    out.extend_from_slice(location.as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
}

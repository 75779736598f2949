// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The RFC 6455 opening handshake: server-side request validation and response
//! construction, client-side request construction and response validation.

use super::{header_contains_token, trim_ascii, Error, Headers};
use crate::buffer::Parsing;
use sha1::Sha1;

/// Defined by RFC 6455, used to derive `Sec-WebSocket-Accept` from `Sec-WebSocket-Key`.
const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum number of HTTP headers this crate will parse out of a handshake message.
const MAX_HEADERS: usize = 32;

/// Compute `Sec-WebSocket-Accept` from a `Sec-WebSocket-Key` value.
pub fn accept_key(client_key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(client_key.as_bytes());
    digest.update(GUID);
    base64::encode(&digest.digest().bytes())
}

/// A successfully parsed client opening handshake request.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// The `Sec-WebSocket-Key` value, to be used to compute the accept key.
    pub key: String,
    /// The negotiated RFC 6455 version (8 or 13).
    pub version: u8,
    /// Subprotocols the client is willing to speak, in the order it listed them.
    pub protocols: Vec<String>,
    /// The `Host` header, if present.
    pub host: Option<String>,
    /// The `Origin` header, if present.
    pub origin: Option<String>,
    /// The request target (e.g. `/chat`).
    pub resource: String
}

/// Parse an incoming client handshake request out of `data`.
pub fn parse_request(data: &[u8]) -> Result<Parsing<ServerRequest>, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut header_buf);

    let offset = match request.parse(data)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(Parsing::NeedMore)
    };

    if !request.method.map_or(false, |m| m.eq_ignore_ascii_case("GET")) {
        return Err(Error::InvalidRequestMethod)
    }

    let headers = headers_from_httparse(request.headers);

    if !headers.get("Upgrade").map_or(false, |v| v.eq_ignore_ascii_case("websocket")) {
        return Err(Error::UnexpectedHeader("Upgrade"))
    }
    if !headers.get("Connection").map_or(false, |v| header_contains_token(v, "upgrade")) {
        return Err(Error::UnexpectedHeader("Connection"))
    }

    let key = headers.get("Sec-WebSocket-Key").ok_or_else(|| Error::HeaderNotFound("Sec-WebSocket-Key".into()))?.to_string();

    let version: u8 = headers
        .get("Sec-WebSocket-Version")
        .ok_or_else(|| Error::HeaderNotFound("Sec-WebSocket-Version".into()))?
        .parse()
        .map_err(|_| Error::UnexpectedHeader("Sec-WebSocket-Version"))?;
    if version != 8 && version != 13 {
        return Err(Error::UnexpectedHeader("Sec-WebSocket-Version"))
    }

    let protocols = headers
        .get("Sec-WebSocket-Protocol")
        .map(|v| v.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    Ok(Parsing::Done {
        value: ServerRequest {
            key,
            version,
            protocols,
            host: headers.get("Host").map(String::from),
            origin: headers.get("Origin").map(String::from),
            resource: request.path.unwrap_or("/").to_string()
        },
        offset
    })
}

fn headers_from_httparse(raw: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::new();
    for h in raw {
        if let Ok(v) = std::str::from_utf8(trim_ascii(h.value)) {
            headers.push(h.name, v);
        }
    }
    headers
}

/// Pick the first server-acceptable protocol that the client also offered.
pub fn negotiate_protocol(offered: &[String], acceptable: &[String]) -> Option<String> {
    acceptable.iter().find(|p| offered.iter().any(|o| o == *p)).cloned()
}

/// Build the `101 Switching Protocols` response for a successfully negotiated request.
pub fn build_response(key: &str, protocol: Option<&str>, out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"Upgrade: websocket\r\n");
    out.extend_from_slice(b"Connection: Upgrade\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Accept: ");
    out.extend_from_slice(accept_key(key).as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(p) = protocol {
        out.extend_from_slice(b"Sec-WebSocket-Protocol: ");
        out.extend_from_slice(p.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Client-side handshake state: the nonce we generated, carried until the response is
/// validated against it.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    nonce: String
}

/// The server's handshake response, once validated.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    /// The subprotocol the server selected, if any.
    pub protocol: Option<String>
}

impl ClientHandshake {
    /// Generate a fresh, cryptographically random 16-byte nonce for `Sec-WebSocket-Key`.
    pub fn new() -> Self {
        let raw: [u8; 16] = rand::random();
        ClientHandshake { nonce: base64::encode(&raw) }
    }

    /// Build the `GET` request to send to the server.
    pub fn build_request(&self, host: &str, resource: &str, protocols: &[String], out: &mut Vec<u8>) {
        out.extend_from_slice(b"GET ");
        out.extend_from_slice(resource.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(host.as_bytes());
        out.extend_from_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n");
        out.extend_from_slice(b"Sec-WebSocket-Key: ");
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(b"\r\n");
        if let Some((last, rest)) = protocols.split_last() {
            out.extend_from_slice(b"Sec-WebSocket-Protocol: ");
            for p in rest {
                out.extend_from_slice(p.as_bytes());
                out.push(b',');
            }
            out.extend_from_slice(last.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n\r\n");
    }

    /// Parse and validate the server's response.
    pub fn parse_response(&self, data: &[u8], offered_protocols: &[String]) -> Result<Parsing<ClientResponse>, Error> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut header_buf);

        let offset = match response.parse(data)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => return Ok(Parsing::NeedMore)
        };

        let code = response.code.unwrap_or(0);
        if code != 101 {
            return Err(Error::UnexpectedStatusCode(code))
        }

        let headers = headers_from_httparse(response.headers);

        if !headers.get("Upgrade").map_or(false, |v| v.eq_ignore_ascii_case("websocket")) {
            return Err(Error::UnexpectedHeader("Upgrade"))
        }
        if !headers.get("Connection").map_or(false, |v| header_contains_token(v, "upgrade")) {
            return Err(Error::UnexpectedHeader("Connection"))
        }

        let theirs = headers.get("Sec-WebSocket-Accept").ok_or_else(|| Error::HeaderNotFound("Sec-WebSocket-Accept".into()))?;
        if accept_key(&self.nonce) != theirs {
            return Err(Error::InvalidSecWebSocketAccept)
        }

        let protocol = match headers.get("Sec-WebSocket-Protocol") {
            Some(p) if offered_protocols.iter().any(|o| o == p) => Some(p.to_string()),
            Some(_) => return Err(Error::UnsolicitedProtocol),
            None => None
        };

        Ok(Parsing::Done { value: ClientResponse { protocol }, offset })
    }

    /// The key sent in this handshake's `Sec-WebSocket-Key` header, for diagnostics/tests.
    pub fn key(&self) -> &str {
        &self.nonce
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_example_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parses_a_well_formed_request() {
        let req = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
                    Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        match parse_request(req).unwrap() {
            Parsing::Done { value, offset } => {
                assert_eq!(offset, req.len());
                assert_eq!(value.key, "dGhlIHNhbXBsZSBub25jZQ==");
                assert_eq!(value.version, 13);
                assert_eq!(value.resource, "/chat");
            }
            Parsing::NeedMore => panic!("expected a complete request")
        }
    }

    #[test]
    fn partial_request_needs_more() {
        let req = b"GET /chat HTTP/1.1\r\nHost: server";
        assert!(matches!(parse_request(req), Ok(Parsing::NeedMore)));
    }

    #[test]
    fn rejects_non_get_method() {
        let req = b"POST /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        assert!(matches!(parse_request(req), Err(Error::InvalidRequestMethod)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 7\r\n\r\n";
        assert!(matches!(parse_request(req), Err(Error::UnexpectedHeader("Sec-WebSocket-Version"))));
    }

    #[test]
    fn negotiates_first_mutually_acceptable_protocol() {
        let offered = vec!["chat".to_string(), "soap".to_string()];
        let acceptable = vec!["soap".to_string(), "chat".to_string()];
        assert_eq!(negotiate_protocol(&offered, &acceptable), Some("soap".to_string()));
    }

    #[test]
    fn no_common_protocol_negotiates_none() {
        let offered = vec!["chat".to_string()];
        let acceptable = vec!["soap".to_string()];
        assert_eq!(negotiate_protocol(&offered, &acceptable), None);
    }

    #[test]
    fn build_response_includes_accept_and_protocol() {
        let mut out = Vec::new();
        build_response("dGhlIHNhbXBsZSBub25jZQ==", Some("chat"), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn client_round_trip_accepts_matching_response() {
        let handshake = ClientHandshake::new();
        let mut request = Vec::new();
        handshake.build_request("example.com", "/", &[], &mut request);
        assert!(String::from_utf8_lossy(&request).starts_with("GET / HTTP/1.1"));

        let mut response = Vec::new();
        build_response(handshake.key(), None, &mut response);
        match handshake.parse_response(&response, &[]).unwrap() {
            Parsing::Done { value, .. } => assert_eq!(value.protocol, None),
            Parsing::NeedMore => panic!("expected a complete response")
        }
    }

    #[test]
    fn client_rejects_mismatched_accept_key() {
        let handshake = ClientHandshake::new();
        let response = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                          Connection: Upgrade\r\nSec-WebSocket-Accept: bm90dGhlcmlnaHR2YWx1ZQ==\r\n\r\n";
        assert!(matches!(handshake.parse_response(response, &[]), Err(Error::InvalidSecWebSocketAccept)));
    }

    #[test]
    fn client_rejects_non_101_status() {
        let handshake = ClientHandshake::new();
        let response = b"HTTP/1.1 404 Not Found\r\n\r\n";
        assert!(matches!(handshake.parse_response(response, &[]), Err(Error::UnexpectedStatusCode(404))));
    }
}

// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The Hixie-76 opening handshake: an MD5 challenge computed from
//! `Sec-WebSocket-Key1`/`Key2` and an 8-byte body that follows the header block with no
//! blank-line separator of its own.
//!
//! Parsing is a two-phase state machine rather than a single pass, because the body is
//! not part of the HTTP header grammar `httparse` understands, and because some
//! intermediaries are known to relay the headers and the body as separate TCP segments
//! (or, rarely, to strip the body outright). [`ServerHandshake`] tracks which phase it's
//! in across calls so a caller can feed it bytes as they arrive without losing state.

use super::{header_contains_token, trim_ascii, Error, Headers};
use crate::buffer::Parsing;
use rand::Rng;

const BODY_LEN: usize = 8;

/// Extract the digits of a Hixie-76 key header as a number, divided by its space count.
fn extract_key(value: &str) -> Result<u32, Error> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    let spaces = value.chars().filter(|&c| c == ' ').count() as u64;
    if spaces == 0 {
        return Err(Error::InvalidChallengeKey)
    }
    let number: u64 = digits.parse().map_err(|_| Error::InvalidChallengeKey)?;
    if number % spaces != 0 {
        return Err(Error::InvalidChallengeKey)
    }
    Ok((number / spaces) as u32)
}

/// Compute the 16-byte MD5 challenge response from the two key headers and the 8-byte
/// body that follows them.
pub fn compute_challenge(key1: &str, key2: &str, body: &[u8; BODY_LEN]) -> Result<[u8; 16], Error> {
    let n1 = extract_key(key1)?;
    let n2 = extract_key(key2)?;
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&n1.to_be_bytes());
    buf[4..8].copy_from_slice(&n2.to_be_bytes());
    buf[8..16].copy_from_slice(body);
    Ok(*md5::compute(&buf))
}

/// A successfully parsed client opening handshake request, including its challenge body.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// `Sec-WebSocket-Key1`.
    pub key1: String,
    /// `Sec-WebSocket-Key2`.
    pub key2: String,
    /// The 8 raw bytes following the header block.
    pub body: [u8; BODY_LEN],
    /// The `Host` header, if present.
    pub host: Option<String>,
    /// The `Origin` header, if present.
    pub origin: Option<String>,
    /// The request target.
    pub resource: String
}

impl ServerRequest {
    /// Compute this request's expected MD5 challenge response.
    pub fn challenge_response(&self) -> Result<[u8; 16], Error> {
        compute_challenge(&self.key1, &self.key2, &self.body)
    }
}

struct PendingRequest {
    key1: String,
    key2: String,
    host: Option<String>,
    origin: Option<String>,
    resource: String
}

enum Phase {
    AwaitingHeaders,
    AwaitingBody { request: PendingRequest, header_offset: usize }
}

/// Server-side handshake state, carried across calls until both the headers and the
/// trailing 8-byte body have arrived.
pub struct ServerHandshake {
    phase: Phase
}

impl ServerHandshake {
    /// A fresh handshake awaiting the request's headers.
    pub fn new() -> Self {
        ServerHandshake { phase: Phase::AwaitingHeaders }
    }

    /// Feed buffered bytes into the handshake. Returns `NeedMore` until both the header
    /// block and the 8-byte body are present in `data`.
    pub fn parse(&mut self, data: &[u8]) -> Result<Parsing<ServerRequest>, Error> {
        if let Phase::AwaitingHeaders = self.phase {
            let mut header_buf = [httparse::EMPTY_HEADER; 32];
            let mut request = httparse::Request::new(&mut header_buf);

            let header_offset = match request.parse(data)? {
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

            let key1 = headers.get("Sec-WebSocket-Key1").ok_or_else(|| Error::HeaderNotFound("Sec-WebSocket-Key1".into()))?.to_string();
            let key2 = headers.get("Sec-WebSocket-Key2").ok_or_else(|| Error::HeaderNotFound("Sec-WebSocket-Key2".into()))?.to_string();

            self.phase = Phase::AwaitingBody {
                request: PendingRequest {
                    key1,
                    key2,
                    host: headers.get("Host").map(String::from),
                    origin: headers.get("Origin").map(String::from),
                    resource: request.path.unwrap_or("/").to_string()
                },
                header_offset
            };
        }

        match &self.phase {
            Phase::AwaitingHeaders => unreachable!("just transitioned out of this phase above"),
            Phase::AwaitingBody { header_offset, .. } => {
                if data.len() < header_offset + BODY_LEN {
                    return Ok(Parsing::NeedMore)
                }
                let mut body = [0u8; BODY_LEN];
                body.copy_from_slice(&data[*header_offset..*header_offset + BODY_LEN]);
                let offset = header_offset + BODY_LEN;
                let request = match std::mem::replace(&mut self.phase, Phase::AwaitingHeaders) {
                    Phase::AwaitingBody { request, .. } => request,
                    Phase::AwaitingHeaders => unreachable!("just matched AwaitingBody above")
                };
                Ok(Parsing::Done {
                    value: ServerRequest {
                        key1: request.key1,
                        key2: request.key2,
                        body,
                        host: request.host,
                        origin: request.origin,
                        resource: request.resource
                    },
                    offset
                })
            }
        }
    }
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the `101` response, including the computed MD5 challenge response as the body.
pub fn build_response(origin: &str, location: &str, challenge_response: &[u8; 16], out: &mut Vec<u8>) {
    out.extend_from_slice(b"HTTP/1.1 101 WebSocket Protocol Handshake\r\n");
    out.extend_from_slice(b"Upgrade: WebSocket\r\n");
    out.extend_from_slice(b"Connection: Upgrade\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Origin: ");
    out.extend_from_slice(origin.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Location: ");
    out.extend_from_slice(location.as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(challenge_response);
}

/// Generate one random `Sec-WebSocket-KeyN` value together with the number it encodes,
/// per the construction rule: `N` random spaces interspersed with the decimal digits of
/// `number * N` (so the digits always divide evenly by the space count).
fn generate_key() -> (String, u32) {
    let mut rng = rand::thread_rng();
    let spaces: u32 = rng.gen_range(1, 13);
    let quotient: u32 = rng.gen_range(0, 1_000);
    let number = quotient * spaces;
    let mut chars: Vec<char> = number.to_string().chars().collect();
    for _ in 0..spaces {
        chars.push(' ');
    }
    for i in (1..chars.len()).rev() {
        let j = rng.gen_range(0, i + 1);
        chars.swap(i, j);
    }
    (chars.into_iter().collect(), quotient)
}

/// Client-side handshake state: the two generated keys and the random body, carried until
/// the server's challenge response is verified against them.
pub struct ClientHandshake {
    key1: String,
    key2: String,
    body: [u8; BODY_LEN]
}

impl ClientHandshake {
    /// Generate fresh keys and a random 8-byte body.
    pub fn new() -> Self {
        let (key1, _) = generate_key();
        let (key2, _) = generate_key();
        ClientHandshake { key1, key2, body: rand::random() }
    }

    /// Build the `GET` request, including the trailing 8-byte body (sent with no CRLF of
    /// its own, directly after the header block's blank line).
    pub fn build_request(&self, host: &str, resource: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(b"GET ");
        out.extend_from_slice(resource.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n");
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(host.as_bytes());
        out.extend_from_slice(b"\r\nSec-WebSocket-Key1: ");
        out.extend_from_slice(self.key1.as_bytes());
        out.extend_from_slice(b"\r\nSec-WebSocket-Key2: ");
        out.extend_from_slice(self.key2.as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&self.body);
    }

    /// The response this server is expected to send back.
    pub fn expected_response(&self) -> Result<[u8; 16], Error> {
        compute_challenge(&self.key1, &self.key2, &self.body)
    }

    /// Check a 16-byte response body against what this handshake expects.
    pub fn verify_response(&self, response: &[u8]) -> Result<bool, Error> {
        Ok(response == self.expected_response()?)
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
    fn spec_example_challenge_response() {
        let body = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
        let response = compute_challenge("4 @1  46546xW%0l 1 5", "12998 5 Y3 1  .P00", &body).unwrap();
        assert_eq!(response, [0x3f, 0x4a, 0xe6, 0xb5, 0xf6, 0xf2, 0xb2, 0xb6, 0xaa, 0x3c, 0x6e, 0x0f, 0x6f, 0xe3, 0xb4, 0xa5]);
    }

    #[test]
    fn extract_key_divides_digits_by_space_count() {
        assert_eq!(extract_key("4 @1  46546xW%0l 1 5").unwrap(), 4_146_546_015 / 5);
    }

    #[test]
    fn extract_key_rejects_no_spaces() {
        assert!(matches!(extract_key("12345"), Err(Error::InvalidChallengeKey)));
    }

    #[test]
    fn extract_key_rejects_uneven_division() {
        // digits "113", two spaces: 113 is not evenly divisible by 2.
        assert!(matches!(extract_key("1 1 3"), Err(Error::InvalidChallengeKey)));
    }

    #[test]
    fn two_phase_parse_needs_more_then_completes() {
        let mut hs = ServerHandshake::new();
        let head = b"GET /demo HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\
                      Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\nSec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n";
        assert!(matches!(hs.parse(head), Ok(Parsing::NeedMore)));

        let mut full = head.to_vec();
        full.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
        match hs.parse(&full).unwrap() {
            Parsing::Done { value, offset } => {
                assert_eq!(offset, full.len());
                assert_eq!(value.resource, "/demo");
                assert_eq!(value.challenge_response().unwrap()[0], 0x3f);
            }
            Parsing::NeedMore => panic!("expected a complete request once the body arrived")
        }
    }

    #[test]
    fn build_response_places_digest_directly_after_blank_line() {
        let mut out = Vec::new();
        let digest = [0xaa; 16];
        build_response("http://example.com", "ws://example.com/demo", &digest, &mut out);
        assert!(out.ends_with(&digest));
        assert!(out.windows(4).any(|w| w == b"\r\n\r\n"));
    }

    #[test]
    fn client_request_round_trips_through_server_parse() {
        let client = ClientHandshake::new();
        let mut request = Vec::new();
        client.build_request("example.com", "/", &mut request);

        let mut server = ServerHandshake::new();
        match server.parse(&request).unwrap() {
            Parsing::Done { value, offset } => {
                assert_eq!(offset, request.len());
                let response = value.challenge_response().unwrap();
                assert!(client.verify_response(&response).unwrap());
            }
            Parsing::NeedMore => panic!("expected the whole request, including body, to be present")
        }
    }

    #[test]
    fn client_rejects_wrong_response() {
        let client = ClientHandshake::new();
        assert!(!client.verify_response(&[0; 16]).unwrap());
    }
}

// Copyright (c) 2019 Parity Technologies (UK) Ltd.
// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Handshake negotiation, one module per variant: [`hybi`] (RFC 6455), [`hixie76`] and
//! [`hixie75`].

pub mod hixie75;
pub mod hixie76;
pub mod hybi;

use std::borrow::Cow;
use std::fmt;

/// Errors common to every handshake variant.
#[derive(Debug)]
pub enum Error {
    /// The handshake request was not a `GET` request.
    InvalidRequestMethod,
    /// A required HTTP header was missing.
    HeaderNotFound(String),
    /// An HTTP header had an unexpected value.
    UnexpectedHeader(&'static str),
    /// The `Sec-WebSocket-Accept` value didn't match what we computed.
    InvalidSecWebSocketAccept,
    /// The server returned a subprotocol we didn't offer.
    UnsolicitedProtocol,
    /// The origin/host didn't pass the configured access-control policy.
    ForbiddenOrigin,
    /// The HTTP request/response could not be parsed.
    Http(httparse::Error),
    /// A header value wasn't valid UTF-8.
    Utf8(std::str::Utf8Error),
    /// The HTTP response status code was not `101 Switching Protocols`.
    UnexpectedStatusCode(u16),
    /// A Hixie-76 `Sec-WebSocket-Key1`/`Key2` value had no spaces, or its digits weren't
    /// evenly divisible by its space count.
    InvalidChallengeKey
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidRequestMethod => f.write_str("handshake is not a GET request"),
            Error::HeaderNotFound(n) => write!(f, "header {} not found", n),
            Error::UnexpectedHeader(n) => write!(f, "header {} had an unexpected value", n),
            Error::InvalidSecWebSocketAccept => f.write_str("Sec-WebSocket-Accept mismatch"),
            Error::UnsolicitedProtocol => f.write_str("server returned an unsolicited protocol"),
            Error::ForbiddenOrigin => f.write_str("origin or host rejected by access control policy"),
            Error::Http(e) => write!(f, "http parse error: {}", e),
            Error::Utf8(e) => write!(f, "header was not valid utf-8: {}", e),
            Error::UnexpectedStatusCode(c) => write!(f, "unexpected response status: {}", c),
            Error::InvalidChallengeKey => f.write_str("malformed Sec-WebSocket-Key1/Key2 value")
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Utf8(e) => Some(e),
            _ => None
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::Utf8(e)
    }
}

/// A minimal, case-insensitive HTTP header bag standing in for the CGI/Rack-style
/// `HTTP_`-prefixed environment mapping an embedding HTTP server typically hands a
/// driver.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>
}

impl Headers {
    /// An empty header bag.
    pub fn new() -> Self {
        Headers { entries: Vec::new() }
    }

    /// Add a header. Multiple values for the same name are preserved in insertion order.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// The first value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// All values for `name`, compared case-insensitively, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries.iter().filter(move |(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Build a `Headers` bag from a CGI/Rack-style `HTTP_`-prefixed environment mapping
    /// (`HTTP_CONNECTION`, `HTTP_UPGRADE`, ...).
    pub fn from_cgi_map<I, K, V>(map: I) -> Headers
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>
    {
        let mut headers = Headers::new();
        for (k, v) in map {
            let k = k.as_ref();
            if let Some(name) = k.strip_prefix("HTTP_") {
                headers.push(cgi_name_to_header_name(name), v);
            }
        }
        headers
    }
}

fn cgi_name_to_header_name(cgi_name: &str) -> String {
    cgi_name
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) => c.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Does a comma-separated header value contain `token`, ignoring case and surrounding
/// whitespace? (`Connection: keep-alive, Upgrade` contains the `upgrade` token.)
pub(crate) fn header_contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Is this request (by method + `Connection`/`Upgrade` headers) a websocket upgrade
/// request at all, independent of which variant it's asking for?
pub fn is_websocket(method: &str, headers: &Headers) -> bool {
    if !method.eq_ignore_ascii_case("GET") {
        return false
    }
    let connection_ok = headers.get("Connection").map_or(false, |v| header_contains_token(v, "upgrade"));
    let upgrade_ok = headers.get("Upgrade").map_or(false, |v| v.eq_ignore_ascii_case("websocket"));
    connection_ok && upgrade_ok
}

/// Which protocol variant an opening request is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// No `Sec-WebSocket-*` headers at all: Hixie-75.
    Hixie75,
    /// `Sec-WebSocket-Key1`/`Key2` present: Hixie-76.
    Hixie76,
    /// `Sec-WebSocket-Key` present: RFC 6455 (Hybi).
    Hybi
}

/// Peek at a buffered request's headers far enough to tell which variant it's asking for,
/// without committing to parsing it as that variant. Used by a server that must detect
/// the variant before it knows which variant-specific parser to hand the bytes to.
pub fn detect_variant(data: &[u8]) -> Result<crate::buffer::Parsing<Variant>, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut header_buf);

    let offset = match request.parse(data)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(crate::buffer::Parsing::NeedMore)
    };

    let mut headers = Headers::new();
    for h in request.headers.iter() {
        if let Ok(v) = std::str::from_utf8(trim_ascii(h.value)) {
            headers.push(h.name, v);
        }
    }

    let variant = if headers.get("Sec-WebSocket-Version").is_some() {
        Variant::Hybi
    } else if headers.get("Sec-WebSocket-Key1").is_some() {
        Variant::Hixie76
    } else {
        Variant::Hixie75
    };

    Ok(crate::buffer::Parsing::Done { value: variant, offset })
}

/// Derive the full `ws://`/`wss://` URL for this request, preferring
/// `HTTP_X_FORWARDED_PROTO` over `HTTP_ORIGIN` for scheme detection.
pub fn request_url(headers: &Headers, request_uri: &str) -> String {
    let host = headers.get("Host").unwrap_or("");
    let is_tls = if let Some(proto) = headers.get("X-Forwarded-Proto") {
        proto.eq_ignore_ascii_case("https")
    } else if let Some(origin) = headers.get("Origin") {
        origin.starts_with("https://")
    } else {
        false
    };
    let scheme = if is_tls { "wss" } else { "ws" };
    format!("{}://{}{}", scheme, host, request_uri)
}

/// Trim ASCII whitespace off both ends of a byte slice.
pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let from = match bytes.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(i) => i,
        None => return &[]
    };
    let to = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap();
    &bytes[from..=to]
}

/// Borrow a header value as a UTF-8 `&str`, or fail with [`Error::Utf8`].
pub(crate) fn header_str(bytes: &[u8]) -> Result<Cow<'_, str>, Error> {
    Ok(Cow::Borrowed(std::str::from_utf8(bytes)?))
}

//! The scope handed to an application: a structured description of one
//! request (or of the process lifespan) that does not change while the
//! application runs.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

/// Revision of the message contract this server implements.
pub const SPEC_VERSION: &str = "2.1";

/// Application calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// `app(scope, receive, send)`.
    V3,
    /// `app(scope)` returns an instance, then `instance(receive, send)`.
    V2,
}

impl Interface {
    pub fn version(&self) -> &'static str {
        match self {
            Interface::V3 => "3.0",
            Interface::V2 => "2.0",
        }
    }
}

/// Protocol version info reported in every scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub version: &'static str,
    pub spec_version: &'static str,
}

impl ProtocolInfo {
    pub fn new(interface: Interface) -> Self {
        Self {
            version: interface.version(),
            spec_version: SPEC_VERSION,
        }
    }
}

/// HTTP version of a parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "1.0",
            HttpVersion::Http11 => "1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list. Names are stored lowercased, duplicates are kept in
/// arrival order and lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(Bytes, Bytes)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl AsRef<[u8]>, value: impl Into<Bytes>) {
        let name = Bytes::from(name.as_ref().to_ascii_lowercase());
        self.0.push((name, value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| &v[..])
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| &v[..])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True if any comma-separated element of any `name` value equals
    /// `token`, ignoring case and surrounding whitespace.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(|b| *b == b',')
                .any(|part| part.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.0.iter().map(|(n, v)| (&n[..], &v[..]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: AsRef<[u8]>, V: Into<Bytes>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.push(name, value);
        }
        headers
    }
}

/// Scope of one HTTP request.
#[derive(Debug, Clone)]
pub struct HttpScope {
    pub protocol: ProtocolInfo,
    pub http_version: HttpVersion,
    pub method: String,
    pub scheme: &'static str,
    /// Percent-decoded path.
    pub path: String,
    /// Path exactly as it appeared on the request line, without the query.
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    pub headers: Headers,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

/// Scope of the process lifespan handshake.
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub protocol: ProtocolInfo,
}

/// Everything an application can be invoked for.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    Lifespan(LifespanScope),
}

impl Scope {
    pub fn scope_type(&self) -> &'static str {
        match self {
            Scope::Http(_) => "http",
            Scope::Lifespan(_) => "lifespan",
        }
    }

    pub fn protocol(&self) -> ProtocolInfo {
        match self {
            Scope::Http(scope) => scope.protocol,
            Scope::Lifespan(scope) => scope.protocol,
        }
    }

    pub fn as_http(&self) -> Option<&HttpScope> {
        match self {
            Scope::Http(scope) => Some(scope),
            Scope::Lifespan(_) => None,
        }
    }

    pub(crate) fn set_interface(&mut self, interface: Interface) {
        let protocol = ProtocolInfo::new(interface);
        match self {
            Scope::Http(scope) => scope.protocol = protocol,
            Scope::Lifespan(scope) => scope.protocol = protocol,
        }
    }
}

/// Split a request target into decoded path, raw path and query string.
pub fn split_target(target: &[u8]) -> (String, Bytes, Bytes) {
    let (raw_path, query) = match target.iter().position(|b| *b == b'?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, &b""[..]),
    };
    let decoded = urlencoding::decode_binary(raw_path);
    let path = String::from_utf8_lossy(&decoded).into_owned();
    (
        path,
        Bytes::copy_from_slice(raw_path),
        Bytes::copy_from_slice(query),
    )
}

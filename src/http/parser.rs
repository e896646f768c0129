//! Incremental HTTP/1.x request parsing.
//!
//! # Responsibilities
//! - Accept byte chunks of any size and emit structured events
//! - Decide body framing (Content-Length, chunked, none)
//! - Keep parsing ahead so pipelined requests are never lost
//! - Stop at an upgrade request and hand back whatever follows it
//!
//! # Design Decisions
//! - The backend is chosen once from [`ParserKind`] and boxed behind
//!   [`RequestParser`]; the engine never knows which one it has
//! - Both variants use `httparse` for the head; they differ only in how
//!   much request-line and header sloppiness they accept
//! - A request carrying both Content-Length and Transfer-Encoding is
//!   rejected outright

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::config::ParserKind;
use crate::http::scope::{Headers, HttpVersion};

const MAX_HEADERS: usize = 100;

/// Why a request could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid HTTP version")]
    InvalidVersion,
    #[error("invalid header")]
    InvalidHeader,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("request head larger than {0} bytes")]
    HeadTooLarge(usize),
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("both content-length and transfer-encoding present")]
    AmbiguousFraming,
    #[error("invalid chunked body")]
    InvalidChunk,
}

impl From<httparse::Error> for ParseError {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::Version => ParseError::InvalidVersion,
            httparse::Error::HeaderName | httparse::Error::HeaderValue => ParseError::InvalidHeader,
            httparse::Error::TooManyHeaders => ParseError::TooManyHeaders,
            httparse::Error::Token | httparse::Error::NewLine | httparse::Error::Status => {
                ParseError::InvalidRequestLine
            }
        }
    }
}

/// A fully parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (path plus optional query).
    pub target: Bytes,
    pub version: HttpVersion,
    pub headers: Headers,
    /// Whether the client is willing to reuse the connection.
    pub keep_alive: bool,
    pub expect_continue: bool,
    /// Lowercased `Upgrade` value when `Connection: upgrade` is also present.
    pub upgrade: Option<String>,
}

/// What the parser found in the bytes fed so far.
#[derive(Debug, Clone)]
pub enum ParseEvent {
    Head(RequestHead),
    Body(Bytes),
    MessageComplete,
}

/// Capability every parser backend provides.
pub trait RequestParser: Send {
    /// Consume `data`, appending whatever events it completes.
    ///
    /// After an error the parser is unusable and the connection must close.
    fn feed(&mut self, data: &[u8], events: &mut Vec<ParseEvent>) -> Result<(), ParseError>;

    /// Bytes buffered but not parsed. After an upgrade head this is
    /// everything the client sent past the head.
    fn take_unconsumed(&mut self) -> Bytes;
}

impl ParserKind {
    /// Build a fresh parser for one connection.
    pub fn build(self, max_head_size: usize) -> Box<dyn RequestParser> {
        let mut config = httparse::ParserConfig::default();
        if self == ParserKind::Lenient {
            config
                .allow_multiple_spaces_in_request_line_delimiters(true)
                .ignore_invalid_headers_in_requests(true);
        }
        Box::new(H1Parser::new(config, max_head_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    Chunked(Chunk),
    /// Upgrade head seen; everything else belongs to the next protocol.
    Upgraded,
}

struct H1Parser {
    config: httparse::ParserConfig,
    max_head_size: usize,
    buf: BytesMut,
    state: State,
}

impl H1Parser {
    fn new(config: httparse::ParserConfig, max_head_size: usize) -> Self {
        Self {
            config,
            max_head_size,
            buf: BytesMut::new(),
            state: State::Head,
        }
    }

    /// Returns `false` when more input is needed.
    fn step(&mut self, events: &mut Vec<ParseEvent>) -> Result<bool, ParseError> {
        match self.state {
            State::Upgraded => Ok(false),
            State::Head => self.parse_head(events),
            State::Length(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(self.buf.len() as u64) as usize;
                events.push(ParseEvent::Body(self.buf.split_to(take).freeze()));
                self.finish_or(remaining - take as u64, events);
                Ok(true)
            }
            State::Chunked(chunk) => self.parse_chunked(chunk, events),
        }
    }

    fn finish_or(&mut self, remaining: u64, events: &mut Vec<ParseEvent>) {
        if remaining == 0 {
            events.push(ParseEvent::MessageComplete);
            self.state = State::Head;
        } else {
            self.state = State::Length(remaining);
        }
    }

    fn parse_head(&mut self, events: &mut Vec<ParseEvent>) -> Result<bool, ParseError> {
        if self.buf.is_empty() {
            return Ok(false);
        }
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        let consumed = match self.config.parse_request(&mut req, &self.buf)? {
            httparse::Status::Complete(n) if n > self.max_head_size => {
                return Err(ParseError::HeadTooLarge(self.max_head_size));
            }
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if self.buf.len() > self.max_head_size {
                    return Err(ParseError::HeadTooLarge(self.max_head_size));
                }
                return Ok(false);
            }
        };

        let version = match req.version {
            Some(0) => HttpVersion::Http10,
            Some(1) => HttpVersion::Http11,
            _ => return Err(ParseError::InvalidVersion),
        };
        let method = req.method.ok_or(ParseError::InvalidRequestLine)?.to_string();
        let target = Bytes::copy_from_slice(req.path.ok_or(ParseError::InvalidRequestLine)?.as_bytes());
        let headers: Headers = req
            .headers
            .iter()
            .map(|h| (h.name.as_bytes(), Bytes::copy_from_slice(h.value)))
            .collect();
        self.buf.advance(consumed);

        let keep_alive = match version {
            HttpVersion::Http11 => !headers.has_token("connection", "close"),
            HttpVersion::Http10 => headers.has_token("connection", "keep-alive"),
        };
        let expect_continue = headers
            .get("expect")
            .is_some_and(|v| v.trim_ascii().eq_ignore_ascii_case(b"100-continue"));
        let upgrade = match headers.get("upgrade") {
            Some(value) if headers.has_token("connection", "upgrade") => {
                Some(String::from_utf8_lossy(value.trim_ascii()).to_ascii_lowercase())
            }
            _ => None,
        };
        let next = framing(&headers)?;

        events.push(ParseEvent::Head(RequestHead {
            method,
            target,
            version,
            headers,
            keep_alive,
            expect_continue,
            upgrade: upgrade.clone(),
        }));

        if upgrade.is_some() {
            self.state = State::Upgraded;
            return Ok(false);
        }
        match next {
            State::Length(0) => self.finish_or(0, events),
            state => self.state = state,
        }
        Ok(true)
    }

    fn parse_chunked(&mut self, chunk: Chunk, events: &mut Vec<ParseEvent>) -> Result<bool, ParseError> {
        match chunk {
            Chunk::Size => match httparse::parse_chunk_size(&self.buf) {
                Ok(httparse::Status::Complete((consumed, size))) => {
                    self.buf.advance(consumed);
                    self.state = State::Chunked(if size == 0 {
                        Chunk::Trailers
                    } else {
                        Chunk::Data(size)
                    });
                    Ok(true)
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > self.max_head_size {
                        return Err(ParseError::InvalidChunk);
                    }
                    Ok(false)
                }
                Err(_) => Err(ParseError::InvalidChunk),
            },
            Chunk::Data(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(self.buf.len() as u64) as usize;
                events.push(ParseEvent::Body(self.buf.split_to(take).freeze()));
                let left = remaining - take as u64;
                self.state = State::Chunked(if left == 0 { Chunk::DataEnd } else { Chunk::Data(left) });
                Ok(true)
            }
            Chunk::DataEnd => {
                if self.buf.len() < 2 {
                    return Ok(false);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(ParseError::InvalidChunk);
                }
                self.buf.advance(2);
                self.state = State::Chunked(Chunk::Size);
                Ok(true)
            }
            Chunk::Trailers => {
                let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") else {
                    if self.buf.len() > self.max_head_size {
                        return Err(ParseError::InvalidChunk);
                    }
                    return Ok(false);
                };
                self.buf.advance(end + 2);
                if end == 0 {
                    events.push(ParseEvent::MessageComplete);
                    self.state = State::Head;
                }
                Ok(true)
            }
        }
    }
}

/// Body framing declared by a request head.
fn framing(headers: &Headers) -> Result<State, ParseError> {
    let has_length = headers.contains("content-length");
    if headers.contains("transfer-encoding") {
        if has_length {
            return Err(ParseError::AmbiguousFraming);
        }
        let last = headers
            .get_all("transfer-encoding")
            .flat_map(|v| v.split(|b| *b == b','))
            .map(|coding| coding.trim_ascii())
            .filter(|coding| !coding.is_empty())
            .last();
        return match last {
            Some(coding) if coding.eq_ignore_ascii_case(b"chunked") => Ok(State::Chunked(Chunk::Size)),
            _ => Err(ParseError::UnsupportedTransferEncoding),
        };
    }
    if !has_length {
        return Ok(State::Length(0));
    }

    let mut length = None;
    for value in headers.get_all("content-length") {
        let value = value.trim_ascii();
        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return Err(ParseError::InvalidContentLength);
        }
        let parsed: u64 = std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => return Err(ParseError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(State::Length(length.unwrap_or(0)))
}

impl RequestParser for H1Parser {
    fn feed(&mut self, data: &[u8], events: &mut Vec<ParseEvent>) -> Result<(), ParseError> {
        self.buf.extend_from_slice(data);
        while self.step(events)? {}
        Ok(())
    }

    fn take_unconsumed(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

//! One request/response exchange.
//!
//! # Responsibilities
//! - Buffer the request body until the application asks for it
//! - Turn the application's outbound messages into wire frames
//! - Decide response framing (Content-Length, chunked, close-delimited)
//!
//! # Design Decisions
//! - The cycle never touches the transport; it returns frames and the
//!   connection engine writes them, so ordering lives in one place
//! - Any misuse of `send` is a [`SendError`]; the engine decides between a
//!   synthesized 500 and aborting the connection
//!
//! # States
//! ```text
//! request:  AwaitingBody → BodyComplete
//!                ↘             ↘
//!                  Disconnected
//! response: NotStarted → Started → Complete
//!                ↘          ↘
//!                    Failed
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::app::CycleId;
use crate::http::message::Message;
use crate::http::parser::RequestHead;
use crate::http::response::{
    encode_chunk, encode_head, is_valid_header_name, is_valid_header_value, LAST_CHUNK,
};
use crate::http::scope::{Headers, HttpVersion, Scope};
use crate::http::status::forbids_body;

/// Misuse of the `send` side of the message contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("expected '{expected}' message, received '{received}'")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },
    #[error("response already started")]
    AlreadyStarted,
    #[error("response already completed")]
    AlreadyCompleted,
    #[error("invalid status code {0}")]
    InvalidStatus(u16),
    #[error("invalid response header {0:?}")]
    InvalidHeader(String),
    #[error("invalid content-length in response headers")]
    InvalidContentLength,
    #[error("response content longer than Content-Length")]
    BodyTooLong,
    #[error("response content shorter than Content-Length")]
    BodyTooShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    AwaitingBody,
    BodyComplete,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseState {
    NotStarted,
    Started,
    Complete,
    Failed,
}

pub(crate) struct Cycle {
    pub id: CycleId,
    /// Taken when the application task is spawned.
    pub scope: Option<Scope>,
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub keep_alive: bool,
    pub request: RequestState,
    pub response: ResponseState,
    pub status: Option<u16>,
    /// Application waiting in `receive`.
    pub pending_receive: Option<oneshot::Sender<Message>>,
    body: BytesMut,
    final_body_delivered: bool,
    expect_continue: bool,
    continue_sent: bool,
    is_head: bool,
    chunked: bool,
    content_length: Option<u64>,
    written: u64,
}

impl Cycle {
    pub fn new(id: CycleId, head: &RequestHead, scope: Scope) -> Self {
        Self {
            id,
            scope: Some(scope),
            method: head.method.clone(),
            target: String::from_utf8_lossy(&head.target).into_owned(),
            version: head.version,
            keep_alive: head.keep_alive,
            request: RequestState::AwaitingBody,
            response: ResponseState::NotStarted,
            status: None,
            pending_receive: None,
            body: BytesMut::new(),
            final_body_delivered: false,
            expect_continue: head.expect_continue,
            continue_sent: false,
            is_head: head.method == "HEAD",
            chunked: false,
            content_length: None,
            written: 0,
        }
    }

    pub fn push_body(&mut self, chunk: &[u8]) {
        if self.request == RequestState::AwaitingBody {
            self.body.extend_from_slice(chunk);
        }
    }

    pub fn finish_body(&mut self) {
        if self.request == RequestState::AwaitingBody {
            self.request = RequestState::BodyComplete;
        }
    }

    pub fn disconnect(&mut self) {
        self.request = RequestState::Disconnected;
        self.body.clear();
    }

    /// Request body bytes received but not yet handed to the application.
    pub fn buffered(&self) -> usize {
        self.body.len()
    }

    pub fn is_response_done(&self) -> bool {
        matches!(self.response, ResponseState::Complete | ResponseState::Failed)
    }

    /// The next message for `receive`, or `None` if the application has to
    /// wait for more input.
    pub fn next_message(&mut self) -> Option<Message> {
        if self.request == RequestState::Disconnected || self.is_response_done() {
            return Some(Message::HttpDisconnect);
        }
        if self.final_body_delivered {
            return None;
        }
        let more_body = self.request == RequestState::AwaitingBody;
        if self.body.is_empty() && more_body {
            return None;
        }
        self.final_body_delivered = !more_body;
        Some(Message::HttpRequest {
            body: self.body.split().freeze(),
            more_body,
        })
    }

    /// True exactly once: when the application first waits on a body the
    /// client is holding back behind `Expect: 100-continue`.
    pub fn take_continue(&mut self) -> bool {
        let due = self.expect_continue
            && !self.continue_sent
            && self.response == ResponseState::NotStarted
            && self.request == RequestState::AwaitingBody
            && self.body.is_empty();
        if due {
            self.continue_sent = true;
        }
        due
    }

    /// Validate `http.response.start` and encode the response head.
    ///
    /// `defaults` are added unless the application sets the same header.
    pub fn start_response(
        &mut self,
        status: u16,
        headers: &[(Bytes, Bytes)],
        defaults: &[(Bytes, Bytes)],
    ) -> Result<Bytes, SendError> {
        if self.response != ResponseState::NotStarted {
            return Err(SendError::AlreadyStarted);
        }
        if !(100..=999).contains(&status) {
            return Err(SendError::InvalidStatus(status));
        }
        for (name, value) in headers {
            if !is_valid_header_name(name) || !is_valid_header_value(value) {
                return Err(SendError::InvalidHeader(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
        }

        let declared: Headers = headers.iter().cloned().collect();
        let mut content_length = None;
        for value in declared.get_all("content-length") {
            let parsed = std::str::from_utf8(value.trim_ascii())
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(SendError::InvalidContentLength)?;
            content_length = Some(parsed);
        }
        let app_chunked = declared.has_token("transfer-encoding", "chunked");
        if declared.has_token("connection", "close") {
            self.keep_alive = false;
        }

        let mut extra: Vec<(&[u8], &[u8])> = Vec::new();
        let bodyless = self.is_head || forbids_body(status);
        self.chunked = app_chunked;
        if !app_chunked && content_length.is_none() && !bodyless {
            match self.version {
                HttpVersion::Http11 => {
                    self.chunked = true;
                    extra.push((&b"transfer-encoding"[..], &b"chunked"[..]));
                }
                // No chunked framing for 1.0 peers: the body ends at close.
                HttpVersion::Http10 => self.keep_alive = false,
            }
        }
        if !declared.contains("connection") {
            if !self.keep_alive {
                extra.push((&b"connection"[..], &b"close"[..]));
            } else if self.version == HttpVersion::Http10 {
                extra.push((&b"connection"[..], &b"keep-alive"[..]));
            }
        }

        let defaults = defaults.iter().filter(|(name, _)| {
            std::str::from_utf8(name).map_or(true, |name| !declared.contains(name))
        });
        let head = encode_head(
            status,
            defaults
                .map(|(n, v)| (&n[..], &v[..]))
                .chain(headers.iter().map(|(n, v)| (&n[..], &v[..])))
                .chain(extra),
        );

        self.status = Some(status);
        self.content_length = content_length;
        self.response = ResponseState::Started;
        Ok(head.freeze())
    }

    /// Frame one `http.response.body`. Returns the bytes to write, which may
    /// be empty (HEAD, bodyless statuses, empty chunks).
    pub fn write_body(&mut self, body: Bytes, more_body: bool) -> Result<Vec<Bytes>, SendError> {
        match self.response {
            ResponseState::NotStarted => {
                return Err(SendError::UnexpectedMessage {
                    expected: "http.response.start",
                    received: "http.response.body",
                })
            }
            ResponseState::Complete | ResponseState::Failed => {
                return Err(SendError::AlreadyCompleted)
            }
            ResponseState::Started => {}
        }

        let mut frames = Vec::new();
        let bodyless = self.is_head || self.status.is_some_and(forbids_body);
        if !bodyless {
            if self.chunked {
                frames.extend(encode_chunk(&body));
                if !more_body {
                    frames.push(Bytes::from_static(LAST_CHUNK));
                }
            } else {
                self.written += body.len() as u64;
                if self.content_length.is_some_and(|n| self.written > n) {
                    return Err(SendError::BodyTooLong);
                }
                if !body.is_empty() {
                    frames.push(body);
                }
            }
        }

        if !more_body {
            if !bodyless && !self.chunked && self.content_length.is_some_and(|n| self.written < n) {
                return Err(SendError::BodyTooShort);
            }
            self.response = ResponseState::Complete;
        }
        Ok(frames)
    }

    /// Protocol line for the access log, e.g. `GET /path?x=1 HTTP/1.1`.
    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/{}", self.method, self.target, self.version)
    }
}

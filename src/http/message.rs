//! Messages exchanged between the server and an application.
//!
//! Every message has a `type` string (see [`Message::message_type`]); the
//! set below covers the HTTP request/response exchange and the lifespan
//! handshake.

use std::fmt;

use bytes::Bytes;

/// One message in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `http.request`: a piece of the request body.
    HttpRequest { body: Bytes, more_body: bool },
    /// `http.disconnect`: the exchange is over from the server's side.
    HttpDisconnect,
    /// `http.response.start`: status and headers.
    ResponseStart {
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
    },
    /// `http.response.body`: a piece of the response body.
    ResponseBody { body: Bytes, more_body: bool },
    LifespanStartup,
    LifespanStartupComplete,
    LifespanStartupFailed { message: String },
    LifespanShutdown,
    LifespanShutdownComplete,
    LifespanShutdownFailed { message: String },
}

impl Message {
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::HttpRequest { .. } => "http.request",
            Message::HttpDisconnect => "http.disconnect",
            Message::ResponseStart { .. } => "http.response.start",
            Message::ResponseBody { .. } => "http.response.body",
            Message::LifespanStartup => "lifespan.startup",
            Message::LifespanStartupComplete => "lifespan.startup.complete",
            Message::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            Message::LifespanShutdown => "lifespan.shutdown",
            Message::LifespanShutdownComplete => "lifespan.shutdown.complete",
            Message::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }

    /// `http.response.start` with a header list given as string pairs.
    pub fn start(status: u16, headers: &[(&str, &str)]) -> Self {
        Message::ResponseStart {
            status,
            headers: headers
                .iter()
                .map(|(n, v)| {
                    (
                        Bytes::copy_from_slice(n.as_bytes()),
                        Bytes::copy_from_slice(v.as_bytes()),
                    )
                })
                .collect(),
        }
    }

    /// Final `http.response.body`.
    pub fn body(body: impl Into<Bytes>) -> Self {
        Message::ResponseBody {
            body: body.into(),
            more_body: false,
        }
    }

    /// Non-final `http.response.body`.
    pub fn body_chunk(body: impl Into<Bytes>) -> Self {
        Message::ResponseBody {
            body: body.into(),
            more_body: true,
        }
    }

    /// Loggable form that reports body sizes instead of body contents.
    pub fn summary(&self) -> MessageSummary<'_> {
        MessageSummary(self)
    }
}

/// Display adapter produced by [`Message::summary`].
pub struct MessageSummary<'a>(&'a Message);

impl fmt::Display for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.0;
        write!(f, "{{type: {:?}", message.message_type())?;
        match message {
            Message::HttpRequest { body, more_body } | Message::ResponseBody { body, more_body } => {
                write!(f, ", body: <{} bytes>, more_body: {}", body.len(), more_body)?;
            }
            Message::ResponseStart { status, headers } => {
                write!(f, ", status: {}, headers: <{} headers>", status, headers.len())?;
            }
            Message::LifespanStartupFailed { message }
            | Message::LifespanShutdownFailed { message } => {
                write!(f, ", message: {:?}", message)?;
            }
            _ => {}
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_hide_bodies() {
        let message = Message::body_chunk(&b"secret"[..]);
        assert_eq!(
            message.summary().to_string(),
            "{type: \"http.response.body\", body: <6 bytes>, more_body: true}"
        );
        assert_eq!(
            Message::HttpDisconnect.summary().to_string(),
            "{type: \"http.disconnect\"}"
        );
    }

    #[test]
    fn start_helper() {
        let message = Message::start(204, &[("Connection", "close")]);
        assert_eq!(message.message_type(), "http.response.start");
        match message {
            Message::ResponseStart { status, headers } => {
                assert_eq!(status, 204);
                assert_eq!(headers[0].0, "Connection");
            }
            _ => unreachable!(),
        }
    }
}

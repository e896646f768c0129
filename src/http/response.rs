//! Response wire encoding: header validation, chunk framing and the canned
//! responses the engine emits on its own behalf.

use bytes::{BufMut, Bytes, BytesMut};

use crate::http::status::status_line;

/// Interim response sent when an application starts reading a body the
/// client is holding back behind `Expect: 100-continue`.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Terminating chunk of a chunked body, trailer section included.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// `token` from RFC 9110.
pub fn is_valid_header_name(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|b| is_tchar(*b))
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Values may contain anything but CR, LF and NUL.
pub fn is_valid_header_value(value: &[u8]) -> bool {
    !value.iter().any(|b| matches!(b, b'\r' | b'\n' | 0))
}

/// Serialised status line plus header block, ending with the blank line.
pub fn encode_head<'a, I>(status: u16, headers: I) -> BytesMut
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(&status_line(status));
    for (name, value) in headers {
        buf.put_slice(name);
        buf.put_slice(b": ");
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

/// One chunk of a chunked body. Empty input yields nothing: an empty chunk
/// would terminate the body.
pub fn encode_chunk(data: &[u8]) -> Option<Bytes> {
    if data.is_empty() {
        return None;
    }
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    Some(buf.freeze())
}

/// A complete plain-text response that closes the connection.
pub fn plain_text_response(status: u16, body: &str, extra: &[(&[u8], &[u8])]) -> Bytes {
    let length = body.len().to_string();
    let mut headers: Vec<(&[u8], &[u8])> = vec![
        (&b"content-type"[..], &b"text/plain; charset=utf-8"[..]),
        (&b"content-length"[..], length.as_bytes()),
        (&b"connection"[..], &b"close"[..]),
    ];
    headers.extend_from_slice(extra);
    let mut buf = encode_head(status, headers);
    buf.put_slice(body.as_bytes());
    buf.freeze()
}

pub fn internal_server_error(extra: &[(&[u8], &[u8])]) -> Bytes {
    plain_text_response(500, "Internal Server Error", extra)
}

pub fn service_unavailable(extra: &[(&[u8], &[u8])]) -> Bytes {
    plain_text_response(503, "Service Unavailable", extra)
}

pub fn unsupported_upgrade(extra: &[(&[u8], &[u8])]) -> Bytes {
    plain_text_response(400, "Unsupported upgrade request.", extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_are_tokens() {
        assert!(is_valid_header_name(b"content-type"));
        assert!(is_valid_header_name(b"X-Custom_1"));
        assert!(!is_valid_header_name(b""));
        assert!(!is_valid_header_name(b"bad name"));
        assert!(!is_valid_header_name(b"bad:name"));
    }

    #[test]
    fn header_values_reject_line_breaks() {
        assert!(is_valid_header_value(b"text/plain; charset=utf-8"));
        assert!(!is_valid_header_value(b"a\r\nx-injected: 1"));
        assert!(!is_valid_header_value(b"a\0"));
    }

    #[test]
    fn chunks() {
        assert_eq!(encode_chunk(b"Hello, world!").unwrap(), &b"d\r\nHello, world!\r\n"[..]);
        assert!(encode_chunk(b"").is_none());
    }

    #[test]
    fn canned_responses() {
        let response = unsupported_upgrade(&[]);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("content-length: 28\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nUnsupported upgrade request."));

        let response = internal_server_error(&[(&b"server"[..], &b"portico"[..])]);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("server: portico\r\n"));
    }
}

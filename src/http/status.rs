//! Status codes and their reason phrases.
//!
//! Any `u16` in `100..=999` is accepted as a status code. Codes outside the
//! registry get a reason phrase derived from their class, so an application
//! sending `599` still produces a well-formed status line.

/// Registered reason phrase for `code`, if it has one.
pub fn canonical_reason(code: u16) -> Option<&'static str> {
    let reason = match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a Teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => return None,
    };
    Some(reason)
}

/// Reason phrase to put on the status line, registered or not.
pub fn reason_phrase(code: u16) -> &'static str {
    canonical_reason(code).unwrap_or(match code / 100 {
        1 => "Informational",
        2 => "Success",
        3 => "Redirection",
        4 => "Client Error",
        5 => "Server Error",
        _ => "Unknown",
    })
}

/// Responses with these statuses never carry a body, so they are never
/// chunked and never get a `content-length` synthesised for them.
pub fn forbids_body(code: u16) -> bool {
    (100..200).contains(&code) || code == 204 || code == 304
}

/// The status line for `code`, including the trailing CRLF.
pub fn status_line(code: u16) -> Vec<u8> {
    format!("HTTP/1.1 {} {}\r\n", code, reason_phrase(code)).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_codes() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(503), "Service Unavailable");
        assert_eq!(canonical_reason(426), Some("Upgrade Required"));
    }

    #[test]
    fn unknown_codes_get_class_phrase() {
        assert_eq!(canonical_reason(599), None);
        assert_eq!(reason_phrase(599), "Server Error");
        assert_eq!(reason_phrase(299), "Success");
        assert_eq!(reason_phrase(999), "Unknown");
    }

    #[test]
    fn status_line_format() {
        assert_eq!(status_line(404), b"HTTP/1.1 404 Not Found\r\n");
        assert_eq!(status_line(599), b"HTTP/1.1 599 Server Error\r\n");
    }

    #[test]
    fn bodyless_statuses() {
        assert!(forbids_body(100));
        assert!(forbids_body(204));
        assert!(forbids_body(304));
        assert!(!forbids_body(200));
    }
}

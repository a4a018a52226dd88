//! GlobalPlatform Amendment B HTTP admin wire codec.
//!
//! The admin protocol is pull-based HTTP/1.1: the card POSTs to the admin
//! path, carrying either an empty body (first contact) or the R-APDU of
//! the previous command, and the server answers with the next C-APDU or
//! `204 No Content` when the queue is drained.
//!
//! Both sides of the exchange live here so the server and the mobile
//! simulator frame traffic identically. Decoding is incremental: feed a
//! growing buffer, get [`Parsing::NeedMore`] until a complete message is
//! buffered. The reader is tolerant about line endings (`httparse`
//! accepts a bare LF) but strict about limits.

use bytes::{BufMut, BytesMut};

/// Media type of a C-APDU carried in a server response.
pub const CONTENT_TYPE_COMMAND: &str = "application/vnd.globalplatform.card-content-mgt";
/// Media type of an R-APDU carried in a card request.
pub const CONTENT_TYPE_RESPONSE: &str = "application/vnd.globalplatform.card-content-mgt-response";
/// Header naming the admin protocol revision the card speaks.
pub const ADMIN_PROTOCOL_HEADER: &str = "X-Admin-Protocol";
/// Assumed revision when the card sends no [`ADMIN_PROTOCOL_HEADER`].
pub const DEFAULT_ADMIN_PROTOCOL: &str = "globalPlatform.v1.0";

/// Upper bound on headers per message.
pub const MAX_HEADERS: usize = 32;
/// Upper bound on one header line (name + value) in bytes.
pub const MAX_HEADER_LINE: usize = 2048;
/// Upper bound on a message body in bytes.
pub const MAX_BODY: usize = 65_536;

/// Result of an incremental decode step.
#[derive(Debug)]
pub enum Parsing<T> {
    /// A full message was decoded; `offset` bytes of the buffer were
    /// consumed.
    Done {
        /// The decoded message.
        value: T,
        /// Bytes to advance the read buffer by.
        offset: usize,
    },
    /// The buffer does not hold a complete message yet.
    NeedMore,
}

/// Errors of the admin wire codec.
#[derive(Debug, thiserror::Error)]
pub enum AdminCodecError {
    /// Request/response head failed to parse as HTTP/1.1.
    #[error("malformed http head: {0}")]
    Malformed(&'static str),
    /// More than [`MAX_HEADERS`] headers.
    #[error("more than {MAX_HEADERS} headers")]
    TooManyHeaders,
    /// A header line exceeded [`MAX_HEADER_LINE`] bytes.
    #[error("header line exceeds {MAX_HEADER_LINE} bytes")]
    HeaderLineTooLong,
    /// Request lacked the mandatory `Content-Length`.
    #[error("missing Content-Length")]
    MissingContentLength,
    /// Declared body larger than [`MAX_BODY`].
    #[error("body of {0} bytes exceeds the {MAX_BODY} byte limit")]
    BodyTooLarge(usize),
    /// Card used a method other than POST.
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
}

impl AdminCodecError {
    /// HTTP status the server answers with before closing the session.
    pub fn status_code(&self) -> u16 {
        match self {
            AdminCodecError::BodyTooLarge(_) => 413,
            _ => 400,
        }
    }
}

/// A decoded admin request (card → server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRequest {
    /// Request target, e.g. `/admin`.
    pub path: String,
    /// Admin protocol revision, defaulted when absent.
    pub protocol: String,
    /// R-APDU bytes; empty on first contact.
    pub body: Vec<u8>,
}

/// A decoded admin response (server → card), as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Whether the server asked for the connection to be closed.
    pub close: bool,
    /// C-APDU bytes; empty on `204 No Content` and errors.
    pub body: Vec<u8>,
}

fn check_headers(headers: &[httparse::Header<'_>]) -> Result<(), AdminCodecError> {
    for h in headers {
        if h.name.len() + h.value.len() > MAX_HEADER_LINE {
            return Err(AdminCodecError::HeaderLineTooLong);
        }
    }
    Ok(())
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<Option<usize>, AdminCodecError> {
    for h in headers {
        if h.name.eq_ignore_ascii_case("content-length") {
            let n = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or(AdminCodecError::Malformed("unparseable Content-Length"))?;
            return Ok(Some(n));
        }
    }
    Ok(None)
}

fn header_value<'a>(headers: &'a [httparse::Header<'_>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

/// Decodes one admin request from `buf`.
///
/// On [`Parsing::Done`] the caller must advance the buffer by `offset`.
pub fn decode_request(buf: &[u8]) -> Result<Parsing<AdminRequest>, AdminCodecError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            // a head that cannot fit the limits will never complete
            if buf.len() > MAX_HEADERS * MAX_HEADER_LINE {
                return Err(AdminCodecError::Malformed("oversized head"));
            }
            return Ok(Parsing::NeedMore);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(AdminCodecError::TooManyHeaders),
        Err(_) => return Err(AdminCodecError::Malformed("invalid request head")),
    };
    check_headers(req.headers)?;
    match req.method {
        Some("POST") => {}
        Some(other) => return Err(AdminCodecError::UnsupportedMethod(other.to_owned())),
        None => return Err(AdminCodecError::Malformed("missing method")),
    }
    let path = req
        .path
        .ok_or(AdminCodecError::Malformed("missing path"))?
        .to_owned();
    let body_len = content_length(req.headers)?.ok_or(AdminCodecError::MissingContentLength)?;
    if body_len > MAX_BODY {
        return Err(AdminCodecError::BodyTooLarge(body_len));
    }
    if buf.len() < head_len + body_len {
        return Ok(Parsing::NeedMore);
    }
    let protocol = header_value(req.headers, ADMIN_PROTOCOL_HEADER)
        .unwrap_or(DEFAULT_ADMIN_PROTOCOL)
        .to_owned();
    Ok(Parsing::Done {
        value: AdminRequest {
            path,
            protocol,
            body: buf[head_len..head_len + body_len].to_vec(),
        },
        offset: head_len + body_len,
    })
}

/// Decodes one admin response from `buf` (simulator side).
pub fn decode_response(buf: &[u8]) -> Result<Parsing<AdminResponseHead>, AdminCodecError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    let head_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADERS * MAX_HEADER_LINE {
                return Err(AdminCodecError::Malformed("oversized head"));
            }
            return Ok(Parsing::NeedMore);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(AdminCodecError::TooManyHeaders),
        Err(_) => return Err(AdminCodecError::Malformed("invalid response head")),
    };
    check_headers(resp.headers)?;
    let status = resp
        .code
        .ok_or(AdminCodecError::Malformed("missing status code"))?;
    let close = header_value(resp.headers, "connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("close"));
    // 204 carries no body by definition
    let body_len = if status == 204 {
        0
    } else {
        content_length(resp.headers)?.unwrap_or(0)
    };
    if body_len > MAX_BODY {
        return Err(AdminCodecError::BodyTooLarge(body_len));
    }
    if buf.len() < head_len + body_len {
        return Ok(Parsing::NeedMore);
    }
    Ok(Parsing::Done {
        value: AdminResponseHead {
            status,
            close,
            body: buf[head_len..head_len + body_len].to_vec(),
        },
        offset: head_len + body_len,
    })
}

/// Encodes a card request (simulator side). `body` is the previous
/// R-APDU, or empty on first contact.
pub fn encode_request(path: &str, host: &str, protocol: &str, body: &[u8], buf: &mut BytesMut) {
    buf.put_slice(format!("POST {path} HTTP/1.1\r\n").as_bytes());
    buf.put_slice(format!("Host: {host}\r\n").as_bytes());
    buf.put_slice(format!("Content-Type: {CONTENT_TYPE_RESPONSE}\r\n").as_bytes());
    buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.put_slice(format!("{ADMIN_PROTOCOL_HEADER}: {protocol}\r\n").as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
}

/// Encodes a `200 OK` server response carrying the next C-APDU.
pub fn encode_command_response(apdu: &[u8], keep_alive: bool, buf: &mut BytesMut) {
    buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    buf.put_slice(b"Cache-Control: no-store\r\n");
    buf.put_slice(connection_header(keep_alive));
    buf.put_slice(format!("Content-Type: {CONTENT_TYPE_COMMAND}\r\n").as_bytes());
    buf.put_slice(format!("Content-Length: {}\r\n", apdu.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(apdu);
}

/// Encodes the terminal `204 No Content` that signals session end.
pub fn encode_no_content(buf: &mut BytesMut) {
    buf.put_slice(b"HTTP/1.1 204 No Content\r\n");
    buf.put_slice(b"Cache-Control: no-store\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"\r\n");
}

/// Encodes an error response. The connection is always closed afterwards.
pub fn encode_error_response(status: u16, reason: &str, buf: &mut BytesMut) {
    buf.put_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    buf.put_slice(b"Cache-Control: no-store\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-Length: 0\r\n");
    buf.put_slice(b"\r\n");
}

fn connection_header(keep_alive: bool) -> &'static [u8] {
    if keep_alive {
        b"Connection: keep-alive\r\n"
    } else {
        b"Connection: close\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done<T>(parsing: Parsing<T>) -> (T, usize) {
        match parsing {
            Parsing::Done { value, offset } => (value, offset),
            Parsing::NeedMore => panic!("expected a complete message"),
        }
    }

    #[test]
    fn decodes_initial_pull() {
        let raw = b"POST /admin HTTP/1.1\r\n\
            Host: bench\r\n\
            Content-Type: application/vnd.globalplatform.card-content-mgt-response\r\n\
            Content-Length: 0\r\n\
            X-Admin-Protocol: globalPlatform.v1.0\r\n\r\n";
        let (req, offset) = done(decode_request(raw).expect("decodes"));
        assert_eq!(offset, raw.len());
        assert_eq!(req.path, "/admin");
        assert_eq!(req.protocol, "globalPlatform.v1.0");
        assert!(req.body.is_empty());
    }

    #[test]
    fn decodes_response_body_and_defaults_protocol() {
        let raw = b"POST /admin HTTP/1.1\r\nContent-Length: 2\r\n\r\n\x90\x00extra";
        let (req, offset) = done(decode_request(raw).expect("decodes"));
        assert_eq!(req.body, vec![0x90, 0x00]);
        assert_eq!(req.protocol, DEFAULT_ADMIN_PROTOCOL);
        // pipelined follow-up bytes stay in the buffer
        assert_eq!(offset, raw.len() - "extra".len());
    }

    #[test]
    fn tolerates_bare_lf_line_endings() {
        let raw = b"POST /admin HTTP/1.1\nHost: bench\nContent-Length: 0\n\n";
        let (req, _) = done(decode_request(raw).expect("decodes"));
        assert_eq!(req.path, "/admin");
    }

    #[test]
    fn incremental_parse_waits_for_body() {
        let raw: &[u8] = b"POST /admin HTTP/1.1\r\nContent-Length: 4\r\n\r\n\x61\x20";
        assert!(matches!(decode_request(raw), Ok(Parsing::NeedMore)));
        let mut full = raw.to_vec();
        full.extend_from_slice(&[0x90, 0x00]);
        let (req, _) = done(decode_request(&full).expect("decodes"));
        assert_eq!(req.body.len(), 4);
    }

    #[test]
    fn rejects_missing_content_length() {
        let raw = b"POST /admin HTTP/1.1\r\nHost: bench\r\n\r\n";
        assert!(matches!(
            decode_request(raw),
            Err(AdminCodecError::MissingContentLength)
        ));
    }

    #[test]
    fn rejects_oversized_body_with_413() {
        let raw = format!("POST /admin HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY + 1);
        let err = decode_request(raw.as_bytes()).expect_err("must reject");
        assert!(matches!(err, AdminCodecError::BodyTooLarge(_)));
        assert_eq!(err.status_code(), 413);
    }

    #[test]
    fn rejects_non_post() {
        let raw = b"GET /admin HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(
            decode_request(raw),
            Err(AdminCodecError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn rejects_oversized_header_line() {
        let raw = format!(
            "POST /admin HTTP/1.1\r\nX-Filler: {}\r\nContent-Length: 0\r\n\r\n",
            "a".repeat(MAX_HEADER_LINE + 1)
        );
        assert!(matches!(
            decode_request(raw.as_bytes()),
            Err(AdminCodecError::HeaderLineTooLong)
        ));
    }

    #[test]
    fn command_response_roundtrip() {
        let apdu = [0x00, 0xA4, 0x04, 0x00];
        let mut buf = BytesMut::new();
        encode_command_response(&apdu, true, &mut buf);
        let (resp, offset) = done(decode_response(&buf).expect("decodes"));
        assert_eq!(offset, buf.len());
        assert_eq!(resp.status, 200);
        assert!(!resp.close);
        assert_eq!(resp.body, apdu);
    }

    #[test]
    fn no_content_closes_connection() {
        let mut buf = BytesMut::new();
        encode_no_content(&mut buf);
        let (resp, _) = done(decode_response(&buf).expect("decodes"));
        assert_eq!(resp.status, 204);
        assert!(resp.close);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn request_encode_matches_server_decode() {
        let mut buf = BytesMut::new();
        encode_request("/admin", "bench:8443", DEFAULT_ADMIN_PROTOCOL, &[0x90, 0x00], &mut buf);
        let (req, _) = done(decode_request(&buf).expect("decodes"));
        assert_eq!(req.path, "/admin");
        assert_eq!(req.body, vec![0x90, 0x00]);
    }
}

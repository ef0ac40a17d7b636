//! Minimal HTTP/1.1 subset: request-line/header parsing, response
//! writing, and the per-connection keep-alive loop.
//!
//! Grounded on `pmoupnp::ssdp::server` (hand-formatted HTTP-style text
//! over a raw socket, `format!`-built responses) and
//! `imbolc-net::server` (std `TcpListener`/`TcpStream` +
//! thread-per-connection loop), generalized from UDP broadcast /
//! length-prefixed framing to a real request/response cycle.
//!
//! Header parsing is bounded (64 KiB total, 100 lines) per spec.md §9's
//! "HTTP parser robustness" note, to defend against slow-loris-style
//! memory exhaustion.

use std::collections::HashMap;
use std::io::{BufRead, Read, Write};

use pmodmap::{encode, ContentNode};
use tracing::{debug, warn};

use crate::error::ErrorKind;

/// Header block size cap, matching spec.md §9's "64 KiB of headers".
const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Header line count cap, matching spec.md §9's "100 lines".
const MAX_HEADER_LINES: usize = 100;
/// Chunk size used both for reading audio files and writing the
/// response body, per spec.md §5's "fixed 8 KiB chunks".
pub const STREAM_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub enum RequestError {
    /// The connection closed before a single byte of the next request
    /// arrived: a clean end of the keep-alive loop, not an error.
    Eof,
    /// A request line or header violated the subset the server accepts.
    Malformed,
    HeadersTooLarge,
    TooManyHeaderLines,
    Io(std::io::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        RequestError::Io(e)
    }
}

/// A parsed request: method, path, query parameters, and the handful of
/// headers the server recognizes.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub connection_close: bool,
    /// Parsed from `Range: bytes=<off>-`; absent for any other shape,
    /// including malformed ranges (treated as "no range", per spec.md §7).
    pub range_start: Option<u64>,
    /// `(username, password)` decoded from `Authorization: Basic`.
    /// `username` is `None` when the decoded credentials have no `:`
    /// separator content before it (password-only auth).
    pub basic_auth: Option<(Option<String>, String)>,
}

/// Reads and parses one request from `reader`. Returns `Err(Eof)` if the
/// connection closed before any bytes of a new request arrived — the
/// normal way a keep-alive loop ends.
pub fn read_request(reader: &mut impl BufRead) -> Result<ParsedRequest, RequestError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(RequestError::Eof);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(RequestError::Malformed),
    };
    if !version.starts_with("HTTP/1.") {
        return Err(RequestError::Malformed);
    }
    if method != "GET" {
        return Err(RequestError::Malformed);
    }

    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let path = percent_decode(path);
    let query = parse_query(query_str);

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut total_bytes = n;
    let mut line_count = 0usize;
    loop {
        let mut header_line = String::new();
        let read = reader.read_line(&mut header_line)?;
        if read == 0 {
            return Err(RequestError::Eof);
        }
        total_bytes += read;
        if total_bytes > MAX_HEADER_BYTES {
            return Err(RequestError::HeadersTooLarge);
        }
        line_count += 1;
        if line_count > MAX_HEADER_LINES {
            return Err(RequestError::TooManyHeaderLines);
        }
        let header_line = header_line.trim_end_matches(['\r', '\n']);
        if header_line.is_empty() {
            break;
        }
        if let Some((key, value)) = header_line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        // Malformed header lines (no colon) are tolerated per spec.md §7: skipped.
    }

    let connection_close = headers
        .get("connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false);

    let range_start = headers.get("range").and_then(|v| parse_range(v));
    let basic_auth = headers.get("authorization").and_then(|v| parse_basic_auth(v));

    Ok(ParsedRequest {
        method: method.to_string(),
        path,
        query,
        connection_close,
        range_start,
        basic_auth,
    })
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        map.insert(percent_decode(k), percent_decode(v));
    }
    map
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses `Range: bytes=<off>-`, the only shape the server recognizes.
/// Anything else (a closed range, multiple ranges, garbage) is treated
/// as "no range supplied" by returning `None`, per spec.md §7.
fn parse_range(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    if !end.is_empty() {
        return None;
    }
    start.parse().ok()
}

fn parse_basic_auth(value: &str) -> Option<(Option<String>, String)> {
    use base64::Engine;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    let username = if user.is_empty() { None } else { Some(user.to_string()) };
    Some((username, pass.to_string()))
}

pub fn query_u64(query: &HashMap<String, String>, key: &str) -> u64 {
    query.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// A response writer over any `Write`, bound to one server identity.
pub struct ResponseWriter<'a, W: Write> {
    writer: &'a mut W,
    server_name: &'a str,
}

impl<'a, W: Write> ResponseWriter<'a, W> {
    pub fn new(writer: &'a mut W, server_name: &'a str) -> Self {
        Self { writer, server_name }
    }

    fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        content_type: &str,
        content_length: u64,
        extra: &[(&str, String)],
    ) -> std::io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {status} {reason}\r\nDAAP-Server: {}\r\nContent-Type: {content_type}\r\nContent-Length: {content_length}\r\n",
            self.server_name
        );
        for (k, v) in extra {
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        head.push_str("\r\n");
        self.writer.write_all(head.as_bytes())
    }

    /// `write_dmap(code, node)` → status 200, `application/x-dmap-tagged`.
    pub fn write_dmap(&mut self, node: &ContentNode) -> std::io::Result<()> {
        let body = encode(node);
        self.write_head(200, "OK", "application/x-dmap-tagged", body.len() as u64, &[])?;
        self.writer.write_all(&body)?;
        self.writer.flush()
    }

    /// `write_error(code, text)`.
    pub fn write_error(&mut self, err: &ErrorKind) -> std::io::Result<()> {
        let body = err.body_text();
        self.write_head(
            err.status_code(),
            err.reason_phrase(),
            "text/plain",
            body.len() as u64,
            &[],
        )?;
        self.writer.write_all(body.as_bytes())?;
        self.writer.flush()
    }

    /// Status and reason phrase with no body at all, used for the
    /// unknown-path catch-all (`anything else → 403 empty body`), distinct
    /// from `write_error`'s short text bodies for known error paths.
    pub fn write_error_empty_body(&mut self, err: &ErrorKind) -> std::io::Result<()> {
        self.write_head(err.status_code(), err.reason_phrase(), "text/plain", 0, &[])?;
        self.writer.flush()
    }

    /// `write_auth_challenge(realm)` → 401 with `WWW-Authenticate`.
    pub fn write_auth_challenge(&mut self, realm: &str) -> std::io::Result<()> {
        let body = b"unauthorized";
        let www_authenticate = format!("Basic realm=\"{realm}\"");
        self.write_head(
            401,
            "Unauthorized",
            "text/plain",
            body.len() as u64,
            &[("WWW-Authenticate", www_authenticate)],
        )?;
        self.writer.write_all(body)?;
        self.writer.flush()
    }

    /// `write_file(stream, length, offset)`.
    ///
    /// `offset` is the byte the caller already positioned `reader` at
    /// (via the library adapter's `open_audio`). `offset == 0` (whether
    /// from an absent `Range` header or an explicit `bytes=0-`) yields a
    /// plain 200; any other offset yields 206 with the non-standard
    /// `Content-Range: bytes off-len/len+1` form preserved for client
    /// compatibility (spec.md §9). `mime` comes from the track's format
    /// hint (see `crate::router::audio_mime_for_format`).
    pub fn write_file(&mut self, reader: &mut dyn Read, length: u64, offset: u64, mime: &str) -> std::io::Result<()> {
        let remaining = length.saturating_sub(offset);
        if offset == 0 {
            self.write_head(200, "OK", mime, remaining, &[])?;
        } else {
            let content_range = format!("bytes {}-{}/{}", offset, length, length + 1);
            self.write_head(206, "Partial Content", mime, remaining, &[("Content-Range", content_range)])?;
        }
        self.stream_body(reader, remaining)
    }

    /// `write_artwork(bytes, mime)` → 200, `image/<mime>`.
    pub fn write_artwork(&mut self, bytes: &[u8], mime: &str) -> std::io::Result<()> {
        let content_type = format!("image/{mime}");
        self.write_head(200, "OK", &content_type, bytes.len() as u64, &[])?;
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    /// Streams `remaining` bytes from `reader` in
    /// [`STREAM_CHUNK_SIZE`]-byte blocks until that many bytes have been
    /// sent or the source is exhausted.
    fn stream_body(&mut self, reader: &mut dyn Read, mut remaining: u64) -> std::io::Result<()> {
        let mut buf = [0u8; STREAM_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.writer.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        self.writer.flush()
    }
}

/// Runs the keep-alive loop for one accepted connection: parse a
/// request, dispatch it, write the response, repeat until EOF,
/// `Connection: close`, an I/O error, or the dispatcher asks to close.
///
/// `dispatch` returns `true` when the connection should close after this
/// response (e.g. `/logout`, artwork streaming). The connection's read
/// and write halves are split via `TcpStream::try_clone` so the reader
/// can sit behind a `BufReader` while the writer stays directly
/// reachable for `dispatch` and for writing a parse-error response.
pub fn serve_connection<D>(
    stream: std::net::TcpStream,
    peer: std::net::SocketAddr,
    server_name: &str,
    dispatch: D,
) where
    D: Fn(&ParsedRequest, std::net::SocketAddr, &mut std::net::TcpStream) -> std::io::Result<bool>,
{
    let read_half = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer, error = %e, "failed to clone connection for reading");
            return;
        }
    };
    let mut reader = std::io::BufReader::new(read_half);
    let mut writer = stream;

    loop {
        let request = match read_request(&mut reader) {
            Ok(req) => req,
            Err(RequestError::Eof) => break,
            Err(RequestError::Malformed)
            | Err(RequestError::HeadersTooLarge)
            | Err(RequestError::TooManyHeaderLines) => {
                let mut response = ResponseWriter::new(&mut writer, server_name);
                let _ = response.write_error(&ErrorKind::MalformedRequest);
                break;
            }
            Err(RequestError::Io(e)) => {
                debug!(peer = %peer, error = %e, "connection I/O error while reading request");
                break;
            }
        };

        let close_requested = request.connection_close;
        match dispatch(&request, peer, &mut writer) {
            Ok(handler_close) => {
                if close_requested || handler_close {
                    break;
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "connection I/O error while writing response");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &str) -> ParsedRequest {
        let mut reader = std::io::BufReader::new(Cursor::new(raw.as_bytes().to_vec()));
        read_request(&mut reader).expect("request should parse")
    }

    #[test]
    fn parses_path_and_query_parameters() {
        let req = parse("GET /databases/1/items?session-id=5&meta=dmap.itemid,dmap.itemname HTTP/1.1\r\n\r\n");
        assert_eq!(req.path, "/databases/1/items");
        assert_eq!(req.query.get("session-id").unwrap(), "5");
        assert_eq!(req.query.get("meta").unwrap(), "dmap.itemid,dmap.itemname");
    }

    #[test]
    fn rejects_non_get_method() {
        let mut reader = std::io::BufReader::new(Cursor::new(b"POST / HTTP/1.1\r\n\r\n".to_vec()));
        let err = read_request(&mut reader).unwrap_err();
        assert!(matches!(err, RequestError::Malformed));
    }

    #[test]
    fn eof_on_empty_connection() {
        let mut reader = std::io::BufReader::new(Cursor::new(Vec::new()));
        let err = read_request(&mut reader).unwrap_err();
        assert!(matches!(err, RequestError::Eof));
    }

    #[test]
    fn connection_close_header_is_recognized() {
        let req = parse("GET /server-info HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(req.connection_close);
    }

    #[test]
    fn range_bytes_n_dash_is_parsed() {
        let req = parse("GET /x HTTP/1.1\r\nRange: bytes=200-\r\n\r\n");
        assert_eq!(req.range_start, Some(200));
    }

    #[test]
    fn closed_range_is_treated_as_no_range() {
        let req = parse("GET /x HTTP/1.1\r\nRange: bytes=200-400\r\n\r\n");
        assert_eq!(req.range_start, None);
    }

    #[test]
    fn malformed_range_is_treated_as_no_range() {
        let req = parse("GET /x HTTP/1.1\r\nRange: nonsense\r\n\r\n");
        assert_eq!(req.range_start, None);
    }

    #[test]
    fn basic_auth_decodes_username_and_password() {
        // base64("alice:secret")
        let req = parse("GET /login HTTP/1.1\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n");
        assert_eq!(req.basic_auth, Some((Some("alice".to_string()), "secret".to_string())));
    }

    #[test]
    fn basic_auth_with_empty_username_is_password_only() {
        // base64(":hunter2")
        let req = parse("GET /login HTTP/1.1\r\nAuthorization: Basic Omh1bnRlcjI=\r\n\r\n");
        assert_eq!(req.basic_auth, Some((None, "hunter2".to_string())));
    }

    #[test]
    fn malformed_header_line_without_colon_is_tolerated() {
        let req = parse("GET /server-info HTTP/1.1\r\nnot-a-header\r\n\r\n");
        assert_eq!(req.path, "/server-info");
    }

    #[test]
    fn header_block_over_size_cap_is_rejected() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..2000 {
            raw.push_str(&format!("X-Pad-{i}: {}\r\n", "a".repeat(64)));
        }
        raw.push_str("\r\n");
        let mut reader = std::io::BufReader::new(Cursor::new(raw.into_bytes()));
        let err = read_request(&mut reader).unwrap_err();
        assert!(matches!(err, RequestError::HeadersTooLarge));
    }

    #[test]
    fn write_file_range_zero_is_status_200() {
        let mut body = Cursor::new(vec![b'x'; 1000]);
        let mut out = Vec::new();
        {
            let mut writer = ResponseWriter::new(&mut out, "Test");
            writer.write_file(&mut body, 1000, 0, "audio/mpeg").unwrap();
        }
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(!text.contains("Content-Range"));
    }

    #[test]
    fn write_file_nonzero_offset_is_206_with_documented_content_range() {
        let mut body = Cursor::new(vec![b'x'; 800]);
        let mut out = Vec::new();
        {
            let mut writer = ResponseWriter::new(&mut out, "Test");
            writer.write_file(&mut body, 1000, 200, "audio/mpeg").unwrap();
        }
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 206 Partial Content"));
        assert!(text.contains("Content-Range: bytes 200-1000/1001"));
        assert!(text.contains("Content-Length: 800"));
    }
}

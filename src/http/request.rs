//! Incremental HTTP request parsing.
//!
//! Generalizes the teacher's single-shot `Parser` (which assumed one socket
//! read delivered an entire request) into a true incremental state machine:
//! `RequestLine -> Headers -> (Paused) -> Body -> Done`. The codec pauses at
//! two points — headers complete, message complete — matching the external
//! driver contract the connection loop uses (reading more off the socket
//! between pauses). Chunked bodies are unwrapped through a nested
//! [`ChunkState`](crate::http::scan::ChunkState) machine; the low-level
//! line/header scanning is shared with the client's response codec via
//! [`crate::http::scan`].
//!
//! Like the teacher's `Parser`, this one owns its read buffer (sized once
//! from [`ReqLimits`] at connection-creation time) rather than borrowing one
//! from the caller — the `'static` slices handed to [`Request`] are only
//! valid until that buffer is cleared by [`Parser::reset`].

use crate::{
    errors::ErrorKind,
    http::{
        query::Query,
        scan::{find_line, split_header, ChunkState},
        types::{slice_to_u64_hex, Header, HeaderMap, Method, Url, Version},
    },
    limits::ReqLimits,
    server::arena::Arena,
};
use memchr::memchr;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{io::AsyncReadExt, net::TcpStream, time::sleep};

const UNSET_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// A parsed HTTP request. Borrowed fields remain valid only until the
/// owning [`Parser`]'s buffer is reset for the next request cycle.
#[repr(align(128))]
pub struct Request {
    method: Method,
    url: Url,
    version: Version,
    headers: HeaderMap,
    body: Option<&'static [u8]>,
    /// Connection-scoped, not cleared by [`Request::reset`]: every request on
    /// the same keep-alive connection shares the same peer/local addresses.
    pub(crate) client_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
}

impl Request {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            method: Method::Get,
            url: Url::new(limits),
            version: Version::Http11,
            headers: HeaderMap::new(limits.header_count),
            body: None,
            client_addr: UNSET_ADDR,
            server_addr: UNSET_ADDR,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.version = Version::Http11;
        self.headers.reset();
        self.body = None;
    }

    /// The parsed HTTP method.
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The parsed URL (path, segments, and raw query).
    #[inline(always)]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The negotiated HTTP version for this message.
    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Looks up a header value by case-insensitive name.
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// All values for a (possibly repeated) header name.
    #[inline(always)]
    pub fn headers(&self, name: &[u8]) -> impl Iterator<Item = &[u8]> {
        self.headers.get_all(name)
    }

    /// The declared `Content-Length`, if the request used one (absent for
    /// chunked bodies).
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// The fully-buffered request body, if any bytes were received.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }

    pub(crate) fn set_body(&mut self, body: &'static [u8]) {
        self.body = Some(body);
    }

    /// The remote peer's address, as seen by the server's TCP listener.
    #[inline(always)]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// The local address the connection was accepted on.
    #[inline(always)]
    pub const fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }
}

/// Where the incremental parser currently stands within one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Paused,
    Body,
    Done,
}

/// Result of one [`Parser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedOutcome {
    NeedMore,
    HeadersComplete { consumed: usize },
    MessageComplete { consumed: usize },
}

/// The incremental request codec. Owns a fixed-size read buffer (sized from
/// [`ReqLimits`] at construction) filled directly off the socket; request
/// fields borrow straight out of it rather than copying.
pub(crate) struct Parser {
    buffer: Box<[u8]>,
    filled: usize,

    state: ParseState,
    chunk_state: ChunkState,
    scan: usize,
    has_crlf: bool,
    header_count: usize,
    chunked: bool,
    content_length: Option<usize>,
    body_delivered: usize,
    last_filled: usize,
    keep_alive: bool,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            buffer: vec![0u8; limits.precalc.buffer].into_boxed_slice(),
            filled: 0,

            state: ParseState::RequestLine,
            chunk_state: ChunkState::Start,
            scan: 0,
            has_crlf: true,
            header_count: 0,
            chunked: false,
            content_length: None,
            body_delivered: 0,
            last_filled: 0,
            keep_alive: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn from<V: AsRef<[u8]>>(limits: &ReqLimits, value: V) -> Self {
        let value = value.as_ref();
        let mut buffer = vec![0u8; limits.precalc.buffer.max(value.len())];
        buffer[..value.len()].copy_from_slice(value);

        Self {
            buffer: buffer.into_boxed_slice(),
            filled: value.len(),

            state: ParseState::RequestLine,
            chunk_state: ChunkState::Start,
            scan: 0,
            has_crlf: true,
            header_count: 0,
            chunked: false,
            content_length: None,
            body_delivered: 0,
            last_filled: 0,
            keep_alive: true,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.fill(0);
        self.filled = 0;

        self.state = ParseState::RequestLine;
        self.chunk_state = ChunkState::Start;
        self.scan = 0;
        self.has_crlf = true;
        self.header_count = 0;
        self.chunked = false;
        self.content_length = None;
        self.body_delivered = 0;
        self.last_filled = 0;
        self.keep_alive = true;
    }

    /// Bytes consumed so far out of the internal buffer.
    #[inline(always)]
    pub(crate) fn consumed_bytes(&self) -> usize {
        self.scan
    }

    #[inline(always)]
    pub(crate) fn should_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub(crate) fn is_body_complete(&self) -> bool {
        match self.state {
            ParseState::Done => true,
            ParseState::Body if self.chunked => self.chunk_state == ChunkState::Done,
            ParseState::Body => self
                .content_length
                .is_none_or(|len| self.body_delivered >= len),
            _ => false,
        }
    }

    /// `true` once bytes belonging to a next, pipelined request are already
    /// sitting past the end of the one just finished. Pipelining isn't
    /// supported, so the connection should be closed rather than risk
    /// silently dropping those bytes.
    #[inline(always)]
    pub(crate) fn has_trailing_bytes(&self) -> bool {
        self.is_body_complete() && self.filled > self.scan
    }

    /// Releases a pause caused by headers-complete, letting the next `feed`
    /// advance into body parsing.
    #[inline(always)]
    pub(crate) fn resume_parsing(&mut self) {
        if self.state == ParseState::Paused {
            self.state = ParseState::Body;
        }
    }

    /// Signals EOF to the codec. Used when a message with no declared
    /// length must terminate at connection close.
    pub(crate) fn finish(&mut self) {
        if !self.chunked && self.content_length.is_none() {
            self.state = ParseState::Done;
        }
    }

    #[inline(always)]
    fn current(&self) -> &[u8] {
        &self.buffer[..self.filled]
    }

    /// Reads more bytes off `stream` into the tail of the internal buffer.
    /// Returns `0` on EOF. Errors if the buffer (sized for the worst-case
    /// request under the configured limits) is already exhausted.
    pub(crate) async fn fill_buffer(
        &mut self,
        stream: &mut TcpStream,
        timeout: Duration,
    ) -> Result<usize, ErrorKind> {
        if self.filled >= self.buffer.len() {
            return Err(ErrorKind::BodyTooLarge);
        }

        tokio::select! {
            biased;

            read_result = stream.read(&mut self.buffer[self.filled..]) => {
                let n = read_result?;
                self.filled += n;
                Ok(n)
            }
            _ = sleep(timeout) => {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout").into())
            },
        }
    }

    /// Advances parsing as far as the currently-filled buffer allows.
    pub(crate) fn feed(&mut self, request: &mut Request, limits: &ReqLimits) -> Result<FeedOutcome, ErrorKind> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some((line, next)) = find_line(self.current(), self.scan) else {
                        if self.filled - self.scan > limits.precalc.first_line {
                            return Err(ErrorKind::InvalidMethod);
                        }
                        return Ok(FeedOutcome::NeedMore);
                    };
                    // SAFETY: see `Arena::into_static` — valid until this
                    // parser's buffer is next reset, which only happens
                    // after the request cycle this line belongs to ends.
                    let line: &'static [u8] = unsafe { Arena::into_static(line) };
                    self.parse_request_line(line, request, limits)?;
                    self.scan = next;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some((line, next)) = find_line(self.current(), self.scan) else {
                        if self.filled - self.scan > limits.precalc.h_line {
                            return Err(ErrorKind::InvalidHeader);
                        }
                        return Ok(FeedOutcome::NeedMore);
                    };
                    let line: &'static [u8] = unsafe { Arena::into_static(line) };
                    self.scan = next;
                    if line.is_empty() {
                        self.state = ParseState::Paused;
                        return Ok(FeedOutcome::HeadersComplete { consumed: self.scan });
                    }
                    self.parse_header_line(line, request, limits)?;
                }
                ParseState::Paused => return Ok(FeedOutcome::NeedMore),
                ParseState::Body => {
                    if self.is_body_complete() {
                        self.state = ParseState::Done;
                        return Ok(FeedOutcome::MessageComplete { consumed: self.scan });
                    }
                    return Ok(FeedOutcome::NeedMore);
                }
                ParseState::Done => return Ok(FeedOutcome::MessageComplete { consumed: self.scan }),
            }
        }
    }

    /// Copies up to `dest.len()` decoded body bytes out of the internal
    /// buffer, unwrapping chunk framing when needed. Returns the count
    /// written; the same value is retrievable afterward via
    /// [`Parser::body_filled`].
    pub(crate) fn prepare_body_read(&mut self, dest: &mut [u8], max_body_size: usize) -> Result<usize, ErrorKind> {
        if !self.chunked {
            let remaining = self.content_length.unwrap_or(0).saturating_sub(self.body_delivered);
            let avail = self.filled.saturating_sub(self.scan);
            let n = dest.len().min(remaining).min(avail);
            dest[..n].copy_from_slice(&self.buffer[self.scan..self.scan + n]);
            self.scan += n;
            self.body_delivered += n;
            self.last_filled = n;
            return Ok(n);
        }

        let mut written = 0usize;
        loop {
            if written >= dest.len() {
                break;
            }
            match self.chunk_state {
                ChunkState::Start => {
                    let Some((line, next)) = find_line(self.current(), self.scan) else {
                        break;
                    };
                    let size_part = match memchr(b';', line) {
                        Some(i) => &line[..i],
                        None => line,
                    };
                    let size = slice_to_u64_hex(size_part).ok_or(ErrorKind::InvalidChunkSize)? as usize;
                    self.scan = next;
                    if size == 0 {
                        self.chunk_state = ChunkState::Trailer;
                    } else {
                        if self.body_delivered + size > max_body_size {
                            return Err(ErrorKind::ChunkTooLarge);
                        }
                        self.chunk_state = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(remaining) => {
                    let avail = self.filled - self.scan;
                    let take = (dest.len() - written).min(remaining).min(avail);
                    if take == 0 {
                        break;
                    }
                    dest[written..written + take].copy_from_slice(&self.buffer[self.scan..self.scan + take]);
                    self.scan += take;
                    written += take;
                    self.body_delivered += take;
                    let left = remaining - take;
                    self.chunk_state = if left == 0 { ChunkState::End } else { ChunkState::Data(left) };
                }
                ChunkState::End => {
                    let Some((line, next)) = find_line(self.current(), self.scan) else {
                        break;
                    };
                    if !line.is_empty() {
                        return Err(ErrorKind::InvalidChunkTrailer);
                    }
                    self.scan = next;
                    self.chunk_state = ChunkState::Start;
                }
                ChunkState::Trailer => {
                    let Some((line, next)) = find_line(self.current(), self.scan) else {
                        break;
                    };
                    self.scan = next;
                    if line.is_empty() {
                        self.chunk_state = ChunkState::Done;
                        break;
                    }
                    // Trailer headers are scanned past but not merged into
                    // the request's header map.
                }
                ChunkState::Done => break,
            }
        }
        self.last_filled = written;
        Ok(written)
    }

    #[inline(always)]
    pub(crate) fn body_filled(&self) -> usize {
        self.last_filled
    }

    fn parse_request_line(&mut self, line: &'static [u8], request: &mut Request, limits: &ReqLimits) -> Result<(), ErrorKind> {
        let (method, consumed) = Method::from_bytes(line)?;
        request.method = method;
        let rest = &line[consumed..];

        let sp = memchr(b' ', rest).ok_or(ErrorKind::InvalidUrl)?;
        let (url_bytes, version_part) = rest.split_at(sp);
        let version_bytes = &version_part[1..];

        self.parse_url(url_bytes, request, limits)?;

        let (version, default_keep_alive) = Version::from_bytes(version_bytes)?;
        request.version = version;
        self.keep_alive = default_keep_alive;
        Ok(())
    }

    fn parse_url(&mut self, url_bytes: &'static [u8], request: &mut Request, limits: &ReqLimits) -> Result<(), ErrorKind> {
        if url_bytes.is_empty() || url_bytes.len() > limits.url_size || url_bytes[0] != b'/' {
            return Err(ErrorKind::InvalidUrl);
        }

        request.url.target = url_bytes;
        let (path, query) = match memchr(b'?', url_bytes) {
            Some(i) => (&url_bytes[..i], Some(&url_bytes[i + 1..])),
            None => (url_bytes, None),
        };
        request.url.path = path;
        request.url.query = query;

        request.url.parts.clear();
        for part in path.split(|&b| b == b'/') {
            if part.is_empty() {
                continue;
            }
            if request.url.parts.len() >= limits.url_parts {
                return Err(ErrorKind::InvalidUrl);
            }
            request.url.parts.push(part);
        }

        request.url.query_parts.clear();
        if let Some(q) = query {
            if !q.is_empty() {
                Query::parse_into(&mut request.url.query_parts, q, limits.url_query_parts)?;
            }
        }
        Ok(())
    }

    fn parse_header_line(&mut self, line: &'static [u8], request: &mut Request, limits: &ReqLimits) -> Result<(), ErrorKind> {
        self.header_count += 1;
        if self.header_count > limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let (name, value) = split_header(line).ok_or(ErrorKind::InvalidHeader)?;
        if name.len() > limits.header_name_size || value.len() > limits.header_value_size {
            return Err(ErrorKind::InvalidHeader);
        }

        if name.eq_ignore_ascii_case(b"content-length") {
            self.parse_content_length(value, request)?;
        } else if name.eq_ignore_ascii_case(b"connection") {
            self.parse_connection(value)?;
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") && value.eq_ignore_ascii_case(b"chunked") {
            self.chunked = true;
        }

        request.headers.headers.push(Header::new(name, value));
        Ok(())
    }

    fn parse_content_length(&mut self, value: &[u8], request: &mut Request) -> Result<(), ErrorKind> {
        let len = crate::http::types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
        self.content_length = Some(len);
        request.headers.content_length = Some(len);
        Ok(())
    }

    fn parse_connection(&mut self, value: &[u8]) -> Result<(), ErrorKind> {
        if value.eq_ignore_ascii_case(b"keep-alive") {
            self.keep_alive = true;
        } else if value.eq_ignore_ascii_case(b"close") {
            self.keep_alive = false;
        } else {
            return Err(ErrorKind::InvalidConnection);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    fn parse_all(raw: &[u8], limits: &ReqLimits) -> (Parser, Request) {
        let mut parser = Parser::from(limits, raw);
        let mut request = Request::new(limits);
        loop {
            match parser.feed(&mut request, limits).unwrap() {
                FeedOutcome::HeadersComplete { .. } => {
                    parser.resume_parsing();
                    parser.feed(&mut request, limits).unwrap();
                }
                FeedOutcome::MessageComplete { .. } => break,
                FeedOutcome::NeedMore => break,
            }
        }
        (parser, request)
    }

    #[test]
    fn parses_simple_get() {
        let limits = ReqLimits::default().precalculate();
        let (_, request) = parse_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n", &limits);
        assert_eq!(request.method(), Method::Get);
        assert_eq!(str_op(request.url().path()), "/hello");
        assert_eq!(str(request.header(b"host")), Some("x"));
    }

    #[test]
    fn parses_query_string() {
        let limits = ReqLimits::default().precalculate();
        let (_, request) = parse_all(b"GET /users/42?name=Ann HTTP/1.1\r\n\r\n", &limits);
        assert_eq!(str_2((request.url().path_segment(0).unwrap(), b"")).0, "users");
        assert_eq!(str(request.url().query(b"name")), Some("Ann"));
    }

    #[test]
    fn rejects_bad_method() {
        let limits = ReqLimits::default().precalculate();
        let mut parser = Parser::from(&limits, b"TRACE / HTTP/1.1\r\n\r\n");
        let mut request = Request::new(&limits);
        let err = parser.feed(&mut request, &limits).unwrap_err();
        assert_eq!(err, ErrorKind::InvalidMethod);
    }

    #[test]
    fn content_length_body_is_complete_when_fully_delivered() {
        let limits = ReqLimits::default().precalculate();
        let raw: &[u8] = b"POST /x HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
        let mut parser = Parser::from(&limits, raw);
        let mut request = Request::new(&limits);
        loop {
            match parser.feed(&mut request, &limits).unwrap() {
                FeedOutcome::HeadersComplete { .. } => parser.resume_parsing(),
                FeedOutcome::MessageComplete { .. } | FeedOutcome::NeedMore => break,
            }
        }
        assert!(!parser.is_body_complete());
        let mut dest = [0u8; 5];
        let n = parser.prepare_body_read(&mut dest, 4096).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&dest, b"hello");
        assert!(parser.is_body_complete());
    }

    #[test]
    fn chunked_body_reassembles_across_chunks() {
        let limits = ReqLimits::default().precalculate();
        let raw: &[u8] =
            b"POST /x HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n6\r\nHello \r\n5\r\nfrom \r\nd\r\nchunked test!\r\n0\r\n\r\n";
        let mut parser = Parser::from(&limits, raw);
        let mut request = Request::new(&limits);
        loop {
            match parser.feed(&mut request, &limits).unwrap() {
                FeedOutcome::HeadersComplete { .. } => parser.resume_parsing(),
                FeedOutcome::MessageComplete { .. } | FeedOutcome::NeedMore => break,
            }
        }
        let mut out = Vec::new();
        let mut dest = [0u8; 64];
        loop {
            let n = parser.prepare_body_read(&mut dest, 4096).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&dest[..n]);
        }
        assert_eq!(str_op(&out), "Hello from chunked test!");
        assert!(parser.is_body_complete());
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let limits = ReqLimits::default().precalculate();
        let (parser, _) = parse_all(b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n", &limits);
        assert!(!parser.should_keep_alive());
    }

    #[test]
    fn has_trailing_bytes_detects_pipelining() {
        let limits = ReqLimits::default().precalculate();
        let (parser, _) = parse_all(b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n", &limits);
        assert!(parser.has_trailing_bytes());
    }
}

//! Client-side response codec: status line, headers, and body, driven off an
//! owned growable buffer rather than the server codec's fixed arena-backed
//! one (a pooled connection's buffer is reused across many responses, not
//! reset per-request the way the server's per-connection arena is). Line and
//! header scanning and the chunked-transfer state machine are shared with
//! the server's request codec via [`crate::http::scan`].

use crate::{
    errors::{ClientErrorKind, ErrorKind},
    http::{
        scan::{find_line, split_header, ChunkState},
        types::{slice_to_u64_hex, slice_to_usize, Version},
    },
    limits::ClientLimits,
};
use flate2::read::{GzDecoder, ZlibDecoder};
use memchr::memchr;
use std::io::{self, Read};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A parsed response head. Header names/values are owned copies (unlike the
/// server's arena-borrowed [`crate::http::types::Header`]) since the
/// underlying read buffer is reused for the next response on this
/// connection, not retained for the caller's lifetime.
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: u16,
    pub(crate) headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) keep_alive: bool,
}

impl ResponseHead {
    pub(crate) fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_slice())
    }
}

/// Reads more bytes off `stream` into the tail of `buf`. Returns `false` on
/// EOF.
async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>, limits: &ClientLimits) -> Result<bool, ClientErrorKind> {
    let start = buf.len();
    buf.resize(start + limits.read_buffer_size, 0);
    let n = match tokio::time::timeout(limits.io_timeout, stream.read(&mut buf[start..])).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            buf.truncate(start);
            return Err(e.into());
        }
        Err(_) => {
            buf.truncate(start);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout").into());
        }
    };
    buf.truncate(start + n);
    Ok(n > 0)
}

fn parse_status_line(line: &[u8]) -> Result<(Version, u16), ClientErrorKind> {
    let sp = memchr(b' ', line).ok_or(ErrorKind::InvalidStatusLine)?;
    let (version_part, rest) = line.split_at(sp);
    let rest = &rest[1..];
    let (version, _) = Version::from_bytes(version_part)?;
    let end = memchr(b' ', rest).unwrap_or(rest.len());
    let status = slice_to_usize(&rest[..end]).ok_or(ErrorKind::InvalidStatusLine)?;
    if status > u16::MAX as usize {
        return Err(ErrorKind::InvalidStatusLine.into());
    }
    Ok((version, status as u16))
}

/// Reads the status line and headers, growing `buf` off `stream` as needed.
/// Returns the head plus the offset in `buf` where the body begins.
pub(crate) async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    limits: &ClientLimits,
) -> Result<(ResponseHead, usize), ClientErrorKind> {
    let mut scan = 0usize;

    let (version, status) = loop {
        match find_line(buf, scan) {
            Some((line, next)) => {
                let parsed = parse_status_line(line)?;
                scan = next;
                break parsed;
            }
            None => {
                if !fill(stream, buf, limits).await? {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed before status line").into());
                }
            }
        }
    };

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut keep_alive = version == Version::Http11;

    loop {
        match find_line(buf, scan) {
            Some((line, next)) => {
                scan = next;
                if line.is_empty() {
                    break;
                }
                let (name, value) = split_header(line).ok_or(ErrorKind::InvalidHeader)?;
                if name.eq_ignore_ascii_case(b"content-length") {
                    content_length = Some(slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?);
                } else if name.eq_ignore_ascii_case(b"transfer-encoding") && value.eq_ignore_ascii_case(b"chunked") {
                    chunked = true;
                } else if name.eq_ignore_ascii_case(b"connection") {
                    keep_alive = value.eq_ignore_ascii_case(b"keep-alive")
                        || (version == Version::Http11 && !value.eq_ignore_ascii_case(b"close"));
                }
                headers.push((name.to_vec(), value.to_vec()));
            }
            None => {
                if !fill(stream, buf, limits).await? {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-headers").into());
                }
            }
        }
    }

    Ok((
        ResponseHead {
            version,
            status,
            headers,
            content_length,
            chunked,
            keep_alive,
        },
        scan,
    ))
}

/// Unwraps a chunked body from `buf[scan..]`, reading more off `stream` as
/// needed, bounded by `limits.max_response_size`.
async fn read_body_chunked<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    mut scan: usize,
    limits: &ClientLimits,
) -> Result<Vec<u8>, ClientErrorKind> {
    let mut state = ChunkState::Start;
    let mut out = Vec::new();

    loop {
        match state {
            ChunkState::Start => match find_line(buf, scan) {
                Some((line, next)) => {
                    let size_part = match memchr(b';', line) {
                        Some(i) => &line[..i],
                        None => line,
                    };
                    let size = slice_to_u64_hex(size_part).ok_or(ErrorKind::InvalidChunkSize)? as usize;
                    scan = next;
                    if size == 0 {
                        state = ChunkState::Trailer;
                    } else {
                        if out.len() + size > limits.max_response_size {
                            return Err(ClientErrorKind::ResponseTooLarge);
                        }
                        state = ChunkState::Data(size);
                    }
                }
                None => {
                    if !fill(stream, buf, limits).await? {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-chunk").into());
                    }
                }
            },
            ChunkState::Data(remaining) => {
                let avail = buf.len() - scan;
                if avail == 0 {
                    if !fill(stream, buf, limits).await? {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-chunk").into());
                    }
                    continue;
                }
                let take = remaining.min(avail);
                out.extend_from_slice(&buf[scan..scan + take]);
                scan += take;
                state = if take == remaining { ChunkState::End } else { ChunkState::Data(remaining - take) };
            }
            ChunkState::End => match find_line(buf, scan) {
                Some((line, next)) => {
                    if !line.is_empty() {
                        return Err(ErrorKind::InvalidChunkTrailer.into());
                    }
                    scan = next;
                    state = ChunkState::Start;
                }
                None => {
                    if !fill(stream, buf, limits).await? {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-chunk").into());
                    }
                }
            },
            ChunkState::Trailer => match find_line(buf, scan) {
                Some((line, next)) => {
                    scan = next;
                    if line.is_empty() {
                        state = ChunkState::Done;
                    }
                }
                None => {
                    if !fill(stream, buf, limits).await? {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-chunk").into());
                    }
                }
            },
            ChunkState::Done => break,
        }
    }

    Ok(out)
}

/// Reads the response body per `head`'s framing. `has_body` is `false` for
/// `HEAD` responses and bodyless status codes (1xx, 204, 304).
pub(crate) async fn read_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    scan: usize,
    head: &ResponseHead,
    limits: &ClientLimits,
    has_body: bool,
) -> Result<Vec<u8>, ClientErrorKind> {
    if !has_body {
        return Ok(Vec::new());
    }

    if head.chunked {
        return read_body_chunked(stream, buf, scan, limits).await;
    }

    if let Some(len) = head.content_length {
        if len > limits.max_response_size {
            return Err(ClientErrorKind::ResponseTooLarge);
        }
        while buf.len() - scan < len {
            if !fill(stream, buf, limits).await? {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-body").into());
            }
        }
        return Ok(buf[scan..scan + len].to_vec());
    }

    // No declared length and not chunked: body runs to connection close.
    loop {
        if buf.len() - scan > limits.max_response_size {
            return Err(ClientErrorKind::ResponseTooLarge);
        }
        if !fill(stream, buf, limits).await? {
            break;
        }
    }
    Ok(buf[scan..].to_vec())
}

/// Decompresses `raw` per `content_encoding` (`gzip`, `deflate`/zlib, or
/// `identity`); anything else is `UnsupportedContentEncoding`. Bounded by
/// `max_size` to cap a maliciously high compression ratio.
pub(crate) fn decompress(content_encoding: Option<&[u8]>, raw: Vec<u8>, max_size: usize) -> Result<Vec<u8>, ClientErrorKind> {
    let Some(encoding) = content_encoding else {
        return Ok(raw);
    };
    if encoding.eq_ignore_ascii_case(b"identity") {
        return Ok(raw);
    }

    let mut reader: Box<dyn Read> = if encoding.eq_ignore_ascii_case(b"gzip") {
        Box::new(GzDecoder::new(&raw[..]))
    } else if encoding.eq_ignore_ascii_case(b"deflate") {
        // Treated as zlib-wrapped deflate, matching what most servers
        // actually send for this encoding despite the bare-deflate reading
        // of the name.
        Box::new(ZlibDecoder::new(&raw[..]))
    } else {
        return Err(ClientErrorKind::UnsupportedContentEncoding(String::from_utf8_lossy(encoding).into_owned()));
    };

    let mut out = Vec::with_capacity(raw.len());
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
        if out.len() > max_size {
            return Err(ClientErrorKind::ResponseTooLarge);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ClientLimits {
        ClientLimits::default()
    }

    #[tokio::test]
    async fn reads_simple_response_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut stream = std::io::Cursor::new(raw);
        let mut buf = Vec::new();
        let (head, scan) = read_head(&mut stream, &mut buf, &limits()).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(5));
        let body = read_body(&mut stream, &mut buf, scan, &head, &limits(), true).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_response_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n".to_vec();
        let mut stream = std::io::Cursor::new(raw);
        let mut buf = Vec::new();
        let (head, scan) = read_head(&mut stream, &mut buf, &limits()).await.unwrap();
        assert!(head.chunked);
        let body = read_body(&mut stream, &mut buf, scan, &head, &limits(), true).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn decompress_identity_passes_through() {
        let out = decompress(Some(b"identity"), b"raw".to_vec(), 1024).unwrap();
        assert_eq!(out, b"raw");
    }

    #[test]
    fn decompress_rejects_unsupported_encoding() {
        let err = decompress(Some(b"br"), b"raw".to_vec(), 1024).unwrap_err();
        assert!(matches!(err, ClientErrorKind::UnsupportedContentEncoding(e) if e == "br"));
    }

    #[test]
    fn decompress_gzip_roundtrip() {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello").unwrap();
        let gzipped = encoder.finish().unwrap();

        let out = decompress(Some(b"gzip"), gzipped, 1024).unwrap();
        assert_eq!(out, b"hello");
    }
}

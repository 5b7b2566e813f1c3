//! Low-level byte scanning shared by the request codec (`http::request`) and
//! the client's response codec (`client::codec`). Both sides pause on the
//! same two events (headers complete, message complete) and share the same
//! chunked-transfer state machine, so the line/header splitting and the
//! chunk-size parsing live here once instead of twice.

use memchr::memchr;

/// Finds the end of the next CRLF- or LF-terminated line starting at
/// `buf[from..]`. Returns `(line, next_offset)` where `line` excludes the
/// terminator and `next_offset` is the absolute offset just past it.
#[inline]
pub(crate) fn find_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[from..];
    let nl = memchr(b'\n', rest)?;
    let line = if nl > 0 && rest[nl - 1] == b'\r' {
        &rest[..nl - 1]
    } else {
        &rest[..nl]
    };
    Some((line, from + nl + 1))
}

/// Splits a header line on the first `:` and trims leading spaces/tabs from
/// the value (RFC 7230 OWS). Returns `None` for a malformed line.
#[inline]
pub(crate) fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = memchr(b':', line)?;
    let name = &line[..colon];
    if name.is_empty() {
        return None;
    }
    let mut value = &line[colon + 1..];
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    Some((name, value))
}

/// Nested state machine for `Transfer-Encoding: chunked` bodies, grounded on
/// the `Start -> Data(n) -> End -> Trailer -> Done` shape used by `dacha`'s
/// chunked body reader, reimplemented with `memchr` to match this crate's
/// buffer-slicing idiom instead of a parser-combinator style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Start,
    Data(usize),
    End,
    Trailer,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_line_crlf() {
        let (line, next) = find_line(b"GET / HTTP/1.1\r\nHost: x\r\n", 0).unwrap();
        assert_eq!(line, b"GET / HTTP/1.1");
        assert_eq!(next, 16);
    }

    #[test]
    fn find_line_lf_only() {
        let (line, next) = find_line(b"a: b\nc: d\n", 0).unwrap();
        assert_eq!(line, b"a: b");
        assert_eq!(next, 5);
    }

    #[test]
    fn find_line_incomplete() {
        assert_eq!(find_line(b"no newline here", 0), None);
    }

    #[test]
    fn split_header_basic() {
        assert_eq!(split_header(b"Content-Type:  text/plain  "), Some((&b"Content-Type"[..], &b"text/plain"[..])));
    }

    #[test]
    fn split_header_no_colon() {
        assert_eq!(split_header(b"garbage"), None);
    }

    #[test]
    fn split_header_empty_name() {
        assert_eq!(split_header(b": value"), None);
    }
}

use crate::{http::query, Version};
use std::{error, fmt, io};

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    #[allow(dead_code)]
    Query(query::Error),

    InvalidVersion,
    UnsupportedVersion,
    /// Malformed response status line; only produced by the client's
    /// response codec (the server never parses a status line).
    InvalidStatusLine,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    InvalidConnection,

    InvalidChunkSize,
    ChunkTooLarge,
    InvalidChunkTrailer,

    BodyTooLarge,
    #[allow(dead_code)]
    BodyMismatch {
        expected: usize,
        available: usize,
    },
    #[allow(dead_code)]
    UnexpectedBody(usize),

    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;

        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        Query: "400 Bad Request", "55"
            => r#"{"error":"Invalid query string","code":"INVALID_QUERY"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
        InvalidStatusLine: "400 Bad Request", "58"
            => r#"{"error":"Invalid response status line","code":"INVALID_STATUS_LINE"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidConnection: "400 Bad Request", "65"
            => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;

        InvalidChunkSize: "400 Bad Request", "60"
            => r#"{"error":"Invalid chunk size line","code":"INVALID_CHUNK_SIZE"}"#;
        ChunkTooLarge: "413 Payload Too Large", "55"
            => r#"{"error":"Chunk exceeds body limit","code":"CHUNK_TOO_LARGE"}"#;
        InvalidChunkTrailer: "400 Bad Request", "58"
            => r#"{"error":"Invalid chunk trailer","code":"INVALID_CHUNK_TRAILER"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        BodyMismatch: "400 Bad Request", "55"
            => r#"{"error":"Body length mismatch","code":"BODY_MISMATCH"}"#;
        UnexpectedBody: "400 Bad Request", "60"
            => r#"{"error":"Unexpected request body","code":"UNEXPECTED_BODY"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Errors surfaced by [`crate::client::Client`].
#[derive(Debug)]
pub enum ClientErrorKind {
    /// The request URL could not be parsed.
    InvalidUrl(url::ParseError),
    /// The URL scheme is neither `http` nor `https`.
    UnsupportedScheme,
    /// An `https://` request was made but the client was built without TLS.
    TlsNotConfigured,
    /// No CA certificates could be loaded for TLS verification.
    MissingCaBundle,
    /// `rustls` failed to build a client configuration.
    TlsInitializationFailed(String),
    /// The response body exceeded the configured maximum size.
    ResponseTooLarge,
    /// `Content-Encoding` named a coding this client cannot decompress.
    UnsupportedContentEncoding(String),
    /// A redirect response carried a `Location` header that could not be
    /// resolved into a URL. A *missing* `Location`, or exhausting
    /// `max_redirects`, is not an error: the 3xx response is returned as-is.
    InvalidRedirectLocation,
    /// Underlying connection or protocol error.
    Io(IoError),
    /// The peer sent an HTTP message this client could not parse.
    Protocol(ErrorKind),
    /// A WebSocket upgrade or frame error on a client-initiated connection.
    WebSocket(WebSocketErrorKind),
}

impl error::Error for ClientErrorKind {}
impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ClientErrorKind {
    fn from(err: io::Error) -> Self {
        ClientErrorKind::Io(IoError(err))
    }
}

impl From<url::ParseError> for ClientErrorKind {
    fn from(err: url::ParseError) -> Self {
        ClientErrorKind::InvalidUrl(err)
    }
}

impl From<ErrorKind> for ClientErrorKind {
    fn from(err: ErrorKind) -> Self {
        ClientErrorKind::Protocol(err)
    }
}

impl From<WebSocketErrorKind> for ClientErrorKind {
    fn from(err: WebSocketErrorKind) -> Self {
        ClientErrorKind::WebSocket(err)
    }
}

/// Errors surfaced by the WebSocket frame codec and handshake.
#[derive(Debug, PartialEq)]
pub enum WebSocketErrorKind {
    /// A reserved (RSV1/2/3) bit was set without an agreed extension.
    ReservedFlags,
    /// A control frame (close/ping/pong) exceeded 125 bytes or was fragmented.
    LargeControlFrame,
    /// The opcode was not one of the frame types defined by RFC 6455.
    InvalidOpcode,
    /// A continuation frame arrived with no fragmented message in progress.
    UnexpectedContinuation,
    /// A new data frame arrived while a fragmented message was still open.
    NestedFragment,
    /// A text frame or reassembled text message was not valid UTF-8.
    InvalidUtf8,
    /// The reassembled message exceeded the configured size limit.
    MessageTooLarge,
    /// The peer's opening handshake response was missing or malformed.
    InvalidHandshake,
    /// Underlying I/O error on the upgraded connection.
    Io(IoError),
}

impl error::Error for WebSocketErrorKind {}
impl fmt::Display for WebSocketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for WebSocketErrorKind {
    fn from(err: io::Error) -> Self {
        WebSocketErrorKind::Io(IoError(err))
    }
}

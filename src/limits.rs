//! Web server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows  
//! - Slowloris attacks
//! - Header flooding
//!
//! # Memory Consumption
//!
//! Each active connection consumes memory according to:
//!
//! `Total` = [`Request Buffer`](crate::limits::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits#buffer-management) +
//!           `Runtime Overhead`
//!
//! See each component's documentation for details and configuration options.
//!
//! # Examples
//!
//! ```no_run
//! # wayfarer::impt_default_handler!{MyHandler}
//! use wayfarer::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 18,      // More headers for complex APIs
//!             body_size: 16 * 1024,  // 16KB for larger payloads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, admission, and overload protection.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------------------\   No   [-------------]
/// [ Spawn task  ] <====== | Below max_connections limit? | =====> [ Sending 503 ]
/// [--------------]         \----------------------------/        [-------------]
/// ```
///
/// Every accepted connection that is admitted gets its own task
/// ([tokio::spawn]) for its whole lifetime; `active_connections` tracks how
/// many such tasks are currently running. When the count is already at
/// `max_connections`, the accept loop hands the new socket to one of the
/// `count_503_handlers` overflow tasks instead of spawning a connection task,
/// and that overflow task waits using `wait_strategy` when its queue is
/// momentarily empty.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent active connections being processed (default: `100`).
    pub max_connections: usize,

    /// Maximum number of TCP connections waiting in the overflow admission queue (default: `250`).
    ///
    /// Connections rejected because `max_connections` is already reached go
    /// here to wait for a [503](crate::StatusCode::ServiceUnavailable). If
    /// this queue is itself full, the socket is dropped without a response.
    pub max_pending_connections: usize,

    /// Strategy for overflow-handler waiting behavior (default: `Sleep(50µs)`)
    ///
    /// Controls how the 503-overflow tasks wait when their queue is empty.
    /// Affects latency, CPU usage, and throughput characteristics.
    pub wait_strategy: WaitStrategy,

    /// Dedicated tasks for queue overflow responses (default: `1`).
    ///
    /// When the connection queue becomes full, these tasks immediately send
    /// responses with the [503](crate::StatusCode::ServiceUnavailable) code. Using
    /// multiple handlers prevents bottlenecks in scenarios with a large volume of
    /// rejected requests. Set to 0 to silently close the connection (not recommended
    /// for production HTTP servers).
    pub count_503_handlers: usize,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
///
/// Different strategies optimize for different workload patterns.
/// Choose based on your latency requirements and resource constraints.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// # Note
    /// According to personal measurements, when using this option, the CPU load
    /// is 97-99%, so I do not recommend using it.
    ///
    /// Server operation with this waiting strategy:
    /// ```
    /// # #[tokio::main]
    /// async fn main() {
    /// # let mut pool = vec![1, 2, 3];
    /// #
    /// let value = loop {
    ///     if let Some(value) = pool.pop() {
    ///         break value;
    ///     }
    ///
    ///     tokio::task::yield_now().await;
    /// };
    /// # }
    /// ```
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    ///
    /// Server operation with this waiting strategy:
    /// ```
    /// # #[tokio::main]
    /// async fn main() {
    /// # let mut pool = vec![1, 2, 3];
    /// # let time = std::time::Duration::from_micros(50);
    /// #
    /// let value = loop {
    ///     if let Some(value) = pool.pop() {
    ///         break value;
    ///     }
    ///
    ///     tokio::time::sleep(time).await;
    /// };
    /// # }
    /// ```
    Sleep(Duration),
}

/// Connection-level limits and timeouts
///
/// Controls individual TCP connection behavior including timeouts,
/// lifetime, and request limits.
///
/// Default values balance performance, resource usage, and security.
/// Only change if you understand the consequences.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for reading data from socket (default: `2 seconds`)
    ///
    /// If no data is received within this time, connection is closed.
    /// This is the primary mechanism for cleaning up stalled connections.
    /// Prevents `slowloris attacks` and frees resources from inactive clients.
    pub socket_read_timeout: Duration,

    /// Maximum duration to wait for writing data to socket (default: `3 seconds`)
    ///
    /// If data can't be written in time, connection is terminated.
    /// Applies to individual write operations.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    ///
    /// Connection closes after processing this many requests.
    /// Helps prevent potential memory accumulation and maintains connection health.
    /// Combined with `connection_lifetime`, ensures connections don't live indefinitely.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// Final safety net that guarantees no connection lives longer than this duration.
    /// In practice, connections are typically cleaned up by `socket_read_timeout`
    /// or `max_requests_per_connection` long before this limit is reached.
    ///
    /// This also protects against business logic that takes very long time to execute
    /// (e.g., query parsing: 0.05s + business logic: 5s = connection could last 16 minutes
    /// excluding I/O operations without this limit).
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,

            _priv: (),
        }
    }
}

/// HTTP request parsing limits and buffer pre-allocation strategy
///
/// âš ï¸ **SECURITY-FIRST DEFAULTS**
///
/// These limits are intentionally conservative to prevent resource exhaustion
/// and various parsing attacks. They work well for:
/// - Simple REST APIs
/// - Microservices
/// - Internal tools
/// - Low-memory environments
///
/// ðŸ”§ **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate requests  
/// - `414 URI Too Long` for normal API calls
/// - `431 Request Header Fields Too Large`
///
/// # Memory Allocation Strategy
///
/// Each TCP connection pre-allocates a fixed-size buffer based on these limits:
///
/// ```text
/// Total Buffer = First Line + (Headers Ã— Header Line) + Body + Overhead
/// ```
///
/// ## Buffer Size Calculation (Default Values)
///
/// | Component | Formula | Size | Purpose |
/// |-----------|---------|------|---------|
/// | First Line | `19 + url_size` | 275 B | `METHOD URL HTTP/1.1\r\n` |
/// | Headers | `header_count Ã— Header Line` | 18,560 B | Headers storage |
/// | Header Line | `header_name_size + header_value_size + 4` | 580 B | `Name: Value\r\n` |
/// | Body | `body_size` | 1,048,576 B | Request payload |
/// | **Total** | **Sum + 2 bytes CRLF + struct (64 B)** | **1,067,477 B = ~1 MiB** | Per connection buffer |
///
/// # Memory Planning
///
/// # Example
/// ```
/// use wayfarer::limits::ReqLimits;
///
/// let mut limits = ReqLimits::default();
/// let buffer_size = limits.estimated_buffer_size();
/// println!("Each connection needs {} bytes for data buffer", buffer_size);
/// ```
///
/// # Trade-off Considerations
///
/// - **Small limits**: Less memory, faster parsing, but may reject legitimate requests
/// - **Large limits**: More memory overhead, but handles complex APIs and large payloads
///
/// Adjust based on your specific use case and available resources.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum URL length in bytes including path and query string (default: `256 B`)
    ///
    /// Covers the entire URL after the method (e.g., `/api/users/123?sort=name&debug`).
    /// Most REST APIs fit within 256 bytes. Increase if you have long query parameters
    /// or deeply nested paths.
    pub url_size: usize,
    /// Maximum number of path segments in URL (default: `8 segments`)
    ///
    /// Counts slashes in path (e.g., `/api/users/123` has 3 segments).
    /// Sufficient for most REST APIs. Increase for very deep nesting.
    pub url_parts: usize,
    /// Maximum query string length (default: `128`)
    ///
    /// Covers the entire query request, including `?` (e.g., `?sort=name&debug`).
    /// If you don't need this limit, set it to [url_size](Self::url_size).
    pub url_query_size: usize,
    /// Maximum number of query parameters (default: `32`)
    ///
    /// Limits the URL query string to N `key=value` pairs separated by `&` when N > 1
    /// (e.g., `?sort=name&debug` has 2 pairs, `?sort=name&debug=true&page=1` has 3 pairs).
    /// Prevents query parameter explosion attacks.
    /// Increase for complex filtering APIs with many parameters.
    pub url_query_parts: usize,

    /// Maximum number of headers per request (default: `32 headers`)
    ///
    /// Typical browsers send 10-12 headers. 32 provides room for custom headers
    /// while preventing header flooding attacks.
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`)
    ///
    /// Standard header names are short (`content-type`, `authorization`).
    /// 64 bytes accommodates custom headers like `x-custom-header-name`.
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `512 B`)
    ///
    /// Fits most headers including JWT tokens, cookies, and UUIDs.
    /// Increase for large cookies or complex authentication tokens.
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `1 MiB`)
    ///
    /// Suitable for API requests with JSON payloads. Increase for file uploads
    /// or large data submissions. Set based on your expected payload sizes.
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            // Security-conscious defaults
            url_size: 256,       // Enough for: /api/v1/users/search?q=test&page=1
            url_parts: 8,        // /api/users/123
            url_query_size: 128, // Enough for: ?sort=name&debug
            url_query_parts: 32, // ?sort=name&debug&...

            header_count: 32,       // Typical: 10-12 browser headers + custom
            header_name_size: 64,   // Fits: x-custom-auth-token-header-name
            header_value_size: 512, // Fits most JWT tokens and cookies

            body_size: 1024 * 1024, // Good for JSON API requests, not file uploads

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the estimated memory buffer size required per connection.
    /// Identical to [std::mem::size_of_val]
    ///
    /// This calculates the total buffer size needed to parse HTTP requests
    /// based on the current limits. The buffer includes space for:
    /// - HTTP request line
    /// - Headers (name + value for each header)  
    /// - Request body
    /// - CRLF terminators
    ///
    /// # Note
    /// The returned size represents only the data buffer. Additional memory
    /// is used for the parser structure itself (~64 bytes).
    ///
    /// # Example
    /// ```
    /// use wayfarer::limits::ReqLimits;
    ///
    /// let mut limits = ReqLimits::default();
    /// let buffer_size = limits.estimated_buffer_size();
    /// println!("Each connection needs {} bytes for data buffer", buffer_size);
    /// ```
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();
        self.precalc.req_without_body = self.precalc.buffer - self.body_size;

        self
    }

    #[inline(always)]
    // First line + Header * N + "\r\n" + Body
    fn buffer(&self) -> usize {
        self.precalc.first_line + self.header_count * self.precalc.h_line + 2 + self.body_size
    }

    #[inline(always)]
    // First line HTTP response:
    // CONNECT /url/test HTTP/1.1\r\n
    // |-----| |-------| |------|
    //  Method    URl    Version
    //
    // Formula: Method(7) + " " + URl + " " + Version(8) + "\r\n"
    // In Code: 19 + url_size
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Header:
    // Authorization: Sample%20Data\r\n
    // |-----------|  |-----------|
    //     Name           Value
    //
    // Formula: Name + ": " + Value +  "\r\n"
    // In Code: 4 + header_name_size + header_value_size
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) req_without_body: usize,
    pub(crate) h_line: usize,
}

/// Configuration for response processing and memory allocation limits.
///
/// Controls how response buffers are allocated and managed to balance
/// memory usage and performance.
///
/// # Buffer Management
///
/// Based on the configured limits, response buffers are managed as follows:
/// ```rust
/// # use wayfarer::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<()> = Vec::with_capacity(limits.default_capacity);
/// #
/// // `buffer` is Vec
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
///
/// When the server starts, buffers are created with a capacity equal to `default_capacity`.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`)
    pub default_capacity: usize,
    /// Maximum allowed buffer capacity for responses (default: `8192 B`)
    //
    // Note: If the response exceeds `max_capacity * 2`, it may be sent in 1 or more `syscall`
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}

/// Client-side connection, pooling, and redirect behavior limits.
#[derive(Debug, Clone)]
pub struct ClientLimits {
    /// Maximum number of idle pooled connections per `(host, port, is_tls)` key (default: `32`).
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection may sit before it is dropped (default: `90 seconds`).
    pub pool_idle_timeout: Duration,
    /// Timeout for establishing the TCP (and TLS, if applicable) connection (default: `10 seconds`).
    pub connect_timeout: Duration,
    /// Timeout for a single read or write on an established connection (default: `30 seconds`).
    pub io_timeout: Duration,
    /// Maximum number of redirects to follow before giving up (default: `10`).
    pub max_redirects: usize,
    /// Maximum response body size accepted, post-decompression (default: `10 MiB`).
    pub max_response_size: usize,
    /// Size of each pooled connection's read buffer (default: `4096 B`).
    ///
    /// Sized the same way as [`ReqLimits`]'s buffer: large enough for a
    /// typical status line and header block without reallocating, grown by
    /// nothing further — a response whose head exceeds this is a parse error.
    pub read_buffer_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ClientLimits {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            max_redirects: 10,
            max_response_size: 10 * 1024 * 1024,
            read_buffer_size: 4096,

            _priv: (),
        }
    }
}

/// WebSocket frame and message limits, shared by server-accepted and
/// client-initiated connections.
#[derive(Debug, Clone)]
pub struct WebSocketLimits {
    /// Maximum size of a single frame payload in bytes (default: `16 MiB`).
    pub max_frame_size: usize,
    /// Maximum size of a reassembled message across fragments (default: `16 MiB`).
    pub max_message_size: usize,
    /// Interval between automatic pings sent while the connection is idle (default: `30 seconds`).
    pub ping_interval: Duration,
    /// How long to wait for a pong before treating the peer as unresponsive (default: `10 seconds`).
    pub pong_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),

            _priv: (),
        }
    }
}

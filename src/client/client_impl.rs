//! Client entry points: [`Client`], [`ClientBuilder`], [`ClientResponse`],
//! and [`FetchOptions`]. Grounded on `cpkb-bluezoo-tagliacarte`'s
//! `HttpConnection`/`HttpStream` split (dial-or-reuse, then write request,
//! then read response) and on this crate's own server-side `Server`/
//! `ServerBuilder` pair for the builder shape.

use crate::{
    client::{
        codec,
        pool::{IdleConnection, Pool},
        stream::{Prefixed, Stream},
        url::RequestUrl,
    },
    errors::ClientErrorKind,
    http::types::{slice_to_usize, Method, StatusCode, Version},
    limits::{ClientLimits, WebSocketLimits},
    websocket::{accept_key, Role, WebSocket},
};
use base64::Engine;
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::io::AsyncWriteExt;

/// A fully-buffered HTTP response: status line, headers, and decompressed
/// body, all owned independently of the connection that produced them.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    version: Version,
    status: u16,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body: Vec<u8>,
}

impl ClientResponse {
    /// The numeric status code (e.g. `200`).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The named status code, if this number is one of the standard ones.
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status)
    }

    /// The response's HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Looks up a header by case-insensitive name. Returns `None` if the
    /// value is not valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Iterates all headers as `(name, value)` pairs, skipping any whose
    /// bytes are not valid UTF-8.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().filter_map(|(n, v)| Some((std::str::from_utf8(n).ok()?, std::str::from_utf8(v).ok()?)))
    }

    /// The raw, decompressed response body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body decoded as UTF-8.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

/// Per-request overrides for [`Client::fetch`]. [`Client::get`] and
/// [`Client::post`] cover the common cases without building one of these.
#[derive(Debug, Clone)]
pub struct FetchOptions<'a> {
    pub method: Method,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: Option<&'a [u8]>,
    /// Overrides [`ClientLimits::max_redirects`] for this request only.
    pub max_redirects: Option<usize>,
    /// Whether to decompress a `Content-Encoding`'d response (default `true`).
    pub decompress: bool,
}

impl Default for FetchOptions<'_> {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: Vec::new(),
            body: None,
            max_redirects: None,
            decompress: true,
        }
    }
}

/// Builds a [`Client`] with non-default limits.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    limits: ClientLimits,
    ws_limits: WebSocketLimits,
    tls_enabled: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            limits: ClientLimits::default(),
            ws_limits: WebSocketLimits::default(),
            tls_enabled: true,
        }
    }
}

impl ClientBuilder {
    pub fn limits(mut self, limits: ClientLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn websocket_limits(mut self, limits: WebSocketLimits) -> Self {
        self.ws_limits = limits;
        self
    }

    /// Enables or disables `https://` support (enabled by default). With
    /// this `false`, an `https://` request fails with
    /// [`ClientErrorKind::TlsNotConfigured`] instead of dialing TLS.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn build(self) -> Client {
        Client {
            pool: Mutex::new(Pool::new(self.limits.pool_max_idle_per_host)),
            limits: self.limits,
            ws_limits: self.ws_limits,
            tls_enabled: self.tls_enabled,
        }
    }
}

/// An HTTP/1.1 client with connection pooling, redirect following, and
/// optional response decompression.
///
/// Cheap to clone-by-reference (wrap in an `Arc` to share across tasks); the
/// pool is internally synchronized.
pub struct Client {
    pool: Mutex<Pool>,
    limits: ClientLimits,
    ws_limits: WebSocketLimits,
    tls_enabled: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Sends a `GET` request and follows redirects.
    pub async fn get(&self, url: &str) -> Result<ClientResponse, ClientErrorKind> {
        self.fetch(url, FetchOptions::default()).await
    }

    /// Sends a `POST` request with `body` and follows redirects.
    pub async fn post(&self, url: &str, body: &[u8]) -> Result<ClientResponse, ClientErrorKind> {
        self.fetch(url, FetchOptions { method: Method::Post, body: Some(body), ..Default::default() }).await
    }

    /// Sends a request per `options`, following redirects up to
    /// `options.max_redirects` (or [`ClientLimits::max_redirects`]).
    pub async fn fetch(&self, url: &str, options: FetchOptions<'_>) -> Result<ClientResponse, ClientErrorKind> {
        let max_redirects = options.max_redirects.unwrap_or(self.limits.max_redirects);
        let mut target = RequestUrl::parse(url)?;
        let mut method = options.method;
        let mut body = options.body;
        let mut redirects = 0usize;

        loop {
            let (head, raw_body) = self.send_once(&target, method, body, &options.headers, options.decompress).await?;
            let response = ClientResponse { version: head.version, status: head.status, headers: head.headers, body: raw_body };

            if !matches!(response.status, 301 | 302 | 303 | 307 | 308) {
                return Ok(response);
            }
            // A redirect with no `Location`, or one beyond `max_redirects`,
            // is not an error: the 3xx response is returned as-is.
            let Some(location) = response.header("location") else {
                return Ok(response);
            };
            if redirects >= max_redirects {
                return Ok(response);
            }
            target = target.resolve(location.as_bytes())?;
            if response.status == 303 {
                method = Method::Get;
                body = None;
            }
            redirects += 1;
        }
    }

    /// Opens a WebSocket connection to `url`, which must use the `http`/
    /// `https` scheme (upgraded in place, not `ws`/`wss` — this crate treats
    /// the upgrade as a property of the request, matching how the server
    /// side upgrades an ordinary [`crate::Request`]).
    pub async fn websocket(&self, url: &str) -> Result<WebSocket<Prefixed<Stream>>, ClientErrorKind> {
        let target = RequestUrl::parse(url)?;
        let mut stream = self.dial(&target).await?;

        let key_bytes: [u8; 16] = std::array::from_fn(|_| fastrand::u8(..));
        let key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

        let mut request = build_request_line(&target, Method::Get);
        request.extend_from_slice(host_header(&target).as_bytes());
        request.extend_from_slice(b"connection: Upgrade\r\n");
        request.extend_from_slice(b"upgrade: websocket\r\n");
        request.extend_from_slice(b"sec-websocket-version: 13\r\n");
        request.extend_from_slice(format!("sec-websocket-key: {key}\r\n").as_bytes());
        request.extend_from_slice(b"\r\n");

        write_all_timeout(&mut stream, &request, self.limits.io_timeout).await?;

        let mut buf = Vec::new();
        let (head, scan) = codec::read_head(&mut stream, &mut buf, &self.limits).await?;
        if head.status != 101 {
            return Err(crate::errors::WebSocketErrorKind::InvalidHandshake.into());
        }
        let accept = head.header(b"sec-websocket-accept").ok_or(crate::errors::WebSocketErrorKind::InvalidHandshake)?;
        if accept != accept_key(&key).as_bytes() {
            return Err(crate::errors::WebSocketErrorKind::InvalidHandshake.into());
        }

        // Bytes already read past the `101` response belong to the first
        // WebSocket frame; the codec only consumed up to `scan`.
        let leftover = buf.split_off(scan);
        Ok(WebSocket::new(Prefixed::new(leftover, stream), Role::Client, self.ws_limits.clone()))
    }

    async fn dial(&self, url: &RequestUrl) -> Result<Stream, ClientErrorKind> {
        if url.is_tls() && !self.tls_enabled {
            return Err(ClientErrorKind::TlsNotConfigured);
        }
        let key = url.pool_key();
        if let Some(conn) = self.pool.lock().unwrap().acquire(&key) {
            return Ok(conn.stream);
        }
        Stream::connect(url.host(), url.port(), url.is_tls(), &self.limits).await
    }

    async fn send_once(
        &self,
        url: &RequestUrl,
        method: Method,
        body: Option<&[u8]>,
        extra_headers: &[(&str, &str)],
        decompress: bool,
    ) -> Result<(codec::ResponseHead, Vec<u8>), ClientErrorKind> {
        if url.is_tls() && !self.tls_enabled {
            return Err(ClientErrorKind::TlsNotConfigured);
        }
        let key = url.pool_key();
        let mut request_count = 0usize;
        let mut max_requests = None;

        let mut stream = match self.pool.lock().unwrap().acquire(&key) {
            Some(conn) => {
                request_count = conn.request_count;
                max_requests = conn.max_requests;
                conn.stream
            }
            None => Stream::connect(url.host(), url.port(), url.is_tls(), &self.limits).await?,
        };

        let request = build_request(url, method, body, extra_headers, decompress);
        if write_all_timeout(&mut stream, &request, self.limits.io_timeout).await.is_err() {
            // A pooled connection may have been closed by the peer between
            // release and reuse; dial fresh and retry once.
            stream = Stream::connect(url.host(), url.port(), url.is_tls(), &self.limits).await?;
            write_all_timeout(&mut stream, &request, self.limits.io_timeout).await?;
            request_count = 0;
            max_requests = None;
        }

        let mut buf = Vec::new();
        let (head, scan) = codec::read_head(&mut stream, &mut buf, &self.limits).await?;
        let has_body = method != Method::Head && !matches!(head.status, 100..=199 | 204 | 304);
        let raw_body = codec::read_body(&mut stream, &mut buf, scan, &head, &self.limits, has_body).await?;

        let body = if decompress {
            codec::decompress(head.header(b"content-encoding"), raw_body, self.limits.max_response_size)?
        } else {
            raw_body
        };

        request_count += 1;
        let idle_timeout = match parse_keep_alive(head.header(b"keep-alive")) {
            Some((timeout, ka_max)) => {
                max_requests = ka_max.or(max_requests);
                timeout.min(self.limits.pool_idle_timeout)
            }
            None => self.limits.pool_idle_timeout,
        };
        let exhausted = max_requests.is_some_and(|max| request_count >= max);
        if head.keep_alive && !exhausted {
            self.pool.lock().unwrap().release(
                key,
                IdleConnection {
                    stream,
                    idle_deadline: Instant::now() + idle_timeout,
                    request_count,
                    max_requests,
                },
            );
        }

        Ok((head, body))
    }
}

fn build_request_line(url: &RequestUrl, method: Method) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(url.path_and_query().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    out
}

fn host_header(url: &RequestUrl) -> String {
    if url.is_default_port() {
        format!("host: {}\r\n", url.host())
    } else {
        format!("host: {}:{}\r\n", url.host(), url.port())
    }
}

fn build_request(url: &RequestUrl, method: Method, body: Option<&[u8]>, extra_headers: &[(&str, &str)], decompress: bool) -> Vec<u8> {
    let mut out = build_request_line(url, method);

    let has_host = extra_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("host"));
    if !has_host {
        out.extend_from_slice(host_header(url).as_bytes());
    }

    let has_content_length = extra_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
    if !has_content_length {
        if let Some(body) = body {
            out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
        }
    }

    let has_accept_encoding = extra_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("accept-encoding"));
    if decompress && !has_accept_encoding {
        out.extend_from_slice(b"accept-encoding: gzip, deflate\r\n");
    }

    for (name, value) in extra_headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}

async fn write_all_timeout(stream: &mut Stream, data: &[u8], timeout: Duration) -> Result<(), ClientErrorKind> {
    match tokio::time::timeout(timeout, async {
        stream.write_all(data).await?;
        stream.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout").into()),
    }
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Parses a `Keep-Alive: timeout=N, max=M` header value.
fn parse_keep_alive(value: Option<&[u8]>) -> Option<(Duration, Option<usize>)> {
    let value = value?;
    let mut timeout = None;
    let mut max = None;
    for part in value.split(|&b| b == b',') {
        let part = trim_ows(part);
        if let Some(rest) = part.strip_prefix(b"timeout=") {
            timeout = slice_to_usize(rest).map(|s| Duration::from_secs(s as u64));
        } else if let Some(rest) = part.strip_prefix(b"max=") {
            max = slice_to_usize(rest);
        }
    }
    timeout.map(|t| (t, max))
}

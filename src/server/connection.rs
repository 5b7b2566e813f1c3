use crate::{
    dispatch::Dispatcher,
    errors::ErrorKind,
    http::{
        request::{FeedOutcome, Parser, Request},
        response::Response,
        types::Version,
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{arena::Arena, server_impl::AllLimits},
    Handled,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::sleep};

/// The outcome of driving one connection's request/response cycles to
/// completion: either the socket is done and should be dropped, or the
/// last response upgraded it to a different protocol (WebSocket) and
/// ownership is handed back so the caller can continue on it.
pub(crate) enum RunOutcome {
    Closed,
    Upgraded(TcpStream),
}

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    dispatcher: Arc<Dispatcher<H, S>>,
    connection_data: S,

    connection: Connection,
    arena: Arena,
    /// Index of the arena region body bytes are reassembled into. Created
    /// once and cleared (not re-pushed) between requests.
    body_region: usize,
    pub(crate) parser: Parser,
    pub(crate) request: Request,
    pub(crate) response: Response,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(handler: Arc<H>, dispatcher: Arc<Dispatcher<H, S>>, limits: AllLimits) -> Self {
        let mut arena = Arena::new();
        let body_region = arena.push_region(limits.2.body_size);

        Self {
            handler,
            dispatcher,
            connection_data: S::new(),

            connection: Connection::new(),
            arena,
            body_region,
            parser: Parser::new(&limits.2),
            request: Request::new(&limits.2),
            response: Response::new(&limits.3),

            server_limits: limits.0,
            conn_limits: limits.1,
            req_limits: limits.2,
            resp_limits: limits.3,
        }
    }

    /// Connection-scoped user state, for handing off to
    /// [`Handler::on_websocket`](crate::server::server_impl::Handler::on_websocket)
    /// after an upgrade.
    #[inline]
    pub(crate) fn connection_data_mut(&mut self) -> &mut S {
        &mut self.connection_data
    }

    #[inline]
    fn reset_request_response(&mut self) {
        self.parser.reset();
        self.request.reset();
        self.response.reset(&self.resp_limits);
        self.arena.clear_region(self.body_region);
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    /// Drives one connection end-to-end: request/response cycles until
    /// keep-alive ends, EOF, an error, or a protocol upgrade.
    #[inline]
    pub(crate) async fn run(
        &mut self,
        mut stream: TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<RunOutcome, io::Error> {
        self.request.client_addr = client_addr;
        self.request.server_addr = server_addr;

        match self.impl_run(&mut stream).await {
            Ok(true) => Ok(RunOutcome::Upgraded(stream)),
            Ok(false) => Ok(RunOutcome::Closed),
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(error) => {
                self.conn_limits
                    .send_error(&mut stream, error, self.request.version(), self.server_limits.json_errors)
                    .await?;
                Ok(RunOutcome::Closed)
            }
        }
    }

    /// Returns `Ok(true)` if the final response upgraded the connection.
    #[inline]
    async fn impl_run(&mut self, stream: &mut TcpStream) -> Result<bool, ErrorKind> {
        self.connection.reset();
        self.connection_data.reset();

        while !self.is_expired() {
            self.reset_request_response();

            if self
                .parser
                .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                .await?
                == 0
            {
                break;
            }
            self.response.set_version(self.parse(stream).await?);
            if !self.parser.should_keep_alive() || self.connection.request_count + 1 >= self.conn_limits.max_requests_per_connection {
                self.response.close();
            }

            self.dispatcher
                .dispatch(&self.handler, &mut self.connection_data, &self.request, &mut self.response)
                .await;

            if self.response.is_upgrade() {
                self.conn_limits.write_bytes(stream, self.response.buffer()).await?;
                return Ok(true);
            }

            if !self.parser.is_body_complete() {
                self.response.close();
            }

            self.conn_limits.write_bytes(stream, self.response.buffer()).await?;

            if !self.response.keep_alive() {
                break;
            }
            if self.parser.has_trailing_bytes() {
                break;
            }

            self.connection.request_count += 1;
        }

        Ok(false)
    }

    /// Drives the parser from wherever it stands (possibly mid-request-line,
    /// if the previous `fill_buffer` only delivered a partial message) up to
    /// headers-complete, reading more off `stream` as needed, then reads the
    /// body (if any) into a scratch arena region so it can be handed to the
    /// request as one contiguous `'static` slice.
    async fn parse(&mut self, stream: &mut TcpStream) -> Result<Version, ErrorKind> {
        loop {
            match self.parser.feed(&mut self.request, &self.req_limits)? {
                FeedOutcome::NeedMore => {
                    if self
                        .parser
                        .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                        .await?
                        == 0
                    {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-request").into());
                    }
                }
                FeedOutcome::HeadersComplete { .. } => {
                    self.parser.resume_parsing();
                    break;
                }
                FeedOutcome::MessageComplete { .. } => return Ok(self.request.version()),
            }
        }

        self.read_body(stream).await?;
        Ok(self.request.version())
    }

    /// Copies the request body (unwrapping chunked framing as needed) into
    /// an arena region, reading more off the socket whenever the parser has
    /// nothing left to decode but the body isn't complete yet.
    async fn read_body(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        if self.parser.is_body_complete() {
            return Ok(());
        }

        let mut total = 0usize;

        while !self.parser.is_body_complete() {
            let n = {
                let dest = &mut self.arena.region_mut(self.body_region)[total..];
                self.parser.prepare_body_read(dest, self.req_limits.body_size)?
            };
            total += n;

            if !self.parser.is_body_complete() {
                if self
                    .parser
                    .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                    .await?
                    == 0
                {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-body").into());
                }
            }
        }

        if total > 0 {
            // SAFETY: see `Arena::into_static`. The arena region lives on
            // `self`, cleared only at the start of the next request cycle.
            let body = unsafe { Arena::into_static(&self.arena.region(self.body_region)[..total]) };
            self.request.set_body(body);
        }

        Ok(())
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut TcpStream,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors)).await
    }

    #[inline]
    pub(crate) async fn write_bytes(&self, stream: &mut TcpStream, response: &[u8]) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> bool {
        !self.response.keep_alive()
            || self.connection.request_count >= self.conn_limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use wayfarer::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use wayfarer::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    fn filter(&self, client_addr: SocketAddr, server_addr: SocketAddr, error_response: &mut Response) -> Result<(), Handled>;

    /// Asynchronous connection inspection, run after [`filter`](Self::filter) succeeds.
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

use crate::{server::server_impl::Handler, Response};

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{dispatch::Dispatcher, Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                dispatcher: Arc::new(Dispatcher::default()),
                connection_data: (),

                connection: Connection::new(),
                arena: Arena::new(),
                parser: Parser::from(&req_limits, value),
                request: Request::new(&req_limits),
                response: Response::new(&resp_limits),

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                req_limits,
                resp_limits,
            }
        }
    }
}

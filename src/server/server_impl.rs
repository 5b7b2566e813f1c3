use crate::{
    dispatch::{Dispatcher, DispatcherBuilder, Middleware},
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, Response},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy, WebSocketLimits},
    router::Router,
    server::connection::{ConnectionData, HttpConnection, RunOutcome},
    websocket::{Role, WebSocket},
    ConnectionFilter, Version,
};
use crossbeam::queue::SegQueue;
use socket2::SockRef;
use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, Notify},
    task::yield_now,
    time::sleep as tokio_sleep,
};
use tracing::{debug, info, warn};

/// The interval [`Server::launch`] sleeps for between checks of
/// `active_connections` while draining after a [`ShutdownHandle::shutdown`]
/// call, when no connection closes in the meantime to wake it early.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. database connection pool, router configuration)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use wayfarer::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
///         // Simple echo handler
///         if req.url().target() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// Handler with [`ConnectionData`]
/// ```
/// use wayfarer::{Handler, ConnectionData, Request, Response, Handled, StatusCode};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(&self, data: &mut State, req: &Request, resp: &mut Response) -> Handled {
///         data.request_count += 1;
///
///         resp.status(StatusCode::Ok)
///             .body(format!("Request #{}", data.request_count))
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// This is the tail of the [dispatch shell](crate::dispatch): it only
    /// runs once the request has passed through every installed middleware
    /// and matched no registered route (or no router was installed at all).
    ///
    /// # Parameters
    ///
    /// - `connection_data`: Mutable reference to connection-specific state
    /// - `req`: Immutable reference to the parsed HTTP request
    /// - `resp`: Mutable response builder for constructing the response
    ///
    /// # Returns
    ///
    /// `Handled` indicating whether the request was fully processed or
    /// requires further handling by other middleware.
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics will terminate the connection.
    fn handle(&self, connection_data: &mut S, request: &Request, response: &mut Response) -> impl Future<Output = Handled> + Send;

    /// Takes ownership of a connection after [`Response::upgrade_to_websocket`]
    /// switched protocols on it.
    ///
    /// The default implementation closes the socket immediately; override it
    /// to actually speak the WebSocket protocol over `socket`.
    #[inline]
    fn on_websocket(&self, connection_data: &mut S, socket: WebSocket<TcpStream>) -> impl Future<Output = ()> + Send {
        let _ = connection_data;
        async move {
            drop(socket);
        }
    }
}

/// Four of the five limit groups a connection needs at construction time.
/// [`crate::limits::WebSocketLimits`] travels separately on [`Server`],
/// since it only applies after a connection has already upgraded.
pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits);

/// An HTTP server that processes incoming connections and requests.
///
/// Every admitted connection gets its own [`tokio::spawn`]ed task for its
/// whole lifetime; [`ServerLimits::max_connections`] bounds how many such
/// tasks may run at once, and connections that arrive while the server is
/// already at capacity queue for a [503](crate::StatusCode::ServiceUnavailable)
/// response instead.
///
/// # Examples
///
/// ```no_run
/// use wayfarer::{Server, Handler, Request, Response, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server<H: Handler<S>, S: ConnectionData = (), F: ConnectionFilter = ()> {
    listener: TcpListener,
    handler: Arc<H>,
    dispatcher: Arc<Dispatcher<H, S>>,
    filter: Arc<F>,

    limits: AllLimits,
    ws_limits: WebSocketLimits,
    active_connections: Arc<AtomicUsize>,
    error_queue: TcpQueue,

    ready_tx: Option<oneshot::Sender<SocketAddr>>,
    ready_rx: Option<oneshot::Receiver<SocketAddr>>,
    shutdown: Arc<Notify>,
    last_connection_closed: Arc<Notify>,
}

/// Handle returned by [`Server::shutdown_handle`]: triggers graceful
/// shutdown from outside the task running [`Server::launch`].
///
/// Calling [`shutdown`](Self::shutdown) stops the accept loop; `launch`
/// then waits for every already-admitted connection to finish its current
/// request/response cycle (or time out) before returning.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    /// Signals the server to stop accepting new connections and begin
    /// draining the ones already in flight.
    pub fn shutdown(&self) {
        self.0.notify_waiters();
    }
}

impl<H: Handler<S>, S: ConnectionData, F: ConnectionFilter> Server<H, S, F> {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # wayfarer::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use wayfarer::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder<NH, NS>() -> ServerBuilder<NH, NS, ()>
    where
        NH: Handler<NS>,
        NS: ConnectionData,
    {
        ServerBuilder {
            listener: None,
            handler: None,
            connection_filter: Arc::new(()),
            router: Router::default(),
            middlewares: Vec::new(),
            not_found: None,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            websocket_limits: None,
        }
    }

    /// Returns a one-shot receiver fired with the listener's bound local
    /// address once [`launch`](Self::launch) is called and about to start
    /// accepting.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same `Server`.
    #[track_caller]
    pub fn ready(&mut self) -> oneshot::Receiver<SocketAddr> {
        self.ready_rx.take().expect("Server::ready called more than once")
    }

    /// Returns a handle that can trigger this server's graceful shutdown
    /// from another task — see [`ShutdownHandle`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// Runs until [`ShutdownHandle::shutdown`] is called (or forever, if no
    /// handle is ever triggered): each accepted connection either gets its
    /// own task (below [`ServerLimits::max_connections`]) or is routed to an
    /// overflow-handler task that answers it with
    /// [503](crate::StatusCode::ServiceUnavailable). Once shutdown is
    /// signaled, the accept loop stops and `launch` waits for
    /// `active_connections` to reach zero, polling in bounded steps so a
    /// connection that never closes can't hang shutdown forever in a
    /// lost-wakeup way.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # wayfarer::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use wayfarer::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    #[inline]
    pub async fn launch(mut self) {
        info!(max_connections = self.limits.0.max_connections, "server listening");

        if let Ok(addr) = self.listener.local_addr() {
            if let Some(ready_tx) = self.ready_tx.take() {
                let _ = ready_tx.send(addr);
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("shutdown signaled, draining active connections");
                    break;
                }

                accepted = self.listener.accept() => {
                    let Ok((stream, client_addr)) = accepted else {
                        continue;
                    };

                    if self.active_connections.load(Ordering::Acquire) >= self.limits.0.max_connections {
                        if self.error_queue.len() < self.limits.0.max_pending_connections {
                            debug!(%client_addr, "connection queued for 503, server at capacity");
                            self.error_queue.push((stream, client_addr));
                        } else {
                            warn!(%client_addr, "overflow queue full, dropping connection without a response");
                        }
                        continue;
                    }

                    // Disable Nagle and enable TCP keepalive on the accepted socket;
                    // `socket2::SockRef` operates on the existing fd, no ownership
                    // transfer needed. Best-effort: an unsupported platform or a
                    // socket that's already gone shouldn't fail the accept loop.
                    let sock = SockRef::from(&stream);
                    let _ = sock.set_nodelay(true);
                    let _ = sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(self.limits.1.connection_lifetime));

                    self.active_connections.fetch_add(1, Ordering::AcqRel);
                    self.spawn_connection(stream, client_addr);
                }
            }
        }

        while self.active_connections.load(Ordering::Acquire) > 0 {
            tokio::select! {
                _ = self.last_connection_closed.notified() => {}
                _ = tokio_sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }

    /// Spawns the per-connection task: runs request/response cycles to
    /// completion, then (if the last response upgraded the protocol) hands
    /// the socket to [`Handler::on_websocket`].
    #[inline]
    fn spawn_connection(&self, mut stream: TcpStream, client_addr: SocketAddr) {
        let handler = self.handler.clone();
        let dispatcher = self.dispatcher.clone();
        let filter = self.filter.clone();
        let limits = self.limits.clone();
        let ws_limits = self.ws_limits.clone();
        let active_connections = self.active_connections.clone();
        let last_connection_closed = self.last_connection_closed.clone();

        tokio::spawn(async move {
            let mut conn = HttpConnection::new(handler.clone(), dispatcher, limits);

            if let Ok(server_addr) = stream.local_addr() {
                let rejected = filter.filter(client_addr, server_addr, &mut conn.response).is_err()
                    || filter.filter_async(client_addr, server_addr, &mut conn.response).await.is_err();

                if rejected {
                    let _ = conn.conn_limits.write_bytes(&mut stream, conn.response.buffer()).await;
                } else {
                    match conn.run(stream, client_addr, server_addr).await {
                        Ok(RunOutcome::Upgraded(stream)) => {
                            let socket = WebSocket::new(stream, Role::Server, ws_limits);
                            handler.on_websocket(conn.connection_data_mut(), socket).await;
                        }
                        Ok(RunOutcome::Closed) => {}
                        Err(error) => debug!(%client_addr, %error, "connection ended with I/O error"),
                    }
                }
            }

            active_connections.fetch_sub(1, Ordering::AcqRel);
            last_connection_closed.notify_waiters();
        });
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }

    /// Drains the overflow admission queue, answering each connection with
    /// [503](crate::StatusCode::ServiceUnavailable) rather than ever
    /// parsing a request off it.
    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, server_limits: ServerLimits, conn_limits: ConnLimits) {
        let queue = queue.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, client_addr) = Self::get_stream(&queue, &server_limits.wait_strategy).await;
                debug!(%client_addr, "answering queued connection with 503");

                let _ = conn_limits
                    .send_error(&mut stream, ErrorKind::ServiceUnavailable, Version::Http11, server_limits.json_errors)
                    .await;
            }
        });
    }

    /// Same overflow role as [`spawn_alarmist`](Self::spawn_alarmist), but
    /// silently drops the connection instead of responding; used when
    /// [`ServerLimits::count_503_handlers`] is `0`.
    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, server_limits: ServerLimits) {
        let queue = queue.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = Self::get_stream(&queue, &server_limits.wait_strategy).await;
                drop(stream);
            }
        });
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    connection_filter: Arc<F>,
    router: Router<S>,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
    not_found: Option<Arc<dyn for<'a> Fn(&'a mut S, &'a Request, &'a mut Response) -> Handled + Sync + Send>>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    websocket_limits: Option<WebSocketLimits>,
}

impl<H, S, F> ServerBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a connection filter to check incoming TCP connections
    /// before using it.
    ///
    /// Allows early rejection of unwanted IP addresses (before the first
    /// read). Can be used for DDoS protection, geobanning, etc.
    ///
    /// For more information, see [`ConnectionFilter`].
    #[inline(always)]
    pub fn conn_filter<NewF>(self, filter: NewF) -> ServerBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            connection_filter: Arc::new(filter),
            router: self.router,
            middlewares: self.middlewares,
            not_found: self.not_found,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
            websocket_limits: self.websocket_limits,
        }
    }

    /// Installs the route table consulted before the top-level [`Handler`].
    ///
    /// A request that matches a registered route never reaches
    /// [`Handler::handle`]; one that matches nothing falls through to
    /// [`not_found`](Self::not_found) if set, and otherwise to the handler.
    #[inline(always)]
    pub fn router(mut self, router: Router<S>) -> Self {
        self.router = router;
        self
    }

    /// Appends one middleware to the end of the dispatch chain.
    ///
    /// Middleware run in registration order, each wrapping everything after
    /// it (including route dispatch and the top-level handler). A
    /// middleware that never calls [`Next::next`](crate::dispatch::Next::next)
    /// short-circuits the request.
    #[inline(always)]
    pub fn middleware<M: Middleware<S>>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Overrides what runs when no route matches and the middleware chain
    /// ran to completion. Without this, an unmatched request falls through
    /// to the top-level [`Handler`] instead.
    #[inline(always)]
    pub fn not_found<NF>(mut self, hook: NF) -> Self
    where
        NF: for<'a> Fn(&'a mut S, &'a Request, &'a mut Response) -> Handled + Sync + Send + 'static,
    {
        self.not_found = Some(Arc::new(hook));
        self
    }

    /// Configures server-level concurrency, admission, and overload limits.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection timeout and lifetime limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffer allocation limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Configures frame/message size and keepalive limits applied to
    /// connections after they upgrade to WebSocket.
    #[inline(always)]
    pub fn websocket_limits(mut self, limits: WebSocketLimits) -> Self {
        self.websocket_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics when:
    /// - The `listener` method was not called.
    /// - The `handler` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<H, S, F> {
        let (listener, handler, filter, router, middlewares, not_found, limits, ws_limits) = self.get_all_parts();

        let mut dispatcher_builder = DispatcherBuilder::new().router(router);
        for middleware in middlewares {
            dispatcher_builder = dispatcher_builder.middleware_arc(middleware);
        }
        let dispatcher = Arc::new(dispatcher_builder.maybe_not_found(not_found).build());

        let error_queue: TcpQueue = Arc::new(SegQueue::new());
        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                Server::<H, S, F>::spawn_alarmist(&error_queue, limits.0.clone(), limits.1.clone());
            }
        } else {
            Server::<H, S, F>::spawn_quiet_alarmist(&error_queue, limits.0.clone());
        }

        let (ready_tx, ready_rx) = oneshot::channel();

        Server {
            listener,
            handler,
            dispatcher,
            filter,
            limits,
            ws_limits,
            active_connections: Arc::new(AtomicUsize::new(0)),
            error_queue,
            ready_tx: Some(ready_tx),
            ready_rx: Some(ready_rx),
            shutdown: Arc::new(Notify::new()),
            last_connection_closed: Arc::new(Notify::new()),
        }
    }

    #[inline]
    #[track_caller]
    #[allow(clippy::type_complexity)]
    fn get_all_parts(
        self,
    ) -> (
        TcpListener,
        Arc<H>,
        Arc<F>,
        Router<S>,
        Vec<Arc<dyn Middleware<S>>>,
        Option<Arc<dyn for<'a> Fn(&'a mut S, &'a Request, &'a mut Response) -> Handled + Sync + Send>>,
        AllLimits,
        WebSocketLimits,
    ) {
        (
            self.listener.expect("The `listener` method must be called to create"),
            self.handler.expect("The `handler` method must be called to create"),
            self.connection_filter,
            self.router,
            self.middlewares,
            self.not_found,
            (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default().precalculate(),
                self.response_limits.unwrap_or_default(),
            ),
            self.websocket_limits.unwrap_or_default(),
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

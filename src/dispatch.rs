//! Dispatch shell: middleware chain plus route lookup, terminating in either
//! the matched route handler, a `notFound` hook, or the connection's
//! top-level [`Handler`](crate::server::server_impl::Handler).
//!
//! Grounded on the teacher's synchronous, handler-writes-into-`&mut
//! Response` style (`server/server_impl.rs`'s `Handler` trait) for the
//! terminal step, generalized with a boxed-future middleware chain — the
//! teacher has no middleware concept, so the `Next`/`Middleware` split here
//! follows the same request/response/executor shape the specification
//! describes rather than any one example repo.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    router::{Params, Router},
    server::{connection::ConnectionData, server_impl::Handler},
    Handled, Request, Response,
};

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Handled> + Send + 'a>>;
type Terminal<S> = dyn for<'a> Fn(&'a mut S, &'a Request, &'a mut Response) -> BoxFuture<'a> + Sync + Send;
type NotFoundHook<S> = dyn for<'a> Fn(&'a mut S, &'a Request, &'a mut Response) -> Handled + Sync + Send;

/// One link in the request-processing chain. Receives the connection data,
/// the request, the response under construction, and a [`Next`] handle used
/// to advance to the rest of the chain.
pub trait Middleware<S: ConnectionData>: Sync + Send + 'static {
    fn call<'a>(&'a self, data: &'a mut S, req: &'a Request, resp: &'a mut Response, next: Next<'a, S>) -> BoxFuture<'a>;
}

// Plain functions (not closure literals — rustc can't infer a higher-ranked
// lifetime bound across a closure's captures) automatically qualify as
// `Middleware` through this blanket impl.
impl<S, F> Middleware<S> for F
where
    S: ConnectionData,
    F: for<'a> Fn(&'a mut S, &'a Request, &'a mut Response, Next<'a, S>) -> BoxFuture<'a> + Sync + Send + 'static,
{
    fn call<'a>(&'a self, data: &'a mut S, req: &'a Request, resp: &'a mut Response, next: Next<'a, S>) -> BoxFuture<'a> {
        self(data, req, resp, next)
    }
}

/// Handle to the remainder of the middleware chain. A middleware that never
/// calls [`Next::next`] short-circuits the request: nothing further in the
/// chain runs, including route dispatch.
pub struct Next<'a, S: ConnectionData> {
    middlewares: &'a [Arc<dyn Middleware<S>>],
    terminal: &'a Terminal<S>,
}

impl<'a, S: ConnectionData> Next<'a, S> {
    /// Runs the next middleware in line, or the route/handler step once
    /// every middleware ahead of it has called `next()`.
    pub fn next(self, data: &'a mut S, req: &'a Request, resp: &'a mut Response) -> BoxFuture<'a> {
        match self.middlewares.split_first() {
            Some((mw, rest)) => mw.call(
                data,
                req,
                resp,
                Next {
                    middlewares: rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(data, req, resp),
        }
    }
}

/// Assembles a [`Router`], a middleware chain, and an optional `notFound`
/// hook into the executor the connection loop drives each request through.
pub(crate) struct Dispatcher<H, S: ConnectionData> {
    router: Router<S>,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
    not_found: Option<Arc<NotFoundHook<S>>>,
    _marker: std::marker::PhantomData<fn() -> H>,
}

impl<H, S: ConnectionData> Default for Dispatcher<H, S> {
    fn default() -> Self {
        Self {
            router: Router::default(),
            middlewares: Vec::new(),
            not_found: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<H: Handler<S>, S: ConnectionData> Dispatcher<H, S> {
    pub(crate) fn new(router: Router<S>, middlewares: Vec<Arc<dyn Middleware<S>>>, not_found: Option<Arc<NotFoundHook<S>>>) -> Self {
        Self {
            router,
            middlewares,
            not_found,
            _marker: std::marker::PhantomData,
        }
    }

    /// Drives one request through the middleware chain down to a route
    /// handler, the `notFound` hook, or (absent both) the connection's
    /// top-level handler — which is how a `Dispatcher` with no registered
    /// routes behaves exactly like calling `handler.handle()` directly.
    pub(crate) async fn dispatch(&self, handler: &Arc<H>, data: &mut S, req: &Request, resp: &mut Response) -> Handled {
        let router = &self.router;
        let not_found = self.not_found.as_ref();
        let handler = Arc::clone(handler);

        let terminal = move |data: &mut S, req: &Request, resp: &mut Response| -> BoxFuture<'_> {
            let segments: Vec<&str> = req
                .url()
                .path_segments()
                .iter()
                .filter_map(|s| std::str::from_utf8(s).ok())
                .collect();

            if let Some((route, params)) = router.find(req.method(), &segments) {
                let handled = route(data, req, resp, &params);
                return Box::pin(async move { handled });
            }

            if let Some(nf) = not_found {
                let handled = nf(data, req, resp);
                return Box::pin(async move { handled });
            }

            let handler = Arc::clone(&handler);
            Box::pin(async move { handler.handle(data, req, resp).await })
        };

        let next = Next {
            middlewares: &self.middlewares,
            terminal: &terminal,
        };
        next.next(data, req, resp).await
    }
}

/// Builds a [`Dispatcher`] from an optional [`Router`], an ordered list of
/// middleware, and an optional `notFound` override.
pub(crate) struct DispatcherBuilder<H, S: ConnectionData> {
    router: Router<S>,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
    not_found: Option<Arc<NotFoundHook<S>>>,
    _marker: std::marker::PhantomData<fn() -> H>,
}

impl<H: Handler<S>, S: ConnectionData> DispatcherBuilder<H, S> {
    pub(crate) fn new() -> Self {
        Self {
            router: Router::default(),
            middlewares: Vec::new(),
            not_found: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub(crate) fn router(mut self, router: Router<S>) -> Self {
        self.router = router;
        self
    }

    pub(crate) fn middleware<M: Middleware<S>>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Appends a middleware already wrapped in `Arc<dyn Middleware<S>>`, for
    /// callers (like [`ServerBuilder`](crate::server::server_impl::ServerBuilder))
    /// that accumulate middleware as trait objects before building.
    pub(crate) fn middleware_arc(mut self, middleware: Arc<dyn Middleware<S>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub(crate) fn not_found<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a Request, &'a mut Response) -> Handled + Sync + Send + 'static,
    {
        self.not_found = Some(Arc::new(hook));
        self
    }

    /// Sets an already-wrapped `notFound` hook, mirroring [`middleware_arc`](Self::middleware_arc).
    pub(crate) fn maybe_not_found(mut self, hook: Option<Arc<NotFoundHook<S>>>) -> Self {
        self.not_found = hook;
        self
    }

    pub(crate) fn build(self) -> Dispatcher<H, S> {
        Dispatcher::new(self.router, self.middlewares, self.not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{server::server_impl::Handler, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    impl Handler<()> for EchoHandler {
        async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
            resp.status(StatusCode::Ok).body("fallback")
        }
    }

    #[tokio::test]
    async fn empty_dispatcher_falls_through_to_handler() {
        let dispatcher: Dispatcher<EchoHandler, ()> = Dispatcher::default();
        let handler = Arc::new(EchoHandler);
        let req = Request::new(&crate::limits::ReqLimits::default());
        let mut resp = Response::new(&crate::limits::RespLimits::default());
        dispatcher.dispatch(&handler, &mut (), &req, &mut resp).await;
        assert!(String::from_utf8_lossy(resp.buffer()).ends_with("fallback"));
    }

    #[tokio::test]
    async fn router_match_short_circuits_handler() {
        let mut router: Router<()> = Router::new();
        router.route(crate::Method::Get, "/ping", |_, _, resp, _| resp.status(StatusCode::Ok).body("pong"));

        let dispatcher: Dispatcher<EchoHandler, ()> = DispatcherBuilder::new().router(router).build();
        let handler = Arc::new(EchoHandler);

        let limits = crate::limits::ReqLimits::default().precalculate();
        let mut parser = crate::http::request::Parser::from(&limits, b"GET /ping HTTP/1.1\r\n\r\n" as &[u8]);
        let mut req = Request::new(&limits);
        loop {
            match parser.feed(&mut req, &limits).unwrap() {
                crate::http::request::FeedOutcome::HeadersComplete { .. } => parser.resume_parsing(),
                crate::http::request::FeedOutcome::MessageComplete { .. } | crate::http::request::FeedOutcome::NeedMore => break,
            }
        }

        let mut resp = Response::new(&crate::limits::RespLimits::default());
        dispatcher.dispatch(&handler, &mut (), &req, &mut resp).await;
        assert!(String::from_utf8_lossy(resp.buffer()).ends_with("pong"));
    }

    fn forbid_mw<'a>(_: &'a mut (), _: &'a Request, resp: &'a mut Response, _: Next<'a, ()>) -> BoxFuture<'a> {
        Box::pin(async move { resp.status(StatusCode::Forbidden).body("blocked") })
    }

    #[tokio::test]
    async fn middleware_can_short_circuit_before_dispatch() {
        let dispatcher: Dispatcher<EchoHandler, ()> = DispatcherBuilder::new().middleware(forbid_mw).build();
        let handler = Arc::new(EchoHandler);
        let req = Request::new(&crate::limits::ReqLimits::default());
        let mut resp = Response::new(&crate::limits::RespLimits::default());
        dispatcher.dispatch(&handler, &mut (), &req, &mut resp).await;
        assert!(String::from_utf8_lossy(resp.buffer()).ends_with("blocked"));
    }

    struct CountingMiddleware(Arc<AtomicUsize>);

    impl Middleware<()> for CountingMiddleware {
        fn call<'a>(&'a self, data: &'a mut (), req: &'a Request, resp: &'a mut Response, next: Next<'a, ()>) -> BoxFuture<'a> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.next(data, req, resp)
        }
    }

    #[tokio::test]
    async fn middleware_chain_runs_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));

        let dispatcher: Dispatcher<EchoHandler, ()> = DispatcherBuilder::new()
            .middleware(CountingMiddleware(calls.clone()))
            .middleware(CountingMiddleware(calls.clone()))
            .build();
        let handler = Arc::new(EchoHandler);
        let req = Request::new(&crate::limits::ReqLimits::default());
        let mut resp = Response::new(&crate::limits::RespLimits::default());
        dispatcher.dispatch(&handler, &mut (), &req, &mut resp).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(String::from_utf8_lossy(resp.buffer()).ends_with("fallback"));
    }
}

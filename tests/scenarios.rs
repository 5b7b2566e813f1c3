//! End-to-end scenarios that need a live socket: keep-alive connection
//! reuse, redirect following, the WebSocket handshake, and the no-pipelining
//! rule. Everything else (framing, router precedence, chunked bodies,
//! cookies) is covered by unit tests colocated with its module; these are
//! the cases `spec.md` S1/S4/S5/S6/S10 call out as needing a real client
//! talking to a real server over TCP.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use wayfarer::{
    websocket::{accept_key, Message, WebSocket},
    Client, ConnectionFilter, FetchOptions, Handled, Handler, Method, Request, Response, Router, Server, StatusCode,
};

struct EchoHandler;

impl Handler for EchoHandler {
    async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
        resp.status(StatusCode::Ok).body("ok")
    }
}

async fn spawn_with_handler<H: Handler<()>>(handler: H) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::builder::<H, ()>().listener(listener).handler(handler).build();
    let handle = tokio::spawn(server.launch());
    (addr, handle)
}

async fn spawn_with_router(router: Router<()>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::builder().listener(listener).handler(EchoHandler).router(router).build();
    let handle = tokio::spawn(server.launch());
    (addr, handle)
}

/// S1: `GET /users/42?name=Ann` through router `/users/:id` — the handler
/// sees the bound parameter and the decoded query, and the client receives
/// the handler's body untouched.
#[tokio::test]
async fn s1_route_params_and_query_reach_the_handler() {
    let mut router: Router<()> = Router::new();
    router.route(Method::Get, "/users/:id", |_, req, resp, params| {
        let id = params.get("id").unwrap_or("?").to_string();
        let name = req.url().query(b"name").map(|v| String::from_utf8_lossy(v).into_owned()).unwrap_or_default();
        resp.status(StatusCode::Ok).header("x-query-name", name).body(format!("Hello User {id}\n"))
    });
    let (addr, handle) = spawn_with_router(router).await;

    let client = Client::default();
    let response = client.get(&format!("http://{addr}/users/42?name=Ann")).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("x-query-name"), Some("Ann"));
    assert_eq!(response.text().unwrap(), "Hello User 42\n");

    handle.abort();
}

/// S4: two sequential requests to the same authority on a pooled client
/// reuse one TCP connection. A [`ConnectionFilter`] runs exactly once per
/// *accepted* connection, so counting its calls is an outside observation of
/// how many sockets the server actually saw.
struct CountingFilter(Arc<AtomicUsize>);

impl ConnectionFilter for CountingFilter {
    fn filter(&self, _client_addr: SocketAddr, _server_addr: SocketAddr, _error_response: &mut Response) -> Result<(), Handled> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn s4_keep_alive_reuses_one_pooled_connection() {
    let accepted = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::builder()
        .listener(listener)
        .handler(EchoHandler)
        .conn_filter(CountingFilter(accepted.clone()))
        .build();
    let handle = tokio::spawn(server.launch());

    let client = Client::default();
    let first = client.get(&format!("http://{addr}/a")).await.unwrap();
    assert_eq!(first.status(), 200);
    let second = client.get(&format!("http://{addr}/b")).await.unwrap();
    assert_eq!(second.status(), 200);

    assert_eq!(accepted.load(Ordering::SeqCst), 1, "second request should reuse the pooled connection, not dial a new one");

    handle.abort();
}

/// S5: a 303 redirect from a POST turns the follow-up request into a
/// bodyless GET. `/new` reports back whether it saw a `Content-Length` so
/// the test can observe the body was dropped without needing to inspect the
/// client's internals.
#[tokio::test]
async fn s5_see_other_redirect_clears_method_and_body() {
    let mut router: Router<()> = Router::new();
    router.route(Method::Post, "/old", |_, _, resp, _| resp.status(StatusCode::SeeOther).header("location", "/new").body(""));
    router.route(Method::Get, "/new", |_, req, resp, _| {
        let had_body = if req.content_length().is_some() { "yes" } else { "no" };
        resp.status(StatusCode::Ok).header("x-had-body", had_body).body("landed")
    });
    let (addr, handle) = spawn_with_router(router).await;

    let client = Client::default();
    let response = client
        .fetch(
            &format!("http://{addr}/old"),
            FetchOptions {
                method: Method::Post,
                body: Some(b"original payload"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().unwrap(), "landed");
    assert_eq!(response.header("x-had-body"), Some("no"), "redirected GET must not carry the POST's body");

    handle.abort();
}

/// S6: WebSocket upgrade via `Sec-WebSocket-Key`/`Sec-WebSocket-Accept`,
/// then a masked client message echoed back unmasked, then a clean close.
struct WsHandler;

impl Handler for WsHandler {
    async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
        match req.header(b"sec-websocket-key").and_then(|k| std::str::from_utf8(k).ok()) {
            Some(key) => resp.upgrade_to_websocket(&accept_key(key)),
            None => resp.status(StatusCode::BadRequest).body("expected a websocket upgrade"),
        }
    }

    async fn on_websocket(&self, _: &mut (), mut socket: WebSocket<TcpStream>) {
        if let Ok(Message::Text(text)) = socket.receive().await {
            let _ = socket.send_text(&text).await;
        }
        let _ = socket.close(Some(1000), "bye").await;
    }
}

#[tokio::test]
async fn s6_websocket_handshake_and_echo() {
    let (addr, handle) = spawn_with_handler(WsHandler).await;

    let client = Client::default();
    let mut socket = client.websocket(&format!("http://{addr}/ws")).await.unwrap();

    socket.send_text("Hello").await.unwrap();
    match socket.receive().await.unwrap() {
        Message::Text(text) => assert_eq!(text, "Hello"),
        other => panic!("expected an echoed text message, got {other:?}"),
    }
    match socket.receive().await.unwrap() {
        Message::Close(_) => {}
        other => panic!("expected a close frame, got {other:?}"),
    }

    handle.abort();
}

/// S10: a second request's bytes arriving before the first response was
/// written causes the server to close the connection after answering the
/// first request, rather than attempting to pipeline a second response.
#[tokio::test]
async fn s10_pipelined_bytes_close_the_connection() {
    let (addr, handle) = spawn_with_handler(EchoHandler).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await.unwrap().unwrap();
    assert!(n > 0, "expected a response to the first request");
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    // The server must not answer `/second` on this connection; instead it
    // closes outright, so a further read observes EOF.
    let n2 = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n2, 0, "connection should be closed rather than pipelining a second response");

    handle.abort();
}

//! wayfarer - a high-performance, zero-allocation HTTP/1.x server and client
//! for microservices
//!
//! A performance-oriented HTTP stack with comprehensive configuration for
//! memory management, connection handling, and protocol support. Designed
//! for microservices requiring fine-grained control over resources, on both
//! ends of the connection.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: Full protocol with persistent connections and chunked encoding
//! - **HTTP/1.0**: Basic protocol support for legacy clients and simple requests
//! - **WebSocket** ([RFC 6455](https://www.rfc-editor.org/rfc/rfc6455)): upgrade
//!   a connection with [`Response::upgrade_to_websocket`] and exchange
//!   [`websocket::Message`]s with [`websocket::WebSocket`]
//! - **Server-Sent Events**: streamed via [`Response::start_sse`]
//!
//! # Features
//!
//! ## 🔒 Security & Protection
//! - **Built-in DoS/DDoS protection** - enabled by default, with no performance penalty.
//! - **Fully configurable limits and timeouts** for requests, responses, and connections.
//! - **Custom connection filtering** - implement the [`ConnectionFilter`] trait to
//!   reject unwanted connections at the TCP level.
//!
//! ## 🚀 Performance & Memory
//! - **Zero-allocation** - no body-buffer allocations after server startup; each
//!   connection reuses its own arena across keep-alive requests.
//! - **Pre-allocated memory for each connection** - linear and transparent scaling.
//!
//! ## 🌐 Protocol & Management
//! - **Full HTTP/1.x stack** with keep-alive, chunked transfer-encoding, and
//!   automatic protocol detection for each request.
//! - **Declarative routing** - a per-method radix-tree [`router::Router`] with
//!   static, parameterized, and wildcard segments.
//! - **Middleware chain** - see [`dispatch`] for the executor that runs
//!   middleware ahead of route dispatch.
//! - **Storing data between requests** - ability to store data between requests in a
//!   single connection using the [`ConnectionData`] trait.
//!
//! ## 🏭 Production Ready
//! - **Graceful performance degradation** - automatic 503 responses when overloaded.
//! - [**Custom error format**](limits::ServerLimits#structfield.json_errors) -
//!   structured JSON (with codes/descriptions) or a plain HTTP response.
//! - **Resource protection** - automatic closure of connections exceeding set limits.
//!
//! # Quick Start
//!
//! ## 1. Installation
//!
//! Add `wayfarer` and [`tokio`](https://crates.io/crates/tokio) to your `Cargo.toml`:
//!
//! ```bash
//! cargo add wayfarer tokio --features tokio/full
//! ```
//! Or manually:
//! ```toml
//! [dependencies]
//! wayfarer = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! ## 2. Usage example
//! ```no_run
//! use wayfarer::{Server, Handler, Request, Response, Handled, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # Use Cases
//!
//! - **High-throughput microservices** - configurable for specific workloads
//! - **Resource-constrained environments** - predictable memory usage
//! - **Internal APIs** - security-conscious defaults
//! - **Performance-critical applications** - zero-allocation design
//! - **Realtime features** - WebSocket and SSE support alongside plain HTTP

pub(crate) mod http {
    pub mod cookie;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod scan;
    pub(crate) mod types;
}
pub(crate) mod client {
    pub(crate) mod client_impl;
    pub(crate) mod codec;
    pub(crate) mod pool;
    pub(crate) mod stream;
    pub(crate) mod tls;
    pub(crate) mod url;
}
pub(crate) mod dispatch;
pub(crate) mod errors;
pub mod limits;
pub mod router;
pub(crate) mod server {
    pub(crate) mod arena;
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub mod websocket;

pub use crate::{
    client::{
        client_impl::{Client, ClientBuilder, ClientResponse, FetchOptions},
        stream::{Prefixed, Stream as ClientStream},
    },
    errors::{ClientErrorKind, WebSocketErrorKind},
    http::{
        cookie,
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    router::{Params, Router},
    server::{
        connection::{ConnectionData, ConnectionFilter},
        server_impl::{Handler, Server, ServerBuilder, ShutdownHandle},
    },
    websocket::{accept_key, Message, Role, WebSocket},
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::limits::ReqLimits::default()),
        &mut Response::new(&crate::limits::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use wayfarer::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        // `<()>` to check functionality
        impl Handler<()> for $name {
            async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}

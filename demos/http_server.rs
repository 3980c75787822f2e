//! A hyper server whose every request runs through one composed stack.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example http_server
//!
//! Try:
//!   curl -i http://localhost:3000/
//!   curl -i http://localhost:3000/healthz
//!   curl -i http://localhost:3000/admin
//!   curl -i -H 'authorization: token' http://localhost:3000/admin
//!   curl -i http://localhost:3000/fail

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tsu_compose::{Compose, Composed, Next};

// ── Context ───────────────────────────────────────────────────────────────────

/// One request/response exchange, shared by every stage of the stack.
struct Exchange {
    method: Method,
    path: String,
    headers: HeaderMap,
    reply: Mutex<Reply>,
}

#[derive(Default)]
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Exchange {
    fn reply(&self, status: StatusCode, body: &'static str) {
        let mut reply = self.reply.lock().unwrap_or_else(|e| e.into_inner());
        reply.status = status;
        reply.body = Bytes::from_static(body.as_bytes());
    }

    fn status(&self) -> StatusCode {
        self.reply.lock().unwrap_or_else(|e| e.into_inner()).status
    }
}

type Ctx = Arc<Exchange>;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Compose(#[from] tsu_compose::Error),
    #[error("upstream unavailable: {0}")]
    Upstream(&'static str),
}

type App = Composed<Ctx, (), AppError>;

// ── Middleware ────────────────────────────────────────────────────────────────

/// Turns any downstream failure into a 500 before the stack unwinds further.
async fn error_boundary(ctx: Ctx, next: Next<Ctx, (), AppError>) -> Result<(), AppError> {
    if let Err(e) = next.run().await {
        error!(path = %ctx.path, "request failed: {e}");
        ctx.reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }
    Ok(())
}

/// Logs method, path, final status and latency once the stack has unwound.
///
/// Registered outermost, so the status it reads already includes whatever
/// `error_boundary` wrote on the way back up.
async fn access_log(ctx: Ctx, next: Next<Ctx, (), AppError>) -> Result<(), AppError> {
    let started = Instant::now();
    let out = next.run().await;
    info!(
        method = %ctx.method,
        path = %ctx.path,
        status = ctx.status().as_u16(),
        latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "request"
    );
    out
}

/// Echoes `x-request-id`, or assigns one, on the response.
async fn request_id(ctx: Ctx, next: Next<Ctx, (), AppError>) -> Result<(), AppError> {
    static SEQ: AtomicU64 = AtomicU64::new(1);

    let id = match ctx.headers.get("x-request-id") {
        Some(id) => id.clone(),
        None => HeaderValue::from(SEQ.fetch_add(1, Ordering::Relaxed)),
    };
    let out = next.run().await;
    ctx.reply
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .headers
        .insert("x-request-id", id);
    out
}

/// Short-circuits `/admin` requests that carry no credentials.
async fn require_auth(ctx: Ctx, next: Next<Ctx, (), AppError>) -> Result<(), AppError> {
    if ctx.path.starts_with("/admin") && !ctx.headers.contains_key(http::header::AUTHORIZATION) {
        warn!(path = %ctx.path, "missing credentials");
        ctx.reply(StatusCode::UNAUTHORIZED, "unauthorized");
        return Ok(());
    }
    next.run().await
}

/// Terminal stage.
async fn respond(ctx: Ctx, _next: Next<Ctx, (), AppError>) -> Result<(), AppError> {
    match (&ctx.method, ctx.path.as_str()) {
        (&Method::GET, "/") => ctx.reply(StatusCode::OK, "hello"),
        (&Method::GET, "/healthz") => ctx.reply(StatusCode::OK, "ok"),
        (&Method::GET, "/admin") => ctx.reply(StatusCode::OK, "welcome back"),
        (&Method::GET, "/fail") => return Err(AppError::Upstream("billing")),
        _ => ctx.reply(StatusCode::NOT_FOUND, "not found"),
    }
    Ok(())
}

fn app() -> App {
    Compose::new()
        .with(access_log)
        .with(error_boundary)
        .with(request_id)
        .with(require_auth)
        .with(respond)
        .build()
}

// ── Server ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = "0.0.0.0:3000".parse().expect("invalid socket address");
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    let app = app();

    info!(%addr, stages = app.len(), "listening");

    // JoinSet tracks every spawned connection task so shutdown can wait for
    // them all to finish.
    let mut tasks = tokio::task::JoinSet::new();

    // `select!` polls the shutdown future by reference on every iteration,
    // so it must stay put in memory.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Check shutdown first so a SIGTERM stops accepting new
            // connections even while more are queued.
            biased;

            () = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                // One `Composed` serves every connection. Cloning it is an
                // Arc increment; each request still gets its own cursor.
                let app = app.clone();
                let io = TokioIo::new(stream);

                tasks.spawn(async move {
                    // Called once per request on the connection, not once
                    // per connection.
                    let svc = service_fn(move |req| {
                        let app = app.clone();
                        async move { dispatch(app, req).await }
                    });

                    // HTTP/1.1 or HTTP/2, whatever the client negotiates.
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await
                    {
                        error!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Drain: wait for every in-flight connection before returning.
    while tasks.join_next().await.is_some() {}
    info!("stopped");
}

/// Runs one request through the stack and renders whatever it left behind.
async fn dispatch(
    app: App,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, _body) = req.into_parts();
    let ctx = Arc::new(Exchange {
        method: parts.method,
        path: parts.uri.path().to_owned(),
        headers: parts.headers,
        reply: Mutex::new(Reply::default()),
    });

    if let Err(e) = app.run(Arc::clone(&ctx)).await {
        error!("stack failed outside the error boundary: {e}");
        ctx.reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }

    let reply = std::mem::take(&mut *ctx.reply.lock().unwrap_or_else(|e| e.into_inner()));
    let mut response = http::Response::new(Full::new(reply.body));
    *response.status_mut() = reply.status;
    *response.headers_mut() = reply.headers;
    Ok(response)
}

/// Resolves on the first shutdown signal the process receives.
///
/// SIGTERM is what Kubernetes sends before SIGKILL; SIGINT (Ctrl-C) covers
/// local development. On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    // Never resolves, so the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        /// The access-log line, identified by its `status=` field.
        fn access_line(&self) -> String {
            let logs = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            logs.lines()
                .find(|line| line.contains(" status="))
                .expect("no access log line")
                .to_owned()
        }
    }

    fn exchange(method: Method, path: &str) -> Ctx {
        Arc::new(Exchange {
            method,
            path: path.to_owned(),
            headers: HeaderMap::new(),
            reply: Mutex::new(Reply::default()),
        })
    }

    fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (captured, tracing::subscriber::set_default(subscriber))
    }

    #[tokio::test]
    async fn failed_request_is_logged_with_the_boundary_status() {
        let (captured, _guard) = capture();
        let ctx = exchange(Method::GET, "/fail");

        app().run(Arc::clone(&ctx)).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let line = captured.access_line();
        assert!(line.contains("path=/fail"), "{line}");
        assert!(line.contains("status=500"), "{line}");
    }

    #[tokio::test]
    async fn rejected_admin_request_is_logged_as_unauthorized() {
        let (captured, _guard) = capture();
        let ctx = exchange(Method::GET, "/admin");

        app().run(Arc::clone(&ctx)).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::UNAUTHORIZED);
        assert!(ctx.reply.lock().unwrap().headers.contains_key("x-request-id"));
        assert!(captured.access_line().contains("status=401"));
    }

    #[tokio::test]
    async fn healthy_request_is_logged_as_ok() {
        let (captured, _guard) = capture();
        let ctx = exchange(Method::GET, "/healthz");

        app().run(Arc::clone(&ctx)).await.unwrap();

        assert_eq!(ctx.reply.lock().unwrap().body, Bytes::from_static(b"ok"));
        assert!(captured.access_line().contains("status=200"));
    }
}

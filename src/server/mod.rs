//! The data-plane listener: one request per connection, filtered, then
//! either forwarded as a unary call or hijacked into a stream session.

pub mod http;

use self::http::{ClientConn, RequestHead};
use crate::error::Result;
use crate::plugin::api::InvokePoint;
use crate::plugin::chain::{ChainVerdict, FilterChain};
use crate::scope::RequestScope;
use crate::state::AppState;
use crate::stream::StreamSession;
use bytes::Bytes;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Where a request is headed once its path is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// `POST /exec/{id}/start`: hijack and pump.
    ExecStart,
    /// `POST /containers/{id}/attach`: hijack and pump.
    Attach,
    /// Everything else: buffered forward to the engine.
    Unary,
}

impl RouteKind {
    pub fn is_interactive(self) -> bool {
        !matches!(self, RouteKind::Unary)
    }

    fn session_label(self) -> &'static str {
        match self {
            RouteKind::ExecStart => "exec",
            RouteKind::Attach => "attach",
            RouteKind::Unary => "unary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    /// Path forwarded to the engine, with any token segment stripped.
    pub upstream_path: String,
    /// Opaque session token from a `/token/{token}/...` prefix, if present.
    pub token: Option<String>,
    pub kind: RouteKind,
}

/// Classifies inbound paths. The engine API version segment (`/v1.40`) and
/// the token prefix are both optional; queries ride along untouched.
pub struct Router {
    token_prefix: Regex,
    exec_start: Regex,
    attach: Regex,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            token_prefix: Regex::new(r"^/token/([^/]+)(/.*)$").unwrap(),
            exec_start: Regex::new(r"^(?:/v[0-9]+\.[0-9]+)?/exec/[^/]+/start(?:\?.*)?$").unwrap(),
            attach: Regex::new(r"^(?:/v[0-9]+\.[0-9]+)?/containers/[^/]+/attach(?:\?.*)?$")
                .unwrap(),
        }
    }

    pub fn resolve(&self, path: &str) -> Route {
        let (token, upstream) = match self.token_prefix.captures(path) {
            Some(caps) => (Some(caps[1].to_string()), caps[2].to_string()),
            None => (None, path.to_string()),
        };

        let kind = if self.exec_start.is_match(&upstream) {
            RouteKind::ExecStart
        } else if self.attach.is_match(&upstream) {
            RouteKind::Attach
        } else {
            RouteKind::Unary
        };

        Route {
            upstream_path: upstream,
            token,
            kind,
        }
    }
}

pub struct ProxyServer {
    state: Arc<AppState>,
    router: Router,
}

impl ProxyServer {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            router: Router::new(),
        })
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.state.config.proxy.addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Proxy listening");
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "Accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    /// Serve exactly one request on the connection, then close it.
    pub async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut conn = ClientConn::new(stream);

        let head = match conn.read_request_head().await {
            Ok(head) => head,
            Err(e) => {
                debug!(error = %e, "Rejecting unreadable request");
                let _ = conn.write_response(400, &[], e.to_string().as_bytes()).await;
                return;
            }
        };

        let route = self.router.resolve(&head.path);
        let metric_path = route
            .upstream_path
            .split('?')
            .next()
            .unwrap_or(&route.upstream_path)
            .to_string();

        let started = Instant::now();
        let in_flight = self
            .state
            .metrics
            .requests_in_flight
            .with_label_values(&[&head.method, &metric_path]);
        in_flight.inc();

        let status = self.dispatch(&mut conn, &head, &route).await;

        in_flight.dec();
        self.state
            .metrics
            .record_request(status, &head.method, &metric_path, started.elapsed());
    }

    /// Runs the request through the filter chain and out the appropriate
    /// exit. Returns the status code recorded for the request.
    async fn dispatch<S>(&self, conn: &mut ClientConn<S>, head: &RequestHead, route: &Route) -> u16
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let scope = Arc::new(RequestScope::new(&head.method, &route.upstream_path));
        if let Some(token) = &route.token {
            scope.set("session.token", token.clone());
        }

        let body = match conn.read_body(head.content_length()).await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "Could not read request body");
                let _ = conn.write_response(400, &[], e.to_string().as_bytes()).await;
                return 400;
            }
        };

        // One snapshot for the whole request; a concurrent reload cannot
        // change the filters or capabilities mid-flight.
        let snapshot = self.state.registry.snapshot();
        let chain = FilterChain::new(
            snapshot.clone(),
            InvokePoint::Request,
            self.state.metrics.clone(),
        );

        let body = match chain.run(&scope, body) {
            Ok(ChainVerdict::Proceed { body }) => body,
            Ok(ChainVerdict::Halt { status, body }) => {
                let _ = conn.write_response(status, &[], &body).await;
                return status;
            }
            Err(e) => {
                let status = e.response_status();
                let _ = conn
                    .write_response(status, &[], e.response_body().as_bytes())
                    .await;
                return status;
            }
        };

        if route.kind.is_interactive() {
            self.run_stream_session(conn, head, route, body).await
        } else {
            self.forward_unary(conn, head, route, &scope, snapshot, body)
                .await
        }
    }

    async fn run_stream_session<S>(
        &self,
        conn: &mut ClientConn<S>,
        head: &RequestHead,
        route: &Route,
        body: Bytes,
    ) -> u16
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let backend = match self
            .state
            .backend
            .attach(&route.upstream_path, body)
            .await
        {
            Ok(backend) => backend,
            Err(e) => {
                warn!(path = %route.upstream_path, error = %e, "Backend attach failed");
                let _ = conn.write_response(502, &[], e.to_string().as_bytes()).await;
                return 502;
            }
        };

        // Point of no return: after the hijack every failure is a stream
        // teardown, never an HTTP error response.
        let (client, leftover) = match conn.hijack() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Hijack refused");
                let _ = conn.write_response(500, &[], e.to_string().as_bytes()).await;
                return 500;
            }
        };

        let upgrade = head
            .header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("tcp"));
        let status: u16 = if upgrade { 101 } else { 200 };

        let gauge = self
            .state
            .metrics
            .sessions_active
            .with_label_values(&[route.kind.session_label()]);
        gauge.inc();

        let session = StreamSession::new(client, backend, upgrade).with_client_leftover(leftover);
        match session.run().await {
            Ok(stats) => {
                info!(
                    path = %route.upstream_path,
                    client_to_backend = stats.client_to_backend,
                    backend_to_client = stats.backend_to_client,
                    "Stream session finished"
                );
            }
            Err(e) => {
                warn!(path = %route.upstream_path, error = %e, "Stream session failed");
            }
        }

        gauge.dec();
        status
    }

    async fn forward_unary<S>(
        &self,
        conn: &mut ClientConn<S>,
        head: &RequestHead,
        route: &Route,
        scope: &Arc<RequestScope>,
        snapshot: Arc<crate::plugin::registry::RegistrySnapshot>,
        body: Bytes,
    ) -> u16
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let response = match self
            .state
            .backend
            .forward(&head.method, &route.upstream_path, &head.headers, body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %route.upstream_path, error = %e, "Backend call failed");
                let _ = conn.write_response(502, &[], e.to_string().as_bytes()).await;
                return 502;
            }
        };

        let chain = FilterChain::new(snapshot, InvokePoint::Response, self.state.metrics.clone());

        match chain.run(scope, response.body.clone()) {
            Ok(ChainVerdict::Proceed { body }) => {
                let _ = conn
                    .write_response(response.status, &response.headers, &body)
                    .await;
                response.status
            }
            Ok(ChainVerdict::Halt { status, body }) => {
                let _ = conn.write_response(status, &[], &body).await;
                status
            }
            Err(e) => {
                let status = e.response_status();
                let _ = conn
                    .write_response(status, &[], e.response_body().as_bytes())
                    .await;
                status
            }
        }
    }
}

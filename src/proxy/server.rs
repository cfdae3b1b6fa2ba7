//! Authenticating reverse proxy in front of the desktop services.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::auth::Credentials;
use super::route::{RouteDecision, RouteTable};
use crate::config::ProxyConfig;
use crate::error::RouteError;

/// Headers that describe a single connection and are never forwarded as-is.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

struct Gateway {
    routes: RouteTable,
    credentials: Credentials,
    upstream_host: String,
    client: reqwest::Client,
}

/// Single-port gateway that routes HTTP and WebSocket traffic to upstreams.
pub struct GatewayServer {
    listen_port: u16,
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("Failed to build upstream HTTP client")?;

        let gateway = Gateway {
            routes: RouteTable::new(config),
            credentials: Credentials::new(&config.username, &config.password),
            upstream_host: config.upstream_host.clone(),
            client,
        };

        Ok(Self {
            listen_port: config.listen_port,
            gateway: Arc::new(gateway),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&self.gateway))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured port on all interfaces and serve until `shutdown`.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind gateway on {addr}"))?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gateway = &self.gateway;
        info!(
            "Gateway listening on {} (subfolder: {}, auth: {})",
            listener.local_addr()?,
            gateway.routes.subfolder().unwrap_or("/"),
            if gateway.credentials.is_enabled() { "basic" } else { "disabled" }
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Gateway server failed")?;

        info!("Gateway stopped");
        Ok(())
    }
}

async fn handle(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let decision = match gateway.routes.decide(req.uri().path()) {
        Ok(decision) => decision,
        Err(e) => {
            debug!("Refusing {}: {}", req.uri().path(), e);
            return route_error(e);
        }
    };

    if !decision.bypass_auth {
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !gateway.credentials.allows(header) {
            debug!("Unauthorized request for {}", decision.path);
            return unauthorized();
        }
    }

    if is_upgrade(req.headers()) {
        gateway.relay_upgrade(req, decision).await
    } else {
        gateway.forward(req, decision).await
    }
}

impl Gateway {
    fn authority(&self, port: u16) -> String {
        format!("{}:{}", self.upstream_host, port)
    }

    /// Forward a plain HTTP request, streaming both bodies.
    async fn forward(&self, req: Request, decision: RouteDecision) -> Response {
        let authority = self.authority(decision.port);
        let (parts, body) = req.into_parts();
        let url = format!(
            "http://{}{}",
            authority,
            path_and_query(&decision.path, &parts.uri)
        );

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        set_host(&mut headers, &authority);

        let mut upstream = self
            .client
            .request(parts.method, url)
            .headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let resp = match upstream.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Upstream {} failed: {}", authority, e);
                return bad_gateway(&authority);
            }
        };

        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Relay a WebSocket (or any HTTP/1.1 upgrade) handshake, then splice
    /// the two upgraded connections together.
    async fn relay_upgrade(&self, mut req: Request, decision: RouteDecision) -> Response {
        let authority = self.authority(decision.port);

        let stream = match TcpStream::connect(&authority).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Upstream {} unreachable for upgrade: {}", authority, e);
                return bad_gateway(&authority);
            }
        };
        let (mut sender, conn) =
            match hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream)).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Handshake with {} failed: {}", authority, e);
                    return bad_gateway(&authority);
                }
            };
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream upgrade connection ended: {}", e);
            }
        });

        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut upstream_req = axum::http::Request::new(Body::empty());
        *upstream_req.method_mut() = req.method().clone();
        *upstream_req.headers_mut() = req.headers().clone();
        set_host(upstream_req.headers_mut(), &authority);
        *upstream_req.uri_mut() = match path_and_query(&decision.path, req.uri()).parse() {
            Ok(uri) => uri,
            Err(e) => {
                debug!("Invalid upstream URI: {}", e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        let mut upstream_resp = match sender.send_request(upstream_req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Upgrade request to {} failed: {}", authority, e);
                return bad_gateway(&authority);
            }
        };

        if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(
                "Upstream {} declined upgrade with {}",
                authority,
                upstream_resp.status()
            );
            return upstream_resp.map(Body::new);
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        for (name, value) in upstream_resp.headers() {
            if name != header::CONNECTION {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));

        let path = decision.path;
        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Upgrade for {} failed: {}", path, e);
                    return;
                }
            };

            splice(TokioIo::new(client), TokioIo::new(upstream), &path).await;
        });

        response
    }
}

/// Pump bytes both ways until either side ends, then shut both down so the
/// peer of a vanished connection is not left hanging.
async fn splice<C, U>(client: C, upstream: U, path: &str)
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    tokio::select! {
        result = tokio::io::copy(&mut client_rx, &mut upstream_tx) => match result {
            Ok(sent) => debug!("Relay {} closed by client ({} bytes up)", path, sent),
            Err(e) => debug!("Relay {} aborted on the client side: {}", path, e),
        },
        result = tokio::io::copy(&mut upstream_rx, &mut client_tx) => match result {
            Ok(received) => debug!("Relay {} closed by upstream ({} bytes down)", path, received),
            Err(e) => debug!("Relay {} aborted on the upstream side: {}", path, e),
        },
    }

    let _ = client_tx.shutdown().await;
    let _ = upstream_tx.shutdown().await;
}

fn path_and_query(path: &str, original: &Uri) -> String {
    match original.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

fn set_host(headers: &mut HeaderMap, authority: &str) {
    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(header::HOST, value);
    }
}

/// `Connection: upgrade` together with an `Upgrade` header.
fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(listed.iter()) {
        headers.remove(name);
    }
}

fn route_error(error: RouteError) -> Response {
    match error {
        RouteError::OutsideSubfolder(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
        RouteError::Traversal => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Basic realm="Restricted""#)],
        "Unauthorized",
    )
        .into_response()
}

fn bad_gateway(upstream: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": "bad gateway",
            "upstream": upstream,
        })),
    )
        .into_response()
}

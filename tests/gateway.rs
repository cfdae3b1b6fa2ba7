use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::Request;
use axum::http::header::{AUTHORIZATION, HOST, LOCATION, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::{self, Message};

use supervisor::{GatewayServer, ProxyConfig};

async fn echo(label: &'static str, req: Request) -> Response {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_default();
    if path == "/redirect" {
        return (StatusCode::FOUND, [(LOCATION, "/elsewhere")]).into_response();
    }

    let method = req.method().clone();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = axum::body::to_bytes(req.into_body(), 1 << 20).await.unwrap();
    format!(
        "{label} {method} {path} host={host} body={}",
        String::from_utf8_lossy(&body)
    )
    .into_response()
}

async fn spawn_upstream(label: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new().fallback(move |req: Request| echo(label, req));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    port
}

/// WebSocket echo server that records the request target of each handshake.
async fn spawn_ws_upstream() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let targets = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let targets = Arc::clone(&targets);
            tokio::spawn(async move {
                let record = move |req: &WsRequest, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    targets.lock().unwrap().push(req.uri().to_string());
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, record).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    } else if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    (port, seen)
}

/// WebSocket server that echoes one message and then drops the connection
/// without a close frame.
async fn spawn_ws_dropping_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                if let Some(Ok(msg)) = ws.next().await {
                    let _ = ws.send(msg).await;
                }
                drop(ws);
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_gateway(config: ProxyConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(&config).unwrap();
    tokio::spawn(async move {
        server
            .serve(listener, std::future::pending())
            .await
            .unwrap()
    });
    addr
}

fn config(web_port: u16, stream_port: u16, password: &str) -> ProxyConfig {
    ProxyConfig {
        web_port,
        stream_port,
        subfolder: "/desk/".into(),
        password: password.into(),
        ..ProxyConfig::default()
    }
}

fn basic(raw: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Send a request line verbatim; URL parsers would normalize `..` away.
async fn raw_status(addr: SocketAddr, target: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {target} HTTP/1.1\r\nHost: gateway\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut status = String::new();
    BufReader::new(stream).read_line(&mut status).await.unwrap();
    status
}

#[tokio::test]
async fn protected_paths_require_basic_auth() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "secret")).await;
    let url = format!("http://{gw}/desk/ui");

    let resp = client().get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get(WWW_AUTHENTICATE).unwrap(),
        r#"Basic realm="Restricted""#
    );

    let resp = client()
        .get(&url)
        .header(AUTHORIZATION, basic("kasm_user:wrongpass"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client()
        .get(&url)
        .header(AUTHORIZATION, basic("kasm_user:secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("web GET /ui "), "{body}");
    assert!(body.contains(&format!("host=127.0.0.1:{web}")), "{body}");
}

#[tokio::test]
async fn data_prefix_bypasses_auth_and_hits_stream_upstream() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "secret")).await;

    let resp = client()
        .get(format!("http://{gw}/desk/data/x?token=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("stream GET /data/x?token=1 "), "{body}");
}

#[tokio::test]
async fn subfolder_root_maps_to_upstream_root() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "")).await;

    for path in ["/desk", "/desk/"] {
        let body = client()
            .get(format!("http://{gw}{path}"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.starts_with("web GET / "), "{path}: {body}");
    }
}

#[tokio::test]
async fn scope_violations_are_refused() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "")).await;

    let resp = client()
        .get(format!("http://{gw}/elsewhere"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let status = raw_status(gw, "/desk/../etc/passwd").await;
    assert!(status.starts_with("HTTP/1.1 403"), "{status}");
}

#[tokio::test]
async fn request_body_is_streamed_upstream() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "")).await;

    let body = client()
        .post(format!("http://{gw}/desk/api/upload"))
        .body("frame-bytes")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("web POST /api/upload "), "{body}");
    assert!(body.ends_with("body=frame-bytes"), "{body}");
}

#[tokio::test]
async fn upstream_redirects_are_relayed() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "")).await;

    let resp = client()
        .get(format!("http://{gw}/desk/redirect"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers().get(LOCATION).unwrap(), "/elsewhere");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let web = spawn_upstream("web").await;
    let gw = spawn_gateway(config(web, closed_port().await, "")).await;

    let resp = client()
        .get(format!("http://{gw}/desk/data/frame"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bad gateway");
}

#[tokio::test]
async fn websocket_is_relayed_without_auth() {
    let (web, targets) = spawn_ws_upstream().await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "secret")).await;

    let (mut ws, resp) =
        tokio_tungstenite::connect_async(format!("ws://{gw}/desk/websockify?token=abc"))
            .await
            .unwrap();
    assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(
        resp.headers().get_all("connection").iter().count(),
        1,
        "connection header must not be duplicated"
    );

    ws.send(Message::text("hello")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "hello");

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_data().as_ref(), &[1u8, 2, 3]);

    ws.close(None).await.unwrap();
    assert_eq!(
        targets.lock().unwrap().as_slice(),
        ["/websockify?token=abc".to_string()]
    );
}

#[tokio::test]
async fn websocket_on_protected_path_needs_auth() {
    let (web, targets) = spawn_ws_upstream().await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "secret")).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{gw}/desk/ws"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
        other => panic!("unexpected error: {other}"),
    }
    assert!(targets.lock().unwrap().is_empty());
}

#[tokio::test]
async fn websocket_to_plain_http_upstream_is_relayed_verbatim() {
    let web = spawn_upstream("web").await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "")).await;

    // The echo upstream answers 200 instead of switching protocols.
    let err = tokio_tungstenite::connect_async(format!("ws://{gw}/desk/websockify"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), StatusCode::OK),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn websocket_client_sees_end_when_upstream_drops() {
    let web = spawn_ws_dropping_upstream().await;
    let stream = spawn_upstream("stream").await;
    let gw = spawn_gateway(config(web, stream, "")).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{gw}/desk/websockify"))
        .await
        .unwrap();
    ws.send(Message::text("last words")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "last words");

    let next = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
        .await
        .expect("relay kept the client open after the upstream went away");
    match next {
        None | Some(Err(_)) => {}
        Some(Ok(msg)) => assert!(msg.is_close(), "unexpected message: {msg:?}"),
    }
}

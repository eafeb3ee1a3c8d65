//! End-to-end tests: a real proxy listener in front of a scripted fake
//! engine, exercised by a plain TCP client.

use bridle::config::Config;
use bridle::server::ProxyServer;
use bridle::state::AppState;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const UPGRADE_BANNER: &[u8] = b"HTTP/1.1 101 UPGRADED\r\nContent-Type: application/vnd.docker.raw-stream\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n";
const OK_BANNER: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\n";

async fn read_engine_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// Fake engine for one interactive session: answers the exec-start upgrade,
/// echoes one chunk of stdin prefixed with `seen:`, then hangs up.
async fn interactive_engine(listener: TcpListener) -> (String, Vec<u8>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let (head, body) = read_engine_request(&mut stream).await;

    stream
        .write_all(b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n")
        .await
        .unwrap();

    let mut stdin = [0u8; 5];
    stream.read_exact(&mut stdin).await.unwrap();
    stream.write_all(b"seen:").await.unwrap();
    stream.write_all(&stdin).await.unwrap();

    (head, body)
}

async fn start_proxy(backend_addr: SocketAddr, plugin_dir: &Path) -> SocketAddr {
    let mut config = Config::default();
    config.plugins.dir = plugin_dir.to_path_buf();
    config.backend.host = backend_addr.ip().to_string();
    config.backend.port = backend_addr.port();

    let state = AppState::new(config);
    state.registry.load();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(state);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

#[tokio::test]
async fn exec_start_with_upgrade_gets_the_101_banner_and_a_live_stream() {
    let engine_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = engine_listener.local_addr().unwrap();
    let engine = tokio::spawn(interactive_engine(engine_listener));

    let plugin_dir = tempfile::TempDir::new().unwrap();
    let proxy_addr = start_proxy(engine_addr, plugin_dir.path()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST /v1.40/exec/deadbeef/start HTTP/1.1\r\n\
              Host: localhost\r\n\
              Connection: Upgrade\r\n\
              Upgrade: tcp\r\n\
              Content-Type: application/json\r\n\
              Content-Length: 2\r\n\r\n{}",
        )
        .await
        .unwrap();

    // The negotiation line must be byte-for-byte exact.
    let mut banner = vec![0u8; UPGRADE_BANNER.len()];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(banner, UPGRADE_BANNER);

    client.write_all(b"stdin").await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"seen:stdin");

    let (head, body) = engine.await.unwrap();
    assert!(head.starts_with("POST /v1.40/exec/deadbeef/start HTTP/1.1"));
    assert_eq!(body, b"{}");
}

#[tokio::test]
async fn attach_without_upgrade_gets_the_200_banner() {
    let engine_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = engine_listener.local_addr().unwrap();
    let engine = tokio::spawn(interactive_engine(engine_listener));

    let plugin_dir = tempfile::TempDir::new().unwrap();
    let proxy_addr = start_proxy(engine_addr, plugin_dir.path()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST /v1.40/containers/web/attach?stream=1&stdin=1 HTTP/1.1\r\n\
              Host: localhost\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut banner = vec![0u8; OK_BANNER.len()];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(banner, OK_BANNER);

    client.write_all(b"stdin").await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"seen:stdin");

    engine.await.unwrap();
}

#[tokio::test]
async fn request_filters_rewrite_the_body_the_engine_sees() {
    let engine_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = engine_listener.local_addr().unwrap();
    let engine = tokio::spawn(interactive_engine(engine_listener));

    let plugin_dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        plugin_dir.path().join("tag.rhai"),
        r#"
fn filter_config() {
    #{ name: "tag", order: 1, path_pattern: "^/v[0-9.]+/exec/.*/start$", invoke: "request" }
}

fn filter_exec(ctx, body) {
    #{ next: true, body: `{"Detach":false,"Tty":true}` }
}
"#,
    )
    .unwrap();
    let proxy_addr = start_proxy(engine_addr, plugin_dir.path()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST /v1.40/exec/deadbeef/start HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: tcp\r\n\
              Content-Length: 2\r\n\r\n{}",
        )
        .await
        .unwrap();

    let mut banner = vec![0u8; UPGRADE_BANNER.len()];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(banner, UPGRADE_BANNER);

    client.write_all(b"stdin").await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"seen:stdin");

    let (_, body) = engine.await.unwrap();
    assert_eq!(body, br#"{"Detach":false,"Tty":true}"#);
}

#[tokio::test]
async fn halting_filter_denies_an_interactive_request() {
    let plugin_dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        plugin_dir.path().join("deny.rhai"),
        r#"
fn filter_config() {
    #{ name: "deny", order: 1, path_pattern: "^/v[0-9.]+/exec/.*/start$", invoke: "request" }
}

fn filter_exec(ctx, body) {
    #{ next: false, status: 403, body: "exec denied" }
}
"#,
    )
    .unwrap();

    // No engine at all: the halt must answer before any backend contact.
    let proxy_addr = start_proxy("127.0.0.1:1".parse().unwrap(), plugin_dir.path()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST /v1.40/exec/deadbeef/start HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: tcp\r\n\
              Content-Length: 2\r\n\r\n{}",
        )
        .await
        .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(text.ends_with("exec denied"));
}

#[tokio::test]
async fn token_prefix_is_stripped_before_the_engine() {
    let engine_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = engine_listener.local_addr().unwrap();
    let engine = tokio::spawn(interactive_engine(engine_listener));

    let plugin_dir = tempfile::TempDir::new().unwrap();
    let proxy_addr = start_proxy(engine_addr, plugin_dir.path()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST /token/s3cret/v1.40/exec/deadbeef/start HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: tcp\r\n\
              Content-Length: 2\r\n\r\n{}",
        )
        .await
        .unwrap();

    let mut banner = vec![0u8; UPGRADE_BANNER.len()];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(banner, UPGRADE_BANNER);

    client.write_all(b"stdin").await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();

    let (head, _) = engine.await.unwrap();
    assert!(head.starts_with("POST /v1.40/exec/deadbeef/start HTTP/1.1"));
}

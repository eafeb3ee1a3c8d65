//! Client plumbing toward the engine's management API.
//!
//! Unary calls are plain HTTP/1.1 request/response exchanges. Interactive
//! calls (exec-start, attach) negotiate `Upgrade: tcp` with the engine and
//! hand back the upgraded duplex stream for the session to own.

use crate::config::BackendConfig;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Raw duplex stream to the engine's attach endpoint, exclusively owned by
/// the stream session once returned. Dropping it is the close handle.
pub type BackendStream = TokioIo<hyper::upgrade::Upgraded>;

/// Buffered response from a unary backend call.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub struct EngineClient {
    addr: String,
}

impl EngineClient {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            addr: config.addr(),
        }
    }

    pub fn from_addr(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn connect(&self) -> Result<TcpStream> {
        TcpStream::connect(&self.addr).await.map_err(|e| {
            ProxyError::BackendUnavailable(format!("connect {}: {e}", self.addr))
        })
    }

    /// Start an interactive session against the engine: POST the body to
    /// the exec-start/attach path with an `Upgrade: tcp` handshake and
    /// return the upgraded duplex stream. Any failure here is an ordinary
    /// error response upstream; no client hijack has happened yet.
    pub async fn attach(&self, path: &str, body: Bytes) -> Result<BackendStream> {
        let stream = self.connect().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("handshake: {e}")))?;

        // The connection task must keep running to drive the upgrade.
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Backend connection ended");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, &self.addr)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| ProxyError::BackendUnavailable(format!("build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("exec-start: {e}")))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            warn!(status = %response.status(), path, "Engine refused stream upgrade");
            return Err(ProxyError::BackendUnavailable(format!(
                "engine answered {} instead of upgrading",
                response.status()
            )));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("upgrade: {e}")))?;

        Ok(TokioIo::new(upgraded))
    }

    /// Forward a unary request and buffer the whole response.
    pub async fn forward(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<ForwardedResponse> {
        let stream = self.connect().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Backend connection ended");
            }
        });

        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::Http(format!("bad method: {e}")))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, &self.addr);
        for (name, value) in headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let request = builder
            .body(Full::new(body))
            .map_err(|e| ProxyError::BackendUnavailable(format!("build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("dispatch: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("read response: {e}")))?
            .to_bytes();

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "upgrade"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "content-length"
            | "host"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        head
    }

    #[tokio::test]
    async fn attach_upgrades_and_yields_a_duplex_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            let head = String::from_utf8(head).unwrap();
            assert!(head.starts_with("POST /v1.40/exec/deadbeef/start HTTP/1.1"));
            assert!(head.to_ascii_lowercase().contains("upgrade: tcp"));
            // Engine-side exec-start body is `{}` (2 bytes).
            let mut body = [0u8; 2];
            stream.read_exact(&mut body).await.unwrap();

            stream
                .write_all(b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n")
                .await
                .unwrap();

            // Raw stream now; echo one chunk back prefixed.
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"stdin");
            stream.write_all(b"stdout").await.unwrap();
        });

        let client = EngineClient::from_addr(addr.to_string());
        let mut backend = client
            .attach("/v1.40/exec/deadbeef/start", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        backend.write_all(b"stdin").await.unwrap();
        let mut out = [0u8; 6];
        backend.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"stdout");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn attach_failure_is_backend_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_head(&mut stream).await;
            let mut body = [0u8; 2];
            stream.read_exact(&mut body).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let client = EngineClient::from_addr(addr.to_string());
        let err = client
            .attach("/v1.40/exec/missing/start", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable(_)));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn forward_buffers_a_unary_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"ok\":true}\r\n",
                )
                .await
                .unwrap();
        });

        let client = EngineClient::from_addr(addr.to_string());
        let response = client
            .forward("GET", "/v1.40/containers/abc/stats", &[], Bytes::new())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), b"{\"ok\":true}\r\n");
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "content-type" && v == "application/json"));

        server.await.unwrap();
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }
}

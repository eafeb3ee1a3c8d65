//! Minimal HTTP/1.1 handling for the data-plane listener.
//!
//! The proxy owns its client sockets directly so an interactive request can
//! hijack the connection and write the engine's raw-stream negotiation lines
//! byte for byte. This module reads one request head, buffers the body, and
//! hands the socket over (with any over-read bytes) when a session starts.

use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the request head; anything larger is rejected.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a buffered request body. Exec/attach control bodies are
/// tiny; anything bigger than this is not a request we should hold in
/// memory.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Parsed request line and headers of one inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup, first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// One inbound client connection. Reads exactly one request, then either
/// answers it or gives the socket up to a stream session via [`hijack`].
///
/// [`hijack`]: ClientConn::hijack
pub struct ClientConn<S> {
    stream: Option<S>,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream
            .as_mut()
            .ok_or_else(|| ProxyError::HijackUnsupported("connection already hijacked".into()))
    }

    /// Read and parse the request head, leaving any over-read body bytes
    /// buffered for [`read_body`] or [`hijack`].
    ///
    /// [`read_body`]: ClientConn::read_body
    /// [`hijack`]: ClientConn::hijack
    pub async fn read_request_head(&mut self) -> Result<RequestHead> {
        // Borrow the socket directly so the buffer stays independently
        // borrowable inside the loop.
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProxyError::HijackUnsupported("connection already hijacked".into()))?;

        let head_end = loop {
            if let Some(pos) = find_head_end(&self.buf) {
                break pos;
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Http("request head too large".into()));
            }
            let n = stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ProxyError::Http("connection closed mid-head".into()));
            }
        };

        let head = self.buf.split_to(head_end + 4);
        parse_head(&head[..head_end])
    }

    /// Read exactly `len` body bytes, consuming anything already buffered.
    pub async fn read_body(&mut self, len: usize) -> Result<Bytes> {
        if len > MAX_BODY_BYTES {
            return Err(ProxyError::Http(format!(
                "request body too large ({len} bytes)"
            )));
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProxyError::HijackUnsupported("connection already hijacked".into()))?;

        while self.buf.len() < len {
            let n = stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ProxyError::Http("connection closed mid-body".into()));
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Write a complete response. The proxy handles one request per
    /// connection, so every response carries `Connection: close`.
    pub async fn write_response(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()> {
        let mut out = Vec::with_capacity(256 + body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes(),
        );
        for (name, value) in headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(body);

        let stream = self.stream()?;
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Take the raw socket for a stream session, together with any bytes
    /// read past the request body. Fails if the socket is already gone.
    pub fn hijack(&mut self) -> Result<(S, Bytes)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| ProxyError::HijackUnsupported("connection already hijacked".into()))?;
        Ok((stream, self.buf.split().freeze()))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProxyError::Http("request head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::Http("empty request".into()))?;
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::Http("missing method".into()))?;
    let path = parts
        .next()
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| ProxyError::Http(format!("bad request line: {request_line}")))?;
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/1."))
        .ok_or_else(|| ProxyError::Http(format!("bad request line: {request_line}")))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Http(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers,
    })
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

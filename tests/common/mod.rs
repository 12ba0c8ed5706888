#![allow(dead_code)]

use serde_json::Value;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wsgilite::server::{bind_exclusive, ServerHandle};
use wsgilite::App;

/// A parsed HTTP/1.1 response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|err| panic!("body is not JSON ({err}): {:?}", self.body))
    }
}

pub fn parse_response(raw: &[u8]) -> HttpResponse {
    let raw = String::from_utf8_lossy(raw);
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((&raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();
    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

fn request_text(method: &str, path: &str, content_type: Option<&str>, body: &[u8]) -> Vec<u8> {
    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if !body.is_empty() || method == "POST" {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Send a raw request and read until the server closes the connection.
pub async fn send(addr: SocketAddr, raw: &[u8]) -> HttpResponse {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();
    parse_response(&buf)
}

pub async fn get(addr: SocketAddr, path: &str) -> HttpResponse {
    send(addr, &request_text("GET", path, None, b"")).await
}

pub async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> HttpResponse {
    send(addr, &request_text(method, path, content_type, body)).await
}

pub async fn post(addr: SocketAddr, path: &str, content_type: &str, body: &str) -> HttpResponse {
    request(addr, "POST", path, Some(content_type), body.as_bytes()).await
}

/// Serve `app` on an ephemeral local port in the current runtime.
pub async fn start(app: &App) -> ServerHandle {
    let listener = bind_exclusive("127.0.0.1:0".parse().unwrap()).unwrap();
    let handle = ServerHandle::spawn(listener, std::sync::Arc::clone(app.dispatcher())).unwrap();
    handle.wait_ready().await.unwrap();
    handle
}

/// Blocking GET for servers running in another process.
pub fn blocking_get(addr: SocketAddr, path: &str) -> std::io::Result<HttpResponse> {
    let mut stream = std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(2))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(&request_text("GET", path, None, b""))?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(parse_response(&buf))
}

/// Poll `path` until the server answers or `attempts` run out.
pub fn wait_for_server(addr: SocketAddr, path: &str, attempts: usize) -> Option<HttpResponse> {
    for _ in 0..attempts {
        if let Ok(response) = blocking_get(addr, path) {
            if response.status != 0 {
                return Some(response);
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    None
}

/// A free local port, released before returning.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

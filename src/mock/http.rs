//! Scripted HTTP server for driving the repository clients over the wire
//!
//! Binds an ephemeral loopback port and answers each request with whatever
//! the handler returns. One request per connection; every response closes
//! the connection. Requests are recorded in arrival order.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

/// Per-connection read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A request as the server received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path and query, as sent on the request line
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// `http://127.0.0.1:<port>` of the server that received it
    pub base_url: String,
}

impl HttpRequest {
    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Query parameter value; a bare `?key` yields `Some("")`.
    pub fn query(&self, key: &str) -> Option<&str> {
        let (_, query) = self.target.split_once('?')?;
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if pair == key => Some(""),
            _ => None,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Absolute URL on the same server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Response returned by a handler
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(body.to_string().into_bytes())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn write_to(&self, stream: &mut TcpStream) -> io::Result<()> {
        let reason = StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.status,
            reason,
            self.body.len()
        );
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes())?;
        stream.write_all(&self.body)?;
        stream.flush()
    }
}

/// Running server; stops when dropped.
pub struct HttpStub {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpStub {
    pub fn start<F>(handler: F) -> io::Result<Self>
    where
        F: FnMut(&HttpRequest) -> HttpResponse + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let shutdown = shutdown.clone();
            let requests = requests.clone();
            let base_url = format!("http://{}", addr);
            let mut handler = handler;
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(mut stream) = stream else {
                        continue;
                    };
                    let request = match read_request(&mut stream, &base_url) {
                        Ok(request) => request,
                        Err(e) => {
                            debug!(error = %e, "dropping unreadable request");
                            continue;
                        }
                    };
                    let response = handler(&request);
                    debug!(
                        method = %request.method,
                        target = %request.target,
                        status = response.status,
                        "stub request"
                    );
                    lock(&requests).push(request);
                    if let Err(e) = response.write_to(&mut stream) {
                        debug!(error = %e, "failed to write stub response");
                    }
                }
            })
        };

        Ok(Self {
            addr,
            shutdown,
            requests,
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    /// Requests with this method whose path starts with `path_prefix`.
    pub fn count(&self, method: &str, path_prefix: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method == method && r.path().starts_with(path_prefix))
            .count()
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_request(stream: &mut TcpStream, base_url: &str) -> io::Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed request line"));
    };
    let (method, target) = (method.to_string(), target.to_string());

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body)?;

    Ok(HttpRequest {
        method,
        target,
        headers,
        body,
        base_url: base_url.to_string(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accessors() {
        let request = HttpRequest {
            method: "PUT".to_string(),
            target: "/files/abc/model.tar?uploadId=7&partNumber=2&uploads".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: br#"{"a":1}"#.to_vec(),
            base_url: "http://127.0.0.1:9".to_string(),
        };
        assert_eq!(request.path(), "/files/abc/model.tar");
        assert_eq!(request.query("uploadId"), Some("7"));
        assert_eq!(request.query("partNumber"), Some("2"));
        assert_eq!(request.query("uploads"), Some(""));
        assert_eq!(request.query("size"), None);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.json(), Some(json!({"a": 1})));
        assert_eq!(request.url("/x"), "http://127.0.0.1:9/x");
    }

    #[test]
    fn test_serves_and_records_requests() {
        let stub = HttpStub::start(|request| {
            HttpResponse::json(201, &json!({ "echo": request.body.len() }))
        })
        .unwrap();

        let client = reqwest::blocking::Client::new();
        let response = client
            .post(format!("{}/things?x=1", stub.url()))
            .body(vec![1u8; 10])
            .send()
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().unwrap();
        assert_eq!(body["echo"], 10);

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path(), "/things");
        assert_eq!(stub.count("POST", "/things"), 1);
    }
}

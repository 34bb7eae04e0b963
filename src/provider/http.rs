//! HTTP client and server capabilities supplied by the host.

use std::rc::Rc;

use thiserror::Error;

/// Transport-level failure reported by the host HTTP stack.
#[derive(Debug, Error, Clone)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outbound HTTP request handed to the host client.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.headers.push((
            "Content-Type".to_string(),
            "application/json; charset=utf-8".to_string(),
        ));
        self.body = Some(value.to_string().into_bytes());
        self
    }

    pub fn form_body(mut self, pairs: &[(&str, &str)]) -> Self {
        let encoded = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", form_escape(k), form_escape(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.headers.push((
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ));
        self.body = Some(encoded.into_bytes());
        self
    }
}

// Minimal escaping for OAuth form fields; tokens and ids are URL-safe
// apart from these characters.
fn form_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Response surfaced back from the host client.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

pub type ResponseCallback = Box<dyn FnOnce(Result<Response, TransportError>)>;

/// Host HTTP client. The callback is posted on the task runner; it never
/// fires re-entrantly from inside `send_request` in production hosts
/// (test doubles may complete synchronously).
pub trait HttpClient {
    fn send_request(&self, request: Request, done: ResponseCallback);
}

/// Inbound request delivered by the host HTTP server.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub path: String,
    pub auth_header: String,
    pub body: Vec<u8>,
}

/// Reply handed back to the host HTTP server.
#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

pub type RequestHandler = Rc<dyn Fn(ServerRequest) -> ServerResponse>;

/// Host HTTP(S) server for the local surface.
pub trait HttpServer {
    fn http_port(&self) -> u16;
    fn https_port(&self) -> u16;
    fn https_certificate_fingerprint(&self) -> Vec<u8>;
    fn add_request_handler(&self, path_prefix: &str, handler: RequestHandler);
    fn add_on_state_changed(&self, callback: Rc<dyn Fn()>);
}

//! The request surface driving `Connection::send_request`. Building,
//! retries, and middleware are out of scope — this is just enough to
//! describe one HTTP/2 request.

use crate::headers::HeaderList;
use bytes::Bytes;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

/// One HTTP/2 request. `scheme`/`host`/`port`/`path` mirror the URI parts
/// §6 asks for rather than carrying a parsed `Url`, since the engine only
/// ever needs them to build the `:scheme`/`:authority`/`:path`
/// pseudo-headers.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub is_ipv6: bool,
    pub path: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, scheme: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme: scheme.into(),
            host: host.into(),
            port: None,
            is_ipv6: false,
            path: path.into(),
            headers: HeaderList::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Get, "https", host, path)
    }

    #[must_use]
    pub fn post(host: impl Into<String>, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut req = Self::new(Method::Post, "https", host, path);
        req.body = body.into();
        req
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    /// The `:authority` pseudo-header value: host, bracketed if IPv6,
    /// suffixed with the port when it is not the scheme's default.
    #[must_use]
    pub fn authority(&self) -> String {
        let host = if self.is_ipv6 { format!("[{}]", self.host) } else { self.host.clone() };
        match self.port {
            Some(port) if !is_default_port(&self.scheme, port) => format!("{host}:{port}"),
            _ => host,
        }
    }
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    matches!((scheme, port), ("http", 80) | ("https", 443))
}

/// Per-request timing, handed alongside a `Request` to `send_request`.
#[derive(Debug)]
pub struct RequestContext {
    started_at: Instant,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self { started_at: Instant::now() }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

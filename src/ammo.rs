//! Units of work consumed by guns

use crate::scenario::Scenario;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// One unit of work
///
/// The pool never looks inside; only the gun matching the payload kind does.
#[derive(Debug, Clone, Default)]
pub struct Ammo {
    /// Assigned by the provider on acquire, starting at 1
    pub id: u64,
    pub tag: String,
    /// Decode error message when the provider was told to continue on errors
    pub invalid: Option<String>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default)]
pub enum Payload {
    Http(HttpRequestSpec),
    Scenario(Arc<Scenario>),
    #[default]
    Empty,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Http(_) => "http",
            Payload::Scenario(_) => "scenario",
            Payload::Empty => "empty",
        }
    }
}

impl Ammo {
    pub fn http(req: HttpRequestSpec, tag: impl Into<String>) -> Self {
        Self {
            id: 0,
            tag: tag.into(),
            invalid: None,
            payload: Payload::Http(req),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            invalid: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_none()
    }

    /// Clear everything so the value can be reused for the next record
    pub fn reset(&mut self) {
        self.id = 0;
        self.tag.clear();
        self.invalid = None;
        self.payload = Payload::Empty;
    }
}

/// Prebuilt HTTP request, independent of any client library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestSpec {
    pub method: String,
    /// Path and query, e.g. `/search?q=1`
    pub uri: String,
    /// Host header value; falls back to the gun target when absent
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Default for HttpRequestSpec {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            uri: "/".to_string(),
            host: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }
}

impl HttpRequestSpec {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Set a header, replacing any existing value with the same name
    ///
    /// `Host` is stored in [`HttpRequestSpec::host`] and never duplicated
    /// among the headers.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("host") {
            self.host = Some(value.to_string());
            return;
        }
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        if name.eq_ignore_ascii_case("host") {
            return self.host.as_deref();
        }
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Apply defaults for headers the request does not set itself
    pub fn apply_default_headers(&mut self, defaults: &[(String, String)]) {
        for (name, value) in defaults {
            if self.header(name).is_none() {
                self.set_header(name, value);
            }
        }
    }

    /// Approximate bytes on the wire for the request line, headers and body
    pub fn wire_size(&self) -> u64 {
        let mut size = self.method.len() + 1 + self.uri.len() + " HTTP/1.1\r\n".len();
        if let Some(ref host) = self.host {
            size += "Host: ".len() + host.len() + 2;
        }
        for (n, v) in &self.headers {
            size += n.len() + 2 + v.len() + 2;
        }
        size += 2 + self.body.len();
        size as u64
    }
}

impl fmt::Display for HttpRequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.uri)?;
        if let Some(ref host) = self.host {
            write!(f, " (host {})", host)?;
        }
        Ok(())
    }
}

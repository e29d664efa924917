//! `jsonline` ammo: one JSON request per line
//!
//! ```text
//! {"host": "example.com", "method": "POST", "uri": "/a", "headers": {"X": "1"}, "tag": "a", "body": "{}"}
//! ```

use super::{split_absolute_uri, Reader, RecordDecoder};
use crate::ammo::{Ammo, HttpRequestSpec, Payload};
use crate::error::AmmoDecodeError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::io::AsyncBufReadExt;

#[derive(Debug, Deserialize)]
struct JsonRequest {
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    uri: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct JsonLineDecoder {
    reader: Reader,
    name: String,
    line_no: usize,
    line: String,
}

impl JsonLineDecoder {
    pub fn new(reader: Reader, name: String) -> Self {
        Self {
            reader,
            name,
            line_no: 0,
            line: String::new(),
        }
    }

    fn location(&self) -> String {
        format!("{}:{}", self.name, self.line_no)
    }
}

#[async_trait]
impl RecordDecoder for JsonLineDecoder {
    async fn decode(&mut self, ammo: &mut Ammo) -> Option<Result<(), AmmoDecodeError>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line).await {
                Ok(0) => return None,
                Ok(_) => self.line_no += 1,
                Err(e) => return Some(Err(AmmoDecodeError::new(self.location(), e.to_string()))),
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }

            let parsed: JsonRequest = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                Err(e) => return Some(Err(AmmoDecodeError::new(self.location(), e.to_string()))),
            };

            let (uri_host, uri) = split_absolute_uri(&parsed.uri);
            let mut req = HttpRequestSpec {
                method: parsed.method.to_uppercase(),
                uri,
                host: uri_host,
                headers: Vec::new(),
                body: parsed.body.map(Bytes::from).unwrap_or_default(),
            };
            for (name, value) in &parsed.headers {
                req.set_header(name, value);
            }
            if parsed.host.is_some() {
                req.host = parsed.host;
            }
            ammo.tag = parsed.tag;
            ammo.payload = Payload::Http(req);
            return Some(Ok(()));
        }
    }
}

//! `uri` ammo: one request per line
//!
//! ```text
//! [Host: example.com]
//! [User-Agent: tank]
//! /index.html main
//! /search?q=1
//! ```
//!
//! Header lines apply to every following URI. The optional token after the
//! URI is the tag.

use super::{parse_header_line, split_absolute_uri, Reader, RecordDecoder};
use crate::ammo::{Ammo, HttpRequestSpec, Payload};
use crate::error::AmmoDecodeError;
use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;

pub struct UriDecoder {
    reader: Reader,
    name: String,
    line_no: usize,
    line: String,
    headers: Vec<(String, String)>,
}

impl UriDecoder {
    pub fn new(reader: Reader, name: String) -> Self {
        Self {
            reader,
            name,
            line_no: 0,
            line: String::new(),
            headers: Vec::new(),
        }
    }

    fn location(&self) -> String {
        format!("{}:{}", self.name, self.line_no)
    }
}

#[async_trait]
impl RecordDecoder for UriDecoder {
    async fn decode(&mut self, ammo: &mut Ammo) -> Option<Result<(), AmmoDecodeError>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line).await {
                Ok(0) => return None,
                Ok(_) => self.line_no += 1,
                Err(e) => {
                    return Some(Err(AmmoDecodeError::new(self.location(), e.to_string())));
                }
            }

            let line = self.line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                match parse_header_line(line) {
                    Ok((name, value)) => {
                        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
                        self.headers.push((name, value));
                        continue;
                    }
                    Err(msg) => return Some(Err(AmmoDecodeError::new(self.location(), msg))),
                }
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let uri = parts.next().unwrap_or_default();
            let tag = parts.next().unwrap_or_default().trim();
            if !uri.starts_with('/') && !uri.starts_with("http://") && !uri.starts_with("https://") {
                return Some(Err(AmmoDecodeError::new(
                    self.location(),
                    format!("uri {:?} must be absolute or start with '/'", uri),
                )));
            }

            let (host, path) = split_absolute_uri(uri);
            let mut req = HttpRequestSpec::get(path);
            for (name, value) in &self.headers {
                req.set_header(name, value);
            }
            if host.is_some() {
                req.host = host;
            }
            ammo.tag = tag.to_string();
            ammo.payload = Payload::Http(req);
            return Some(Ok(()));
        }
    }
}

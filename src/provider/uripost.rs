//! `uripost` ammo: size-prefixed bodies
//!
//! ```text
//! [Content-Type: application/json]
//! 13 /api/items create
//! {"name":"a"}
//! ```
//!
//! Each record is a `<bytes> <uri> [tag]` line followed by exactly `bytes`
//! bytes of body. Header lines between records apply to all that follow.

use super::{parse_header_line, split_absolute_uri, Reader, RecordDecoder};
use crate::ammo::{Ammo, HttpRequestSpec, Payload};
use crate::error::AmmoDecodeError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

pub struct UriPostDecoder {
    reader: Reader,
    name: String,
    line_no: usize,
    line: String,
    headers: Vec<(String, String)>,
    broken: bool,
}

impl UriPostDecoder {
    pub fn new(reader: Reader, name: String) -> Self {
        Self {
            reader,
            name,
            line_no: 0,
            line: String::new(),
            headers: Vec::new(),
            broken: false,
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> Option<Result<(), AmmoDecodeError>> {
        self.broken = true;
        Some(Err(AmmoDecodeError::new(
            format!("{}:{}", self.name, self.line_no),
            message,
        )))
    }
}

/// Upfront allocation cap for a declared body size; larger bodies grow as read
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Read `size` body bytes following a record header
///
/// The declared size is never trusted for allocation: a prefix larger than
/// what is left in the file fails with `UnexpectedEof` once input runs out.
pub(crate) async fn read_body(reader: &mut Reader, size: usize) -> std::io::Result<Bytes> {
    let mut body = Vec::with_capacity(size.min(PREALLOC_LIMIT));
    (&mut *reader).take(size as u64).read_to_end(&mut body).await?;
    if body.len() < size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, file ends after {}", size, body.len()),
        ));
    }
    Ok(Bytes::from(body))
}

#[async_trait]
impl RecordDecoder for UriPostDecoder {
    async fn decode(&mut self, ammo: &mut Ammo) -> Option<Result<(), AmmoDecodeError>> {
        if self.broken {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line).await {
                Ok(0) => return None,
                Ok(_) => self.line_no += 1,
                Err(e) => return self.fail(e.to_string()),
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') {
                match parse_header_line(line) {
                    Ok((name, value)) => {
                        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
                        self.headers.push((name, value));
                        continue;
                    }
                    Err(msg) => return self.fail(msg),
                }
            }

            let mut parts = line.split_whitespace();
            let size = parts.next().unwrap_or_default();
            let Ok(size) = size.parse::<usize>() else {
                let msg = format!("invalid body size {:?}", size);
                return self.fail(msg);
            };
            let Some(uri) = parts.next().map(str::to_string) else {
                return self.fail("record header has no uri");
            };
            let tag = parts.collect::<Vec<_>>().join(" ");

            let body = match read_body(&mut self.reader, size).await {
                Ok(body) => body,
                Err(e) => return self.fail(format!("reading {} body bytes: {}", size, e)),
            };
            self.line_no += body.iter().filter(|&&b| b == b'\n').count();

            let (host, path) = split_absolute_uri(&uri);
            let mut req = HttpRequestSpec {
                method: "POST".to_string(),
                uri: path,
                body,
                ..HttpRequestSpec::default()
            };
            for (name, value) in &self.headers {
                req.set_header(name, value);
            }
            if host.is_some() {
                req.host = host;
            }
            ammo.tag = tag;
            ammo.payload = Payload::Http(req);
            return Some(Ok(()));
        }
    }
}

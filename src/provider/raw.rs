//! `raw` ammo: size-prefixed HTTP requests
//!
//! ```text
//! 42 tag
//! GET /index.html HTTP/1.1
//! Host: example.com
//!
//! ```
//!
//! A record whose request fails to parse is a recoverable error: the size
//! prefix already told us where the next record starts.

use super::uripost::read_body;
use super::{split_absolute_uri, Reader, RecordDecoder};
use crate::ammo::{Ammo, HttpRequestSpec, Payload};
use crate::error::AmmoDecodeError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncBufReadExt;

pub struct RawDecoder {
    reader: Reader,
    name: String,
    record: usize,
    line: String,
    broken: bool,
}

impl RawDecoder {
    pub fn new(reader: Reader, name: String) -> Self {
        Self {
            reader,
            name,
            record: 0,
            line: String::new(),
            broken: false,
        }
    }

    fn error(&self, message: impl Into<String>) -> AmmoDecodeError {
        AmmoDecodeError::new(format!("{} record {}", self.name, self.record), message)
    }
}

#[async_trait]
impl RecordDecoder for RawDecoder {
    async fn decode(&mut self, ammo: &mut Ammo) -> Option<Result<(), AmmoDecodeError>> {
        if self.broken {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    self.broken = true;
                    return Some(Err(self.error(e.to_string())));
                }
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            self.record += 1;

            let (size, tag) = match line.split_once(char::is_whitespace) {
                Some((size, tag)) => (size, tag.trim().to_string()),
                None => (line, String::new()),
            };
            let Ok(size) = size.parse::<usize>() else {
                self.broken = true;
                return Some(Err(self.error(format!("invalid request size {:?}", size))));
            };
            let raw = match read_body(&mut self.reader, size).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.broken = true;
                    return Some(Err(self.error(format!("reading {} request bytes: {}", size, e))));
                }
            };

            return Some(match parse_raw_request(&raw) {
                Ok(req) => {
                    ammo.tag = tag;
                    ammo.payload = Payload::Http(req);
                    Ok(())
                }
                Err(msg) => Err(self.error(msg)),
            });
        }
    }
}

/// Parse a complete HTTP/1.x request: request line, headers, body
pub fn parse_raw_request(raw: &[u8]) -> Result<HttpRequestSpec, String> {
    let (head, body) = split_head(raw).ok_or("request has no header terminator")?;
    let head = std::str::from_utf8(head).map_err(|_| "request head is not valid UTF-8")?;
    let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("malformed request line {:?}", request_line));
    };
    if !version.starts_with("HTTP/") {
        return Err(format!("unsupported protocol {:?}", version));
    }

    let (host, uri) = split_absolute_uri(target);
    let mut req = HttpRequestSpec {
        method: method.to_string(),
        uri,
        host,
        headers: Vec::new(),
        body: Bytes::copy_from_slice(body),
    };
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line {:?}", line))?;
        // Length is recomputed by the client from the actual body
        if name.trim().eq_ignore_ascii_case("content-length") {
            continue;
        }
        req.set_header(name.trim(), value.trim());
    }
    Ok(req)
}

fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(i) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((&raw[..i], &raw[i + 4..]));
    }
    raw.windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| (&raw[..i], &raw[i + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_with_body() {
        let raw = b"POST /submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\nX-A: b\r\n\r\nbody";
        let req = parse_raw_request(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/submit?x=1");
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(req.headers, vec![("X-A".to_string(), "b".to_string())]);
        assert_eq!(&req.body[..], b"body");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_raw_request(b"GET /\r\n\r\n").is_err());
        assert!(parse_raw_request(b"GET / HTTP/1.1\r\nHost: x\r\n").is_err());
        assert!(parse_raw_request(b"GET / HTTP/1.1\r\nno-colon\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_decoder_skips_to_next_record_after_bad_request() {
        let good = "GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let bad = "NOPE\r\n\r\n";
        let input = format!("{} t1\n{}{}\n{}\n{} t3\n{}", good.len(), good, bad.len(), bad, good.len(), good);
        let input: &'static str = Box::leak(input.into_boxed_str());
        let mut decoder = RawDecoder::new(Box::new(input.as_bytes()), "ammo.raw".to_string());

        let mut results = Vec::new();
        loop {
            let mut ammo = Ammo::default();
            match decoder.decode(&mut ammo).await {
                None => break,
                Some(r) => results.push(r.map(|_| ammo.tag)),
            }
        }
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref(), Ok("t1"));
        assert_eq!(results[1].as_ref().unwrap_err().location, "ammo.raw record 2");
        assert_eq!(results[2].as_deref(), Ok("t3"));
    }

    #[tokio::test]
    async fn test_size_beyond_end_of_file() {
        let mut decoder = RawDecoder::new(
            Box::new("1000000000000 huge\nGET / HTTP/1.1\r\n\r\n".as_bytes()),
            "ammo.raw".to_string(),
        );
        let mut ammo = Ammo::default();
        let err = decoder.decode(&mut ammo).await.unwrap().unwrap_err();
        assert!(err.message.contains("reading 1000000000000 request bytes"), "{}", err.message);
        assert!(decoder.decode(&mut ammo).await.is_none());
    }
}

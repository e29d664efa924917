//! HTTP/1.1 and HTTP/2 guns
//!
//! One `reqwest` client per pool is built during warm up and shared by every
//! instance, so connections are pooled pool-wide.
//!
//! `http2` without TLS speaks h2c with prior knowledge. In both modes warm up
//! sends a probe request and fails the pool when the target does not answer
//! over HTTP/2.

use super::{report_unfired, Gun, GunDeps, GunFactory, HttpGunConfig, SharedState};
use crate::ammo::{Ammo, HttpRequestSpec, Payload};
use crate::sample::{Sample, SampleError};
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HOST};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Client and base URL shared by the guns of one pool
pub struct HttpShared {
    pub client: reqwest::Client,
    pub base_url: String,
    pub timeout: Duration,
}

/// Response as seen by postprocessors
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub(crate) fn build_client(cfg: &HttpGunConfig, protocol: Protocol) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .danger_accept_invalid_certs(cfg.insecure)
        .redirect(reqwest::redirect::Policy::none());
    builder = match protocol {
        Protocol::Http1 => builder.http1_only(),
        Protocol::Http2 => builder.http2_prior_knowledge(),
    };
    builder.build().context("Failed to build HTTP client")
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Execute one request, filling timing and byte counts into `sample`
///
/// Latency is the time to response headers, receive the time to read the
/// body. Connect and send are not observable through the client and stay 0.
pub async fn send(
    shared: &HttpShared,
    req: &HttpRequestSpec,
    sample: &mut Sample,
) -> Result<HttpResponse, SampleError> {
    let method = reqwest::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| SampleError::InvalidAmmo(format!("invalid method {:?}", req.method)))?;
    let mut builder = shared
        .client
        .request(method, format!("{}{}", shared.base_url, req.uri));
    if let Some(ref host) = req.host {
        builder = builder.header(HOST, host);
    }
    for (name, value) in &req.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !req.body.is_empty() {
        builder = builder.body(req.body.clone());
    }
    sample.egress = req.wire_size();

    let exchange = async {
        let started = Instant::now();
        let response = builder.send().await?;
        sample.latency = started.elapsed();
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        sample.receive = started.elapsed() - sample.latency;
        Ok::<_, reqwest::Error>(HttpResponse { status, headers, body })
    };

    let response = match tokio::time::timeout(shared.timeout, exchange).await {
        Err(_) => return Err(SampleError::Timeout(shared.timeout)),
        Ok(Err(e)) if e.is_timeout() => return Err(SampleError::Timeout(shared.timeout)),
        Ok(Err(e)) => return Err(SampleError::Transport(error_chain(&e))),
        Ok(Ok(response)) => response,
    };

    sample.proto_code = response.status;
    let header_bytes: usize = response
        .headers
        .iter()
        .map(|(n, v)| n.as_str().len() + v.len() + 4)
        .sum();
    sample.igress = (header_bytes + response.body.len()) as u64;
    Ok(response)
}

pub struct HttpGunFactory {
    cfg: HttpGunConfig,
    protocol: Protocol,
}

impl HttpGunFactory {
    pub fn new(cfg: HttpGunConfig, protocol: Protocol) -> Self {
        Self { cfg, protocol }
    }
}

#[async_trait]
impl GunFactory for HttpGunFactory {
    fn accepts(&self, payload_kind: &str) -> bool {
        payload_kind == "http"
    }

    async fn warm_up(&self, cancel: &CancellationToken) -> anyhow::Result<SharedState> {
        let client = build_client(&self.cfg, self.protocol)?;
        let shared = HttpShared {
            client,
            base_url: self.cfg.base_url(),
            timeout: self.cfg.timeout,
        };

        if self.protocol == Protocol::Http2 {
            let probe = shared.client.get(format!("{}/", shared.base_url)).send();
            let response = tokio::select! {
                _ = cancel.cancelled() => bail!("warm up cancelled"),
                r = tokio::time::timeout(self.cfg.timeout, probe) => r,
            };
            let response = response
                .map_err(|_| anyhow::anyhow!("HTTP/2 probe to {} timed out", shared.base_url))?
                .map_err(|e| anyhow::anyhow!("HTTP/2 probe to {} failed: {}", shared.base_url, error_chain(&e)))?;
            if response.version() != reqwest::Version::HTTP_2 {
                bail!(
                    "target {} did not negotiate HTTP/2 (got {:?})",
                    shared.base_url,
                    response.version()
                );
            }
            info!(addr = %self.cfg.target, "HTTP/2 negotiated");
        }

        Ok(Arc::new(shared))
    }

    fn new_gun(&self, deps: GunDeps) -> anyhow::Result<Box<dyn Gun>> {
        let shared = Arc::clone(&deps.shared)
            .downcast::<HttpShared>()
            .map_err(|_| anyhow::anyhow!("http gun got foreign shared state"))?;
        Ok(Box::new(HttpGun {
            deps,
            shared,
            auto_tag: self.cfg.auto_tag.enabled.then_some((self.cfg.auto_tag.uri_elements, self.cfg.auto_tag.no_tag_only)),
        }))
    }
}

pub struct HttpGun {
    deps: GunDeps,
    shared: Arc<HttpShared>,
    /// `(uri_elements, no_tag_only)` when auto tagging is on
    auto_tag: Option<(usize, bool)>,
}

impl HttpGun {
    fn tag_for(&self, ammo: &Ammo, req: &HttpRequestSpec) -> String {
        match self.auto_tag {
            Some((elements, no_tag_only)) if !no_tag_only || ammo.tag.is_empty() => auto_tag(&req.uri, elements),
            _ => ammo.tag.clone(),
        }
    }
}

/// First `elements` path segments of `uri`, e.g. `/a/b` for `/a/b/c?x=1`
pub fn auto_tag(uri: &str, elements: usize) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).take(elements).collect();
    format!("/{}", segments.join("/"))
}

#[async_trait]
impl Gun for HttpGun {
    async fn shoot(&mut self, ammo: &Ammo) {
        if let Some(ref reason) = ammo.invalid {
            report_unfired(&self.deps.reporter, ammo, SampleError::InvalidAmmo(reason.clone())).await;
            return;
        }
        let Payload::Http(ref req) = ammo.payload else {
            report_unfired(&self.deps.reporter, ammo, SampleError::UnsupportedAmmo(ammo.payload.kind())).await;
            return;
        };

        let mut sample = Sample::start(self.tag_for(ammo, req));
        let result = tokio::select! {
            _ = self.deps.cancel.cancelled() => return,
            r = send(&self.shared, req, &mut sample).instrument(self.deps.span.clone()) => r,
        };
        if let Err(e) = result {
            debug!(parent: &self.deps.span, ammo_id = ammo.id, error = %e, "shot failed");
            sample.set_error(e);
        }
        sample.finish();
        self.deps.reporter.report(sample).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tag() {
        assert_eq!(auto_tag("/a/b/c?x=1", 2), "/a/b");
        assert_eq!(auto_tag("/a", 2), "/a");
        assert_eq!(auto_tag("/", 2), "/");
        assert_eq!(auto_tag("//a//b/c", 1), "/a");
    }

    #[test]
    fn test_error_chain_joins_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "refused");
        let outer = anyhow::Error::new(inner).context("connect");
        let chained = error_chain(&*outer);
        assert_eq!(chained, "connect: refused");
    }
}

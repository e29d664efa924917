//! expvar-style counter endpoint
//!
//! Serves `GET /debug/vars` as JSON:
//!
//! ```text
//! {"pools": {"pool-1": {"ammo_acquired": 10, "shots_fired": 10, ...}}}
//! ```
//!
//! Anything else gets a 404. Connections are one request each.

use super::{PoolSnapshot, StatsRegistry};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_PORT: u16 = 1234;

#[derive(Serialize)]
struct Vars {
    pools: BTreeMap<String, PoolSnapshot>,
}

/// Bound endpoint, ready to serve
pub struct ExpvarServer {
    listener: TcpListener,
    registry: StatsRegistry,
}

impl ExpvarServer {
    pub async fn bind(addr: SocketAddr, registry: StatsRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind expvar endpoint on {}", addr))?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "expvar endpoint listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted.context("Failed to accept connection")?,
            };
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle(stream, &registry).await {
                    debug!(%peer, error = %e, "expvar request failed");
                }
            });
        }
    }
}

async fn handle(stream: TcpStream, registry: &StatsRegistry) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain headers
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let (method, path) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());
    let (status, body) = if method == "GET" && path == "/debug/vars" {
        let vars = Vars {
            pools: registry.snapshot(),
        };
        ("200 OK", serde_json::to_string(&vars)?)
    } else {
        ("404 Not Found", "{\"error\":\"not found\"}".to_string())
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_serves_pool_counters() {
        let registry = StatsRegistry::new();
        registry.pool("main").shots_fired.add(7);
        let server = ExpvarServer::bind("127.0.0.1:0".parse().unwrap(), registry)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        let response = get(addr, "/debug/vars").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["pools"]["main"]["shots_fired"], 7);

        assert!(get(addr, "/other").await.starts_with("HTTP/1.1 404"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}

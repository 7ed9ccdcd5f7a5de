//! Metrics HTTP Server
//!
//! Provides HTTP endpoints for Prometheus scraping and status polling

use crate::metrics::{Statistics, StatusSource};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// HTTP server for metrics and status
pub struct MetricsServer {
    stats: Arc<Statistics>,
    status: Arc<dyn StatusSource>,
    bind_addr: SocketAddr,
    listener: Option<TcpListener>,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(stats: Arc<Statistics>, status: Arc<dyn StatusSource>, bind_addr: SocketAddr) -> Self {
        Self {
            stats,
            status,
            bind_addr,
            listener: None,
        }
    }

    /// Bind the listen socket
    pub async fn bind(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "Metrics server started");
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve requests until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Metrics listener not initialized"))?;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((mut stream, addr)) => {
                        debug!(client_addr = %addr, "Metrics request received");

                        let stats = Arc::clone(&self.stats);
                        let status = Arc::clone(&self.status);
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut stream, stats, status).await {
                                error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept metrics connection");
                    }
                },
                _ = shutdown.recv() => {
                    debug!("Metrics server stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single HTTP request
async fn handle_request(
    stream: &mut TcpStream,
    stats: Arc<Statistics>,
    status: Arc<dyn StatusSource>,
) -> anyhow::Result<()> {
    // Only the request line matters
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let path = request_path(&request);
    debug!(path = ?path, "Received HTTP request");

    let response = match path {
        Some("/metrics") => http_response(
            "200 OK",
            "text/plain; version=0.0.4; charset=utf-8",
            &stats.export_prometheus(),
        ),
        Some("/stats") => {
            let body = super::reporter::export_status_json(&status.status())?;
            http_response("200 OK", "application/json", &body)
        }
        Some("/health") => http_response("200 OK", "text/plain", "OK"),
        _ => http_response("404 Not Found", "text/plain", "Not Found"),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn request_path(request: &str) -> Option<&str> {
    let mut parts = request.lines().next()?.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(path)) => Some(path.split('?').next().unwrap_or(path)),
        _ => None,
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        content_type,
        body.len(),
        body
    )
}

//! Liveness-independent responsiveness probes.
//!
//! Two tiers: an HTTP GET against the server's own metadata endpoint, then a
//! raw TCP connect to the same port as a fallback. A server that fails HTTP
//! but accepts the TCP connect is treated as responsive (busy, not dead).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Timeout for the HTTP metadata probe.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the TCP connect fallback.
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe the server's `/v1/models` endpoint.
///
/// Success is any 2xx status within the probe timeout.
pub async fn check_http_health(port: u16) -> Result<bool> {
    let url = format!("http://localhost:{port}/v1/models");
    let client = Client::builder().timeout(HTTP_PROBE_TIMEOUT).build()?;

    match client.get(&url).send().await {
        Ok(response) => {
            let healthy = response.status().is_success();
            debug!(port, status = %response.status(), healthy, "HTTP probe");
            Ok(healthy)
        }
        Err(e) => {
            debug!(port, error = %e, "HTTP probe failed");
            Ok(false)
        }
    }
}

/// Fallback probe: raw TCP connect to the listening port.
pub async fn check_port_open(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    match timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!(port, "TCP fallback probe: port open");
            true
        }
        Ok(Err(e)) => {
            debug!(port, error = %e, "TCP fallback probe failed");
            false
        }
        Err(_) => {
            debug!(port, "TCP fallback probe timed out");
            false
        }
    }
}

/// Combined responsiveness probe: HTTP first, TCP connect on HTTP failure.
pub async fn check_responsiveness(port: u16) -> bool {
    match check_http_health(port).await {
        Ok(true) => true,
        Ok(false) | Err(_) => check_port_open(port).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn closed_port_is_unresponsive() {
        // Nothing listens on this port
        assert!(!check_responsiveness(65431).await);
    }

    #[tokio::test]
    async fn tcp_fallback_accepts_non_http_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // The listener never speaks HTTP, so the HTTP probe fails and the
        // TCP fallback must carry the verdict.
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        assert!(check_responsiveness(port).await);
        accept.abort();
    }

    #[tokio::test]
    async fn http_probe_reports_false_on_connection_refused() {
        let result = check_http_health(65430).await.expect("probe runs");
        assert!(!result);
    }
}

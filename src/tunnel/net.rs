//! Loopback port helpers: free-port discovery, port-free assertion and
//! connectability probes.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::trace;

use crate::{Error, Result};

/// Per-probe connect timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay between readiness probes
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Whether a TCP connection to `127.0.0.1:port` can be established
pub async fn can_connect(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(loopback(port))).await,
        Ok(Ok(_))
    )
}

/// Ask the OS for a currently free loopback port
pub async fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind(loopback(0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Fail if something is already listening on `host:port`.
///
/// Performs a throwaway bind. std sets `SO_REUSEADDR` on Unix, so sockets
/// lingering in TIME_WAIT from a previous tunnel do not count as "in use".
pub fn assert_port_free(host: Ipv4Addr, port: u16) -> Result<()> {
    std::net::TcpListener::bind(SocketAddr::from((host, port)))
        .map(drop)
        .map_err(|e| Error::tunnel(port, format!("local port is already in use: {}", e)))
}

/// Fail if something is already listening on `127.0.0.1:port`
pub fn assert_local_port_free(port: u16) -> Result<()> {
    assert_port_free(Ipv4Addr::LOCALHOST, port)
}

/// Block until a loopback connection to `port` succeeds or `timeout` elapses
pub async fn wait_until_connectable(port: u16, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if can_connect(port).await {
            trace!(port, attempts, "Port accepted a connection");
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(
                format!("tunnel on 127.0.0.1:{}", port),
                timeout,
                format!("not connectable after {} attempts", attempts),
            ));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_actually_free() {
        let port = find_free_port().await.unwrap();
        assert!(port > 0);
        assert!(assert_local_port_free(port).is_ok());
        assert!(!can_connect(port).await);
    }

    #[tokio::test]
    async fn occupied_port_is_reported_with_its_number() {
        let listener = TcpListener::bind(loopback(0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = assert_local_port_free(port).unwrap_err();
        assert!(matches!(err, Error::Tunnel { port: p, .. } if p == port));
        assert!(err.to_string().contains("already in use"));
        assert!(can_connect(port).await);
    }

    #[tokio::test]
    async fn waiting_on_a_dead_port_times_out_with_attempt_count() {
        let port = find_free_port().await.unwrap();
        let err = wait_until_connectable(port, Duration::from_millis(250))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&port.to_string()));
        assert!(msg.contains("attempts"));
    }

    #[tokio::test]
    async fn waiting_on_a_listening_port_returns_immediately() {
        let listener = TcpListener::bind(loopback(0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_until_connectable(port, Duration::from_secs(1))
            .await
            .unwrap();
    }
}

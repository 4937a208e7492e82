use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Port reachability check used by the health loop.
///
/// Implementations must give up after `timeout`.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;
}

/// Probes by opening (and immediately dropping) a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Error::Probe(format!("{}:{} unreachable: {}", host, port, e))),
            Err(_) => Err(Error::Timeout(format!(
                "{}:{} did not accept within {:?}",
                host, port, timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        TcpProbe
            .probe("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();

        drop(listener);
        let err = TcpProbe
            .probe("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Probe(_) | Error::Timeout(_)));
    }
}

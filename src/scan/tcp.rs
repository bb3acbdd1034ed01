use crate::error::ScanError;
use crate::scanner::{DEFAULT_POLL_INTERVAL_SECS, Scanner};
use crate::target::{Host, lookup_ipv4};
use crate::types::{AppState, OutcomeData, ScanKind, ScanTask};
use async_trait::async_trait;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// TCP connect check: the handshake completing is the whole result.
pub struct TcpScanner {
    poll_interval: Duration,
}

impl Default for TcpScanner {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
    }
}

impl TcpScanner {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    async fn connect(&self, host: &Host, connect_timeout: Duration) -> Result<OutcomeData, ScanError> {
        let start = Instant::now();
        let ip = match host.address {
            Some(ip) => ip,
            None => lookup_ipv4(&host.origin).await?,
        };
        let addr = SocketAddr::new(IpAddr::V4(ip), host.port);
        log::debug!("[scan::tcp] connect: host={} addr={} timeout={}s",
            host.origin, addr, connect_timeout.as_secs());

        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ScanError::dial(addr, e)),
            Err(_) => return Err(ScanError::dial(addr, format!("timed out after {:?}", connect_timeout))),
        };
        drop(stream);

        let elapsed = start.elapsed();
        log::debug!("[scan::tcp] connected: addr={} duration={}ms", addr, elapsed.as_millis());

        let mut data = OutcomeData::new();
        data.insert("ip".to_string(), json!(ip.to_string()));
        data.insert("origin".to_string(), json!(host.origin));
        data.insert("port".to_string(), json!(host.port));
        data.insert("connected".to_string(), json!(true));
        data.insert("elapsed_ms".to_string(), json!(elapsed.as_millis() as u64));
        Ok(data)
    }
}

#[async_trait]
impl Scanner for TcpScanner {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn kind(&self) -> ScanKind {
        ScanKind::Tcp
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn scan(&self, task: &ScanTask, _state: &AppState) -> Result<OutcomeData, ScanError> {
        self.connect(&task.host, task.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_scanner_defaults() {
        let scanner = TcpScanner::default();
        assert_eq!(scanner.name(), "tcp");
        assert_eq!(scanner.kind(), ScanKind::Tcp);
        assert_eq!(scanner.poll_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tcp_connect_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let state = AppState::default();
        let task = ScanTask::new(ScanKind::Tcp, Host::parse("127.0.0.1", port).unwrap(), 1, 0);
        let data = TcpScanner::default().scan(&task, &state).await.unwrap();

        assert_eq!(data.get("connected"), Some(&json!(true)));
        assert_eq!(data.get("ip"), Some(&json!("127.0.0.1")));
        assert_eq!(data.get("port"), Some(&json!(port)));
    }

    #[tokio::test]
    async fn test_tcp_connect_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let state = AppState::default();
        let task = ScanTask::new(ScanKind::Tcp, Host::parse("127.0.0.1", port).unwrap(), 1, 0);
        let result = TcpScanner::default().scan(&task, &state).await;
        assert!(matches!(result, Err(ScanError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_tcp_connects_to_cidr_network_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let state = AppState::default();
        let task = ScanTask::new(ScanKind::Tcp, Host::parse("127.0.0.1/32", port).unwrap(), 1, 0);
        let data = TcpScanner::default().scan(&task, &state).await.unwrap();

        assert_eq!(data.get("connected"), Some(&json!(true)));
        assert_eq!(data.get("ip"), Some(&json!("127.0.0.1")));
        assert_eq!(data.get("origin"), Some(&json!("127.0.0.1/32")));
    }

    #[tokio::test]
    async fn test_tcp_resolves_domain_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let host = Host::parse("localhost", port).unwrap();
        let data = TcpScanner::default().connect(&host, Duration::from_secs(1)).await;
        // localhost may resolve to ::1 only on some systems
        if let Ok(data) = data {
            assert_eq!(data.get("origin"), Some(&json!("localhost")));
        }
    }
}

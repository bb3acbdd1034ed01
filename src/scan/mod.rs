pub mod ping;
pub mod tcp;
pub mod tls;

pub use ping::{PingProbe, PingScanner, PingStats, SystemPing};
pub use tcp::TcpScanner;
pub use tls::{ProbeResult, TlsProber, TlsScanner, TlsVersion};

use crate::scanner::Scanner;
use crate::types::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// One worker per scan kind, sharing the same poll interval.
pub fn create_default_scanners(
    prober: TlsProber,
    concurrency: usize,
    poll_interval: Duration,
) -> Vec<Box<dyn Scanner + Send + Sync>> {
    vec![
        Box::new(PingScanner::new(Arc::new(SystemPing), poll_interval)),
        Box::new(TcpScanner::new(poll_interval)),
        Box::new(
            TlsScanner::new(prober)
                .with_concurrency(concurrency)
                .with_poll_interval(poll_interval),
        ),
    ]
}

pub fn spawn_scanner_tasks(
    scanners: Vec<Box<dyn Scanner + Send + Sync>>,
    state: Arc<AppState>,
) -> Vec<JoinHandle<()>> {
    scanners
        .into_iter()
        .map(|scanner| {
            let state_clone = Arc::clone(&state);
            log::debug!("[scan] spawn: scanner={} kind={}", scanner.name(), scanner.kind());
            tokio::spawn(async move {
                scanner.run(state_clone).await;
            })
        })
        .collect()
}

use crate::error::ScanError;
use crate::scanner::{DEFAULT_POLL_INTERVAL_SECS, Scanner};
use crate::types::{AppState, OutcomeData, ScanKind, ScanTask};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

const PING_GRACE_SECS: u64 = 1;
const PING_PACKET_SIZE: u32 = 24;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PingStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub duplicates: u32,
    pub packet_loss: f32,
    pub min_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub stddev_rtt_ms: f64,
}

/// ICMP echo capability used by the ping worker.
#[async_trait]
pub trait PingProbe: Send + Sync {
    async fn ping(&self, origin: &str, timeout: Duration) -> Result<PingStats, ScanError>;
}

/// Runs the system `ping` binary, one echo per second until the timeout.
#[derive(Debug, Default, Clone)]
pub struct SystemPing;

#[async_trait]
impl PingProbe for SystemPing {
    async fn ping(&self, origin: &str, timeout: Duration) -> Result<PingStats, ScanError> {
        let secs = timeout.as_secs().max(1);
        let deadline_flag = if cfg!(target_os = "macos") { "-t" } else { "-w" };
        log::debug!("[scan::ping] do_ping: target={} count={} timeout={}s", origin, secs, secs);

        let ping_start = Instant::now();
        let output = Command::new("ping")
            .args([
                "-c", &secs.to_string(),
                "-s", &PING_PACKET_SIZE.to_string(),
                deadline_flag, &secs.to_string(),
                origin,
            ])
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(Duration::from_secs(secs + PING_GRACE_SECS), output).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                log::error!("[scan::ping] ping_command_failed: target={} error={}", origin, e);
                return Err(ScanError::Ping {
                    target: origin.to_string(),
                    reason: format!("failed to execute ping command: {}", e),
                });
            }
            Err(_) => {
                return Err(ScanError::Ping {
                    target: origin.to_string(),
                    reason: format!("ping did not finish within {}s", secs + PING_GRACE_SECS),
                });
            }
        };

        log::trace!("[scan::ping] ping_command_completed: target={} duration={}ms status={}",
            origin, ping_start.elapsed().as_millis(), output.status);

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_ping_statistics(&stdout) {
            Some(stats) => Ok(stats),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log::error!("[scan::ping] ping_output_unparsed: target={} status={} stderr={}",
                    origin, output.status, stderr.trim());
                Err(ScanError::Ping {
                    target: origin.to_string(),
                    reason: if stderr.trim().is_empty() {
                        "no statistics in ping output".to_string()
                    } else {
                        stderr.trim().to_string()
                    },
                })
            }
        }
    }
}

fn leading_number<T: std::str::FromStr>(text: &str) -> Option<T> {
    text.trim()
        .trim_start_matches('+')
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .and_then(|n| n.parse().ok())
}

/// Extract the summary of a `ping` run.
///
/// Understands the Linux (`rtt min/avg/max/mdev`) and BSD
/// (`round-trip min/avg/max/stddev`) summaries. Returns `None` when the
/// packet counter line is missing.
pub fn parse_ping_statistics(output: &str) -> Option<PingStats> {
    let mut stats = PingStats::default();
    let mut found_counts = false;

    for line in output.lines() {
        if line.contains("packets transmitted") {
            found_counts = true;
            for part in line.split(',') {
                if part.contains("transmitted") {
                    stats.packets_sent = leading_number(part)?;
                } else if part.contains("duplicates") {
                    stats.duplicates = leading_number(part).unwrap_or(0);
                } else if part.contains("received") {
                    stats.packets_received = leading_number(part)?;
                } else if part.contains("packet loss") {
                    stats.packet_loss = leading_number(part).unwrap_or(100.0);
                }
            }
        } else if line.contains("min/avg/max") {
            let values = line.split('=').nth(1)?.split_whitespace().next()?;
            let rtts: Vec<f64> = values.split('/').filter_map(|v| v.parse().ok()).collect();
            if let &[min, avg, max, stddev] = rtts.as_slice() {
                stats.min_rtt_ms = min;
                stats.avg_rtt_ms = avg;
                stats.max_rtt_ms = max;
                stats.stddev_rtt_ms = stddev;
            }
        }
    }

    found_counts.then_some(stats)
}

/// Pings the origin of each task through a [`PingProbe`].
pub struct PingScanner {
    probe: Arc<dyn PingProbe>,
    poll_interval: Duration,
}

impl Default for PingScanner {
    fn default() -> Self {
        Self::new(Arc::new(SystemPing), Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
    }
}

impl PingScanner {
    pub fn new(probe: Arc<dyn PingProbe>, poll_interval: Duration) -> Self {
        log::debug!("[scan::ping] new: poll_interval={}ms", poll_interval.as_millis());
        Self { probe, poll_interval }
    }
}

#[async_trait]
impl Scanner for PingScanner {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn kind(&self) -> ScanKind {
        ScanKind::Ping
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn scan(&self, task: &ScanTask, _state: &AppState) -> Result<OutcomeData, ScanError> {
        // Follow-ups from the TLS worker carry the feasible address; user
        // tasks ping whatever they named.
        let target = match task.host.address {
            Some(ip) => ip.to_string(),
            None => task.host.origin.clone(),
        };
        log::debug!("[scan::ping] scan: target={} timeout={}s", target, task.timeout.as_secs());

        let stats = self.probe.ping(&target, task.timeout).await?;
        log::info!("[scan::ping] ping_completed: target={} sent={} received={} loss={}% avg={}ms",
            target, stats.packets_sent, stats.packets_received, stats.packet_loss, stats.avg_rtt_ms);

        let mut data = match serde_json::to_value(&stats) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => OutcomeData::new(),
        };
        data.insert("ip".to_string(), serde_json::Value::String(target));
        data.insert("host".to_string(), serde_json::Value::String(task.host.origin.clone()));
        Ok(data)
    }
}

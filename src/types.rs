use crate::queue::TaskQueueRegistry;
use crate::target::Host;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

// Room for a few thousand per-host TLS records before the reporter lags.
const OUTCOME_FEED_CAPACITY: usize = 4096;

pub type OutcomeData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Ping,
    Tcp,
    Tls,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Ping => "ping",
            ScanKind::Tcp => "tcp",
            ScanKind::Tls => "tls",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for a worker; consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub kind: ScanKind,
    pub host: Host,
    pub timeout: Duration,
    /// Bounds neighborhood expansion for TLS tasks.
    pub depth: u32,
}

impl ScanTask {
    pub fn new(kind: ScanKind, host: Host, timeout_secs: u64, depth: u32) -> Self {
        Self {
            kind,
            host,
            timeout: Duration::from_secs(timeout_secs),
            depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub worker_id: String,
    pub status: ScanStatus,
    pub data: OutcomeData,
    pub updated_at: DateTime<Utc>,
}

/// Last known outcome per worker id.
///
/// Every write replaces the previous record for that id and is also
/// published on a broadcast feed so the reporter sees records that are
/// overwritten before it gets to read them.
pub struct OutcomeSink {
    outcomes: DashMap<String, ScanOutcome>,
    feed: broadcast::Sender<ScanOutcome>,
}

impl Default for OutcomeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeSink {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(OUTCOME_FEED_CAPACITY);
        Self {
            outcomes: DashMap::new(),
            feed,
        }
    }

    pub fn record(&self, worker_id: &str, status: ScanStatus, data: OutcomeData) {
        let outcome = ScanOutcome {
            worker_id: worker_id.to_string(),
            status,
            data,
            updated_at: Utc::now(),
        };
        log::trace!("[types] outcome_recorded: worker={} status={}", worker_id, status.as_str());
        self.outcomes.insert(worker_id.to_string(), outcome.clone());
        // No subscribers is fine; the map still holds the record.
        let _ = self.feed.send(outcome);
    }

    pub fn get(&self, worker_id: &str) -> Option<ScanOutcome> {
        self.outcomes.get(worker_id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<ScanOutcome> {
        let mut outcomes: Vec<ScanOutcome> =
            self.outcomes.iter().map(|entry| entry.value().clone()).collect();
        outcomes.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        outcomes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanOutcome> {
        self.feed.subscribe()
    }
}

/// Process wide state shared by every worker.
pub struct AppState {
    stop: AtomicBool,
    in_flight: AtomicUsize,
    pub queues: TaskQueueRegistry,
    pub outcomes: OutcomeSink,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(TaskQueueRegistry::default())
    }
}

impl AppState {
    pub fn new(queues: TaskQueueRegistry) -> Self {
        Self {
            stop: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            queues,
            outcomes: OutcomeSink::new(),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// No queued tasks and no worker mid-task.
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
            && self
                .queues
                .kinds()
                .into_iter()
                .filter_map(|kind| self.queues.lookup(kind))
                .all(|queue| queue.is_empty())
    }

    /// Raise the stop flag and close every queue so idle workers wake up.
    pub fn shutdown(&self) {
        log::info!("[types] shutdown: closing queues");
        self.stop.store(true, Ordering::Release);
        self.queues.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_last_write_wins() {
        let sink = OutcomeSink::new();
        sink.record("tls", ScanStatus::Running, OutcomeData::new());

        let mut data = OutcomeData::new();
        data.insert("feasible".to_string(), json!(true));
        sink.record("tls", ScanStatus::Completed, data);

        let outcome = sink.get("tls").unwrap();
        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(outcome.data.get("feasible"), Some(&json!(true)));
        assert_eq!(sink.snapshot().len(), 1);
        assert!(sink.get("ping").is_none());
    }

    #[tokio::test]
    async fn test_outcome_feed_sees_every_write() {
        let sink = OutcomeSink::new();
        let mut feed = sink.subscribe();

        sink.record("tcp", ScanStatus::Running, OutcomeData::new());
        sink.record("tcp", ScanStatus::Failed, OutcomeData::new());

        assert_eq!(feed.recv().await.unwrap().status, ScanStatus::Running);
        assert_eq!(feed.recv().await.unwrap().status, ScanStatus::Failed);
    }

    #[test]
    fn test_snapshot_sorted_by_worker() {
        let sink = OutcomeSink::new();
        sink.record("tls", ScanStatus::Running, OutcomeData::new());
        sink.record("ping", ScanStatus::Pending, OutcomeData::new());
        let ids: Vec<String> = sink.snapshot().into_iter().map(|o| o.worker_id).collect();
        assert_eq!(ids, vec!["ping".to_string(), "tls".to_string()]);
    }

    #[test]
    fn test_shutdown_sets_flag() {
        let state = AppState::default();
        assert!(!state.should_stop());
        state.shutdown();
        assert!(state.should_stop());
    }

    #[test]
    fn test_idle_tracks_queues_and_running_workers() {
        let state = AppState::default();
        assert!(state.is_idle());

        let host = Host::parse("10.0.0.1", 443).unwrap();
        state.queues.enqueue(ScanKind::Tcp, ScanTask::new(ScanKind::Tcp, host, 1, 0)).unwrap();
        assert!(!state.is_idle());

        let queue = state.queues.lookup(ScanKind::Tcp).unwrap();
        queue.close();
        assert!(state.is_idle());

        state.task_started();
        assert!(!state.is_idle());
        state.task_finished();
        assert!(state.is_idle());
    }

    #[test]
    fn test_scan_task_timeout_in_seconds() {
        let host = Host::parse("10.0.0.1", 443).unwrap();
        let task = ScanTask::new(ScanKind::Tls, host, 5, 3);
        assert_eq!(task.timeout, Duration::from_secs(5));
        assert_eq!(task.depth, 3);
        assert_eq!(task.kind.to_string(), "tls");
    }
}

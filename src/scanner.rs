use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ScanError;
use crate::types::{AppState, OutcomeData, ScanKind, ScanStatus, ScanTask};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

#[async_trait]
pub trait Scanner {
    /// Worker identifier used as the outcome key
    fn name(&self) -> &'static str;

    /// Queue this worker consumes
    fn kind(&self) -> ScanKind;

    /// How long to wait for a task (or for the queue to appear) per iteration
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
    }

    /// Process one task
    async fn scan(&self, task: &ScanTask, state: &AppState) -> Result<OutcomeData, ScanError>;

    /// Default implementation of the worker loop.
    ///
    /// Each iteration checks the stop flag, looks the queue up and waits
    /// for a task or the poll interval. A failed task is recorded and the
    /// loop moves on; only a closed queue or the stop flag end it.
    async fn run(&self, state: Arc<AppState>) {
        log::debug!("[scanner] run: scanner={} kind={} poll_interval={}ms",
            self.name(), self.kind(), self.poll_interval().as_millis());

        let mut task_count = 0u64;

        loop {
            if state.should_stop() {
                log::debug!("[scanner] stopping: scanner={} reason=stop_flag", self.name());
                break;
            }

            let Some(queue) = state.queues.lookup(self.kind()) else {
                log::trace!("[scanner] queue_not_ready: scanner={} kind={}", self.name(), self.kind());
                tokio::time::sleep(self.poll_interval()).await;
                continue;
            };

            let task = match queue.recv_timeout(self.poll_interval()).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    log::trace!("[scanner] no_task: scanner={}", self.name());
                    continue;
                }
                Err(ScanError::QueueClosed) => {
                    log::debug!("[scanner] stopping: scanner={} reason=queue_closed", self.name());
                    break;
                }
                Err(e) => {
                    log::error!("[scanner] recv_failed: scanner={} error={}", self.name(), e);
                    break;
                }
            };
            // The registry handle is not needed while probing.
            drop(queue);

            task_count += 1;
            state.task_started();
            log::info!("[scanner] task_received: scanner={} count={} host={} depth={} timeout={}s",
                self.name(), task_count, task.host, task.depth, task.timeout.as_secs());

            state.outcomes.record(self.name(), ScanStatus::Running, OutcomeData::new());

            let scan_start = Instant::now();
            match self.scan(&task, &state).await {
                Ok(data) => {
                    log::debug!("[scanner] task_completed: scanner={} count={} duration={}ms",
                        self.name(), task_count, scan_start.elapsed().as_millis());
                    state.outcomes.record(self.name(), ScanStatus::Completed, data);
                }
                Err(error) => {
                    log::error!("[scanner] task_failed: scanner={} count={} host={} duration={}ms error={}",
                        self.name(), task_count, task.host, scan_start.elapsed().as_millis(), error);
                    state.outcomes.record(self.name(), ScanStatus::Failed, OutcomeData::new());
                }
            }
            state.task_finished();
        }

        log::debug!("[scanner] stopped: scanner={} tasks={}", self.name(), task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Host;
    use serde_json::json;

    /// Fails tasks whose origin is `10.0.0.1` with a handshake error.
    struct ScriptedScanner;

    #[async_trait]
    impl Scanner for ScriptedScanner {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn kind(&self) -> ScanKind {
            ScanKind::Tcp
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn scan(&self, task: &ScanTask, _state: &AppState) -> Result<OutcomeData, ScanError> {
            if task.host.origin == "10.0.0.1" {
                return Err(ScanError::handshake(task.host.host_port(), "scripted failure"));
            }
            let mut data = OutcomeData::new();
            data.insert("origin".to_string(), json!(task.host.origin));
            Ok(data)
        }
    }

    fn task(origin: &str) -> ScanTask {
        ScanTask::new(ScanKind::Tcp, Host::parse(origin, 443).unwrap(), 1, 0)
    }

    async fn wait_for_status(state: &AppState, id: &str, status: ScanStatus) {
        for _ in 0..100 {
            if state.outcomes.get(id).map(|o| o.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}", id, status);
    }

    #[tokio::test]
    async fn test_worker_survives_failed_task() {
        let state = Arc::new(AppState::default());
        let worker = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { ScriptedScanner.run(state).await })
        };

        let mut feed = state.outcomes.subscribe();
        state.queues.enqueue(ScanKind::Tcp, task("10.0.0.1")).unwrap();
        state.queues.enqueue(ScanKind::Tcp, task("10.0.0.2")).unwrap();

        let mut statuses = Vec::new();
        while statuses.len() < 4 {
            let outcome = tokio::time::timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
            statuses.push((outcome.status, outcome.data));
        }

        assert_eq!(statuses[0].0, ScanStatus::Running);
        assert_eq!(statuses[1].0, ScanStatus::Failed);
        assert!(statuses[1].1.is_empty());
        assert_eq!(statuses[2].0, ScanStatus::Running);
        assert_eq!(statuses[3].0, ScanStatus::Completed);
        assert_eq!(statuses[3].1.get("origin"), Some(&json!("10.0.0.2")));

        state.shutdown();
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_worker_waits_for_queue_to_appear() {
        let state = Arc::new(AppState::default());
        let worker = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { ScriptedScanner.run(state).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!worker.is_finished());
        assert!(state.outcomes.get("scripted").is_none());

        state.queues.enqueue(ScanKind::Tcp, task("10.0.0.5")).unwrap();
        wait_for_status(&state, "scripted", ScanStatus::Completed).await;

        state.shutdown();
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_removed() {
        let state = Arc::new(AppState::default());
        state.queues.enqueue(ScanKind::Tcp, task("10.0.0.3")).unwrap();
        let worker = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { ScriptedScanner.run(state).await })
        };

        wait_for_status(&state, "scripted", ScanStatus::Completed).await;
        state.queues.remove(ScanKind::Tcp);

        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
        assert!(!state.should_stop());
    }

    #[tokio::test]
    async fn test_worker_observes_stop_flag_without_queue() {
        let state = Arc::new(AppState::default());
        state.shutdown();
        tokio::time::timeout(Duration::from_secs(1), ScriptedScanner.run(Arc::clone(&state)))
            .await
            .unwrap();
    }
}

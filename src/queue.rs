use crate::error::ScanError;
use crate::types::{ScanKind, ScanTask};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

struct QueueInner {
    tasks: VecDeque<ScanTask>,
    closed: bool,
}

/// Bounded FIFO of tasks for one scan kind.
///
/// Pushing never waits. Popping waits until a task arrives or the queue
/// is closed; after `close` pending tasks are dropped and every read
/// returns `QueueClosed`.
pub struct TaskQueue {
    kind: ScanKind,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(kind: ScanKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn try_push(&self, task: ScanTask) -> Result<(), ScanError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(ScanError::QueueClosed);
            }
            if inner.tasks.len() >= self.capacity {
                return Err(ScanError::QueueFull {
                    kind: self.kind,
                    capacity: self.capacity,
                });
            }
            inner.tasks.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.tasks.clear();
        }
        self.notify.notify_waiters();
    }

    fn try_pop(&self) -> Result<Option<ScanTask>, ScanError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ScanError::QueueClosed);
        }
        Ok(inner.tasks.pop_front())
    }

    /// Wait for the next task.
    pub async fn recv(&self) -> Result<ScanTask, ScanError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push or close between the check
            // and the await is not missed.
            notified.as_mut().enable();

            if let Some(task) = self.try_pop()? {
                return Ok(task);
            }
            notified.await;
        }
    }

    /// Wait for the next task or for `wait` to elapse, whichever is first.
    pub async fn recv_timeout(&self, wait: Duration) -> Result<Option<ScanTask>, ScanError> {
        match tokio::time::timeout(wait, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Maps each scan kind to its task queue.
///
/// Every operation holds the registry lock only for the map access itself;
/// callers await on the returned queue handle with no lock held.
pub struct TaskQueueRegistry {
    capacity: usize,
    queues: RwLock<HashMap<ScanKind, Arc<TaskQueue>>>,
}

impl Default for TaskQueueRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl TaskQueueRegistry {
    pub fn new(capacity: usize) -> Self {
        log::debug!("[queue] new: capacity={}", capacity);
        Self {
            capacity,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Push a task, creating the kind's queue on first use.
    pub fn enqueue(&self, kind: ScanKind, task: ScanTask) -> Result<(), ScanError> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue = queues
            .entry(kind)
            .or_insert_with(|| {
                log::debug!("[queue] created: kind={} capacity={}", kind, self.capacity);
                Arc::new(TaskQueue::new(kind, self.capacity))
            })
            .clone();

        match queue.try_push(task) {
            Ok(()) => {
                log::debug!("[queue] enqueued: kind={} pending={}/{}", kind, queue.len(), queue.capacity());
                Ok(())
            }
            Err(e) => {
                log::warn!("[queue] enqueue_failed: kind={} error={}", kind, e);
                Err(e)
            }
        }
    }

    /// Current queue for `kind`, or `None` if nothing was ever enqueued for it.
    pub fn lookup(&self, kind: ScanKind) -> Option<Arc<TaskQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Close the queue for `kind` and forget it.
    pub fn remove(&self, kind: ScanKind) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = queues.remove(&kind) {
            queue.close();
            log::debug!("[queue] removed: kind={}", kind);
        }
    }

    pub fn kinds(&self) -> Vec<ScanKind> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Close and remove every queue.
    pub fn shutdown(&self) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        for (kind, queue) in queues.drain() {
            queue.close();
            log::debug!("[queue] closed_on_shutdown: kind={}", kind);
        }
    }
}

use std::sync::Arc;
use tokio::sync::watch;

/// Counter of in-flight background tasks.
///
/// Clones share the same count. Every registration hands out a [`TaskGuard`];
/// the count drops when the guard does, so a task that returns early or
/// panics is still released.
#[derive(Debug, Clone)]
pub struct TaskCounter {
    count: Arc<watch::Sender<usize>>,
}

impl TaskCounter {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0usize);
        Self {
            count: Arc::new(count),
        }
    }

    /// Register one task. Must happen before the task is spawned.
    pub fn register(&self) -> TaskGuard {
        self.count.send_modify(|count| *count += 1);
        TaskGuard {
            counter: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until every registered task has been released
    pub async fn wait_idle(&self) {
        let mut receiver = self.count.subscribe();
        // The sender lives as long as `self`, so this only returns once idle.
        let _ = receiver.wait_for(|count| *count == 0).await;
    }

    fn release(&self) {
        self.count
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of one in-flight task; releases it on drop.
#[must_use = "the task is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TaskGuard {
    counter: TaskCounter,
}

impl TaskGuard {
    /// Release the task explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.release();
    }
}

use super::signal::CancelSignal;
use super::state::LifecycleState;
use super::tasks::{TaskCounter, TaskGuard};
use crate::error::{LifecycleError, Result, ServerError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// Default depth of the async error channel
pub const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 1;

/// Upper bound on compare-and-swap retries in `transition_to_stopping`. A retry
/// only happens after another caller committed a transition, and states only
/// move forward, so a handful of attempts always suffices.
const STOPPING_RETRY_LIMIT: usize = 16;

/// Construction options for [`LifecycleController`]
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    error_channel_capacity: usize,
}

impl ControllerOptions {
    pub fn new() -> Self {
        Self {
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
        }
    }

    /// Set the async error buffer depth (at least 1)
    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity.max(1);
        self
    }

    pub fn error_channel_capacity(&self) -> usize {
        self.error_channel_capacity
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-only handle on a controller's async error channel.
///
/// Clones share one underlying receiver, so each error is observed by exactly
/// one receiver. `recv` returns `None` once the channel has been closed and
/// drained, meaning the server is fully stopped.
#[derive(Debug, Clone)]
pub struct ErrorReceiver {
    inner: Arc<tokio::sync::Mutex<mpsc::Receiver<ServerError>>>,
}

impl ErrorReceiver {
    /// Wait for the next error. Cancel safe.
    pub async fn recv(&self) -> Option<ServerError> {
        self.inner.lock().await.recv().await
    }

    /// Take a buffered error without waiting. Reports `Empty` while another
    /// clone is blocked in `recv`.
    pub fn try_recv(&self) -> std::result::Result<ServerError, TryRecvError> {
        match self.inner.try_lock() {
            Ok(mut receiver) => receiver.try_recv(),
            Err(_) => Err(TryRecvError::Empty),
        }
    }
}

/// Concurrency-safe lifecycle state machine shared by every server type.
///
/// ```text
/// Created --start(ok)--------> Starting --running--> Running
/// Created --start(cancelled)-> Failed
/// Starting --failed----------> Failed
/// Starting/Running --stopping--> Stopping --stopped--> Stopped
/// Created --stopping---------> Stopped
/// ```
///
/// An instance is single-use: once `Stopped` or `Failed`, build a new one.
/// State reads are lock-free; `last_error` and the error sender sit behind
/// short-lived mutexes.
pub struct LifecycleController {
    state: AtomicU8,
    // Also serializes the write of `state` to Failed so that a reader who sees
    // Failed always finds the cause recorded.
    last_error: Mutex<Option<ServerError>>,
    cancellation: OnceLock<CancellationToken>,
    ready: watch::Sender<bool>,
    // Mirror of `state` for waiters; republished after every committed transition.
    observed: watch::Sender<LifecycleState>,
    error_tx: Mutex<Option<mpsc::Sender<ServerError>>>,
    errors: ErrorReceiver,
    tasks: TaskCounter,
}

impl LifecycleController {
    /// Create a controller in the `Created` state
    pub fn new(options: ControllerOptions) -> Self {
        let (error_tx, error_rx) = mpsc::channel(options.error_channel_capacity.max(1));
        let (ready, _) = watch::channel(false);
        let (observed, _) = watch::channel(LifecycleState::Created);

        Self {
            state: AtomicU8::new(LifecycleState::Created.as_raw()),
            last_error: Mutex::new(None),
            cancellation: OnceLock::new(),
            ready,
            observed,
            error_tx: Mutex::new(Some(error_tx)),
            errors: ErrorReceiver {
                inner: Arc::new(tokio::sync::Mutex::new(error_rx)),
            },
            tasks: TaskCounter::new(),
        }
    }

    /// Current state (lock-free)
    pub fn state(&self) -> LifecycleState {
        // Only values produced by `LifecycleState::as_raw` are ever stored.
        LifecycleState::try_from(self.state.load(Ordering::SeqCst))
            .unwrap_or(LifecycleState::Failed)
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// The cause of the `Failed` state, `None` in any other state
    pub fn last_error(&self) -> Option<ServerError> {
        self.last_error.lock().clone()
    }

    /// Token cancelled when the server stops or fails. `None` before `Starting`.
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.cancellation.get().cloned()
    }

    pub fn errors(&self) -> ErrorReceiver {
        self.errors.clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.count()
    }

    /// Move `Created -> Starting` and allocate the cancellation token.
    ///
    /// The caller's signal is checked first: a signal that already fired fails
    /// the instance before any startup work can race it to `Running`.
    pub fn transition_to_starting(&self, signal: &CancelSignal) -> Result<()> {
        if let Some(cause) = signal.cause() {
            let err: ServerError = LifecycleError::CancelledBeforeStart { cause }.into();
            if self.record_failure(err.clone(), Some(LifecycleState::Created)) {
                return Err(err);
            }
            return Err(self.invalid_transition("start"));
        }

        if self
            .state
            .compare_exchange(
                LifecycleState::Created.as_raw(),
                LifecycleState::Starting.as_raw(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(self.invalid_transition("start"));
        }

        let token = CancellationToken::new();
        let _ = self.cancellation.set(token.clone());
        self.publish_state();

        // A concurrent stop or failure may have left Starting before the token
        // was published; it could not cancel what it could not see.
        if self.state() != LifecycleState::Starting {
            token.cancel();
        }

        debug!("Lifecycle transitioned to starting");
        Ok(())
    }

    /// Move `Starting -> Running` and fire the ready signal.
    ///
    /// Ignored in any other state, so duplicate or late calls are harmless.
    pub fn transition_to_running(&self) {
        if self
            .state
            .compare_exchange(
                LifecycleState::Starting.as_raw(),
                LifecycleState::Running.as_raw(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.ready.send_replace(true);
            self.publish_state();
            debug!("Lifecycle transitioned to running");
        }
    }

    /// Force `Failed`, record `err` and cancel background work.
    ///
    /// Applies from any state. The error is also offered to the error channel
    /// without blocking.
    pub fn transition_to_failed(&self, err: ServerError) {
        self.record_failure(err, None);
    }

    /// Begin shutdown.
    ///
    /// Returns `true` for exactly one caller, the one that moved a `Starting`
    /// or `Running` instance to `Stopping`; that caller must finish the
    /// teardown. A never-started instance goes straight to `Stopped`.
    pub fn transition_to_stopping(&self) -> bool {
        for _ in 0..STOPPING_RETRY_LIMIT {
            let current = self.state();
            match current {
                LifecycleState::Stopped | LifecycleState::Failed | LifecycleState::Stopping => {
                    return false
                }
                LifecycleState::Created => {
                    if self.swap_state(LifecycleState::Created, LifecycleState::Stopped) {
                        self.publish_state();
                        debug!("Lifecycle stopped before it was started");
                        return false;
                    }
                }
                LifecycleState::Starting | LifecycleState::Running => {
                    if self.swap_state(current, LifecycleState::Stopping) {
                        if let Some(token) = self.cancellation.get() {
                            token.cancel();
                        }
                        self.publish_state();
                        debug!(from = %current, "Lifecycle transitioned to stopping");
                        return true;
                    }
                }
            }
        }

        warn!(
            state = %self.state(),
            "Gave up moving to stopping after {} contended attempts",
            STOPPING_RETRY_LIMIT
        );
        false
    }

    /// Mark the instance fully stopped. Call only after every task is released.
    ///
    /// A `Failed` instance stays failed.
    pub fn transition_to_stopped(&self) {
        let failed = LifecycleState::Failed.as_raw();
        let stopped = LifecycleState::Stopped.as_raw();
        let result = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                (raw != failed).then_some(stopped)
            });
        if result.is_ok() {
            self.publish_state();
            debug!("Lifecycle transitioned to stopped");
        }
    }

    /// Resolves once the ready signal has fired
    pub async fn ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Wait until `Running`, the instance halts, or `signal` fires.
    ///
    /// Halting covers every path past `Running` or around it (stopping,
    /// stopped, failed), including one taken while this call was already
    /// waiting on a `Created` instance.
    pub async fn wait_until_ready(&self, signal: &CancelSignal) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.ready() => Ok(()),
            _ = self.halted() => {
                if self.is_ready() {
                    Ok(())
                } else {
                    Err(LifecycleError::FailedBeforeReady.into())
                }
            }
            cause = signal.done() => Err(LifecycleError::ReadyWait { cause }.into()),
        }
    }

    /// Resolves once the state is `Stopping` or later
    pub async fn halted(&self) {
        self.wait_for_state(|state| *state >= LifecycleState::Stopping)
            .await;
    }

    /// Resolves once the state is `Stopped` or `Failed`
    pub async fn wait_until_terminal(&self) {
        self.wait_for_state(LifecycleState::is_terminal).await;
    }

    async fn wait_for_state<F>(&self, predicate: F)
    where
        F: FnMut(&LifecycleState) -> bool,
    {
        let mut observed = self.observed.subscribe();
        // The sender lives as long as `self`, so this only returns on a match.
        let _ = observed.wait_for(predicate).await;
    }

    /// Wait until every registered task has been released
    pub async fn wait_until_shutdown(&self) {
        self.tasks.wait_idle().await;
    }

    /// Register a background task; it is released when the guard drops
    pub fn register_task(&self) -> TaskGuard {
        self.tasks.register()
    }

    /// Register and spawn a background task on the current runtime
    pub fn spawn_task<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.register_task();
        tokio::spawn(
            async move {
                let _guard = guard;
                task.await;
            }
            .instrument(tracing::debug_span!("task", name)),
        )
    }

    /// Offer an error to observers without changing state. Dropped when the
    /// channel is full or closed.
    pub fn report_async_error(&self, err: ServerError) {
        self.send_error(err);
    }

    /// Close the error channel; observers see end-of-stream after draining.
    pub fn close_error_channel(&self) {
        if self.error_tx.lock().take().is_none() {
            debug!("Error channel already closed");
        }
    }

    fn record_failure(&self, err: ServerError, expected: Option<LifecycleState>) -> bool {
        {
            let mut last_error = self.last_error.lock();
            match expected {
                Some(expected) => {
                    if !self.swap_state(expected, LifecycleState::Failed) {
                        return false;
                    }
                }
                None => self
                    .state
                    .store(LifecycleState::Failed.as_raw(), Ordering::SeqCst),
            }
            *last_error = Some(err.clone());
        }
        self.publish_state();

        if let Some(token) = self.cancellation.get() {
            token.cancel();
        }

        warn!(error = %err, "Lifecycle transitioned to failed");
        self.send_error(err);
        true
    }

    fn send_error(&self, err: ServerError) {
        let sender = self.error_tx.lock();
        match sender.as_ref() {
            Some(tx) => match tx.try_send(err) {
                Ok(()) => {}
                Err(TrySendError::Full(err)) => {
                    debug!(error = %err, "Error channel full, dropping error");
                }
                Err(TrySendError::Closed(err)) => {
                    debug!(error = %err, "Error channel has no receiver, dropping error");
                }
            },
            None => debug!(error = %err, "Error channel closed, dropping error"),
        }
    }

    /// Copy the committed state into the watch. The atomic is re-read under
    /// the watch lock, so the last publisher always leaves the latest value.
    fn publish_state(&self) {
        self.observed.send_if_modified(|observed| {
            let current = self.state();
            if *observed == current {
                return false;
            }
            *observed = current;
            true
        });
    }

    fn swap_state(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from.as_raw(), to.as_raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn invalid_transition(&self, operation: &'static str) -> ServerError {
        LifecycleError::InvalidTransition {
            operation,
            state: self.state(),
        }
        .into()
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new(ControllerOptions::default())
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state())
            .field("tasks", &self.task_count())
            .finish()
    }
}

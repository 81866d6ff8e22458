use super::controller::{ErrorReceiver, LifecycleController};
use super::signal::CancelSignal;
use super::state::LifecycleState;
use crate::error::{Result, ServerError};
use async_trait::async_trait;
use tracing::{error, info};

/// Anything whose lifecycle is driven by a [`LifecycleController`].
///
/// The provided methods are the read-only surface every adapter exposes.
pub trait Managed {
    fn lifecycle(&self) -> &LifecycleController;

    fn state(&self) -> LifecycleState {
        self.lifecycle().state()
    }

    fn is_running(&self) -> bool {
        self.lifecycle().is_running()
    }

    fn last_error(&self) -> Option<ServerError> {
        self.lifecycle().last_error()
    }

    fn errors(&self) -> ErrorReceiver {
        self.lifecycle().errors()
    }
}

/// A startable, stoppable server.
#[async_trait]
pub trait Service: Managed + Send + Sync {
    /// Block until the server is `Running`, or fail.
    async fn start(&self, signal: &CancelSignal) -> Result<()>;

    /// Stop the server. Idempotent and safe to call concurrently.
    async fn stop(&self);
}

/// Run a started service until `stop` fires or the service reports an async
/// error, then stop it.
///
/// Returns the reported error, if that is what ended supervision.
pub async fn supervise(service: &dyn Service, stop: CancelSignal) -> Result<()> {
    let errors = service.errors();

    let outcome = tokio::select! {
        cause = stop.done() => {
            info!(%cause, "Stop requested, shutting down");
            Ok(())
        }
        reported = errors.recv() => match reported {
            Some(err) => {
                error!(error = %err, "Server reported an error, shutting down");
                Err(err)
            }
            None => Ok(()),
        },
    };

    service.stop().await;
    outcome
}

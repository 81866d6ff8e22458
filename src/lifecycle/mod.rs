//! Server lifecycle state machine.
//!
//! [`LifecycleController`] holds the state, the cancellation token handed to
//! background work, the ready signal, the async error channel and the task
//! counter. Concrete servers embed one and implement [`Service`].

mod controller;
mod managed;
mod signal;
mod state;
mod tasks;

pub use controller::{
    ControllerOptions, ErrorReceiver, LifecycleController, DEFAULT_ERROR_CHANNEL_CAPACITY,
};
pub use managed::{supervise, Managed, Service};
pub use signal::{CancelCause, CancelSignal};
pub use state::LifecycleState;
pub use tasks::{TaskCounter, TaskGuard};

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod server;

pub use config::HostlinkConfig;
pub use error::{LifecycleError, Result, ServerError, TokenError};
pub use lifecycle::{
    supervise, CancelCause, CancelSignal, ControllerOptions, ErrorReceiver, LifecycleController,
    LifecycleState, Managed, Service,
};
pub use server::{CallbackServer, CallbackServerBuilder, ConnectionInfo, TokenStore};

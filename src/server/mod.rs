//! Token-authenticated callback server built on the lifecycle controller.

mod callback;
mod tokens;
mod transport;

pub use callback::{CallbackServer, CallbackServerBuilder, ConnectionInfo};
pub use tokens::{Clock, ManualClock, SystemClock, Token, TokenStore, TOKEN_BYTES};
pub use transport::{
    is_closed_conn_error, AcceptLoop, AcceptLoopFactory, ConnectionHandler, RejectAllHandler,
    Transport, TransportFactory,
};

#[cfg(test)]
mod tests;

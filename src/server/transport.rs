//! Connection serving behind the callback server.
//!
//! The server only needs something that can be built under the startup
//! deadline, serve a bound listener, and shut down. [`AcceptLoop`] is the
//! default: a bounded accept loop handing each connection to a
//! [`ConnectionHandler`].

use super::tokens::TokenStore;
use crate::error::{Result, ServerError};
use crate::lifecycle::TaskCounter;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds the serving subsystem during startup
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self, tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Serve until the listener closes or shutdown is requested.
    ///
    /// `Ok(())` is an expected close; any error is reported as a serve error.
    async fn serve(&self, listener: TcpListener) -> Result<()>;

    /// Stop accepting and drain in-flight connections
    async fn shutdown(&self) -> Result<()>;
}

/// Per-connection protocol
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tokens: Arc<TokenStore>,
        cancel: CancellationToken,
    );
}

/// Accept errors that mean the socket went away underneath us, which is
/// expected while shutting down.
pub fn is_closed_conn_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
    )
}

/// Closes every connection without speaking any protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllHandler;

#[async_trait]
impl ConnectionHandler for RejectAllHandler {
    async fn handle(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        _tokens: Arc<TokenStore>,
        _cancel: CancellationToken,
    ) {
        debug!(peer = %peer, "No protocol handler configured, closing connection");
        if let Err(e) = stream.shutdown().await {
            if !is_closed_conn_error(&e) {
                warn!(peer = %peer, error = %e, "Failed to close connection");
            }
        }
    }
}

/// Accept loop bounded by a connection-limit semaphore.
///
/// When the limit is reached new connections wait in the listen backlog until
/// a slot frees up.
pub struct AcceptLoop {
    handler: Arc<dyn ConnectionHandler>,
    tokens: Arc<TokenStore>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    shutdown: CancellationToken,
    connections: TaskCounter,
}

impl AcceptLoop {
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        tokens: Arc<TokenStore>,
        max_connections: usize,
    ) -> Self {
        Self {
            handler,
            tokens,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            shutdown: CancellationToken::new(),
            connections: TaskCounter::new(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.connections.count()
    }
}

#[async_trait]
impl Transport for AcceptLoop {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(
                        peer = %peer,
                        available_permits = self.connection_limit.available_permits(),
                        "Connection accepted"
                    );
                    let guard = self.connections.register();
                    let handler = Arc::clone(&self.handler);
                    let tokens = Arc::clone(&self.tokens);
                    let cancel = self.shutdown.child_token();
                    tokio::spawn(async move {
                        let _guard = guard;
                        let _permit = permit;
                        handler.handle(stream, peer, tokens, cancel).await;
                    });
                }
                Err(e) if is_closed_conn_error(&e) => {
                    debug!(error = %e, "Listener closed");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::from(e)),
            }
        }

        drop(listener);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.connection_limit.close();
        self.connections.wait_idle().await;
        info!("Accept loop drained");
        Ok(())
    }
}

/// Builds an [`AcceptLoop`] around one shared handler
pub struct AcceptLoopFactory {
    handler: Arc<dyn ConnectionHandler>,
    max_connections: usize,
}

impl AcceptLoopFactory {
    pub fn new(handler: Arc<dyn ConnectionHandler>, max_connections: usize) -> Self {
        Self {
            handler,
            max_connections,
        }
    }

    /// Default transport: closes every connection it accepts
    pub fn reject_all(max_connections: usize) -> Self {
        Self::new(Arc::new(RejectAllHandler), max_connections)
    }
}

#[async_trait]
impl TransportFactory for AcceptLoopFactory {
    async fn build(&self, tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>> {
        if self.max_connections == 0 {
            return Err(ServerError::transport("max_connections must be greater than 0"));
        }
        Ok(Arc::new(AcceptLoop::new(
            Arc::clone(&self.handler),
            tokens,
            self.max_connections,
        )))
    }
}

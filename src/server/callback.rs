use super::tokens::{Clock, SystemClock, Token, TokenStore};
use super::transport::{AcceptLoopFactory, Transport, TransportFactory};
use crate::config::HostlinkConfig;
use crate::error::{LifecycleError, Result, ServerError};
use crate::lifecycle::{
    CancelSignal, ControllerOptions, LifecycleController, LifecycleState, Managed, Service,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// What a spawned command needs to call back into the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub user: String,
    pub expires_at: DateTime<Utc>,
}

/// Resources acquired during startup, published together
#[derive(Default)]
struct ServerHandles {
    transport: Option<Arc<dyn Transport>>,
    listener: Option<TcpListener>,
    addr: Option<SocketAddr>,
}

/// Token-authenticated callback server.
///
/// Commands launched by the host receive a [`ConnectionInfo`] and use it to
/// connect back. The connection protocol is supplied by a
/// [`TransportFactory`]. A server is single-use: once stopped or failed,
/// build a new one.
pub struct CallbackServer {
    config: HostlinkConfig,
    lifecycle: Arc<LifecycleController>,
    handles: Arc<Mutex<ServerHandles>>,
    tokens: Arc<TokenStore>,
    factory: Arc<dyn TransportFactory>,
}

impl CallbackServer {
    /// Server with the default transport, which closes every connection
    pub fn new(config: HostlinkConfig) -> Self {
        let factory = AcceptLoopFactory::reject_all(config.server.max_connections);
        Self::build(config, Arc::new(factory), Arc::new(SystemClock))
    }

    pub fn with_transport(config: HostlinkConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::build(config, factory, Arc::new(SystemClock))
    }

    /// Default transport with a custom token clock
    pub fn with_clock(config: HostlinkConfig, clock: Arc<dyn Clock>) -> Self {
        let factory = AcceptLoopFactory::reject_all(config.server.max_connections);
        Self::build(config, Arc::new(factory), clock)
    }

    pub fn builder() -> CallbackServerBuilder {
        CallbackServerBuilder::new()
    }

    fn build(
        config: HostlinkConfig,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.with_defaults_applied();
        let options = ControllerOptions::new()
            .with_error_channel_capacity(config.lifecycle.error_channel_capacity);
        let tokens = Arc::new(TokenStore::new(config.tokens.ttl(), clock));

        Self {
            lifecycle: Arc::new(LifecycleController::new(options)),
            handles: Arc::new(Mutex::new(ServerHandles::default())),
            tokens,
            factory,
            config,
        }
    }

    pub fn config(&self) -> &HostlinkConfig {
        &self.config
    }

    /// Start the server and wait until it accepts connections.
    ///
    /// Bounded by the configured startup timeout and by `signal`. After an
    /// `Ok` return, watch [`Managed::errors`] for runtime failures.
    pub async fn start(&self, signal: &CancelSignal) -> Result<()> {
        self.lifecycle.transition_to_starting(signal)?;

        let startup = signal.with_timeout(self.config.lifecycle.startup_timeout());
        let address = self.config.bind_address();
        info!(
            server = %self.config.server.name,
            address = %address,
            "Starting callback server"
        );

        // Present once Starting was reached
        let Some(shutdown) = self.lifecycle.cancellation_token() else {
            return Err(self.fail_startup(ServerError::system(
                "lifecycle token missing after start",
            )));
        };

        let acquired = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(self.abandon_startup()),
            cause = startup.done() => Err(LifecycleError::StartupTimeout { cause }.into()),
            acquired = self.acquire(&address) => acquired,
        };
        let (listener, addr, transport) = match acquired {
            Ok(acquired) => acquired,
            Err(err) => return Err(self.fail_startup(err)),
        };

        {
            let mut handles = self.handles.lock();
            handles.listener = Some(listener);
            handles.transport = Some(Arc::clone(&transport));
            handles.addr = Some(addr);
        }

        self.spawn_serve(transport, shutdown.clone());
        self.spawn_token_sweeper(shutdown.clone());

        let errors = self.lifecycle.errors();
        tokio::select! {
            biased;
            _ = self.lifecycle.ready() => {
                if self.lifecycle.state() != LifecycleState::Running {
                    return Err(self.abandon_startup());
                }
                info!(server = %self.config.server.name, address = %addr, "Callback server started");
                Ok(())
            }
            reported = errors.recv() => match reported {
                Some(err) => Err(self.fail_startup(err)),
                None => Err(self.abandon_startup()),
            },
            _ = shutdown.cancelled() => Err(self.abandon_startup()),
            cause = startup.done() => {
                Err(self.fail_startup(LifecycleError::StartupTimeout { cause }.into()))
            }
        }
    }

    /// Stop the server, waiting for in-flight work.
    ///
    /// Safe to call any number of times from any task; only the first caller
    /// on a started server performs the shutdown, the rest wait until it has
    /// reached `Stopped` (or the instance failed).
    pub async fn stop(&self) {
        if !self.lifecycle.transition_to_stopping() {
            self.lifecycle.wait_until_terminal().await;
            self.lifecycle.wait_until_shutdown().await;
            self.discard_handles();
            self.lifecycle.close_error_channel();
            return;
        }

        info!(server = %self.config.server.name, "Stopping callback server");

        let transport = {
            let mut handles = self.handles.lock();
            handles.listener = None;
            handles.addr = None;
            handles.transport.take()
        };

        if let Some(transport) = transport {
            let timeout = self.config.lifecycle.shutdown_timeout();
            match tokio::time::timeout(timeout, transport.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Transport shutdown failed"),
                Err(_) => warn!(
                    "Transport shutdown did not finish within {:?}",
                    timeout
                ),
            }
        }

        self.lifecycle.wait_until_shutdown().await;
        // A start racing this stop may have published late
        self.discard_handles();
        self.lifecycle.transition_to_stopped();
        self.lifecycle.close_error_channel();

        info!(server = %self.config.server.name, "Callback server stopped");
    }

    /// Block until every background task has finished, returning the failure
    /// cause if the server failed.
    pub async fn wait(&self) -> Result<()> {
        self.lifecycle.wait_until_shutdown().await;
        match self.lifecycle.last_error() {
            Some(err) if self.lifecycle.state() == LifecycleState::Failed => Err(err),
            _ => Ok(()),
        }
    }

    /// Bound socket address, `None` unless started and not yet stopped
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handles.lock().addr
    }

    /// Bound `host:port`, empty when not bound
    pub fn address(&self) -> String {
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Bound port, 0 when not bound
    pub fn port(&self) -> u16 {
        self.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Configured host
    pub fn host(&self) -> &str {
        &self.config.server.host
    }

    pub fn generate_token(&self, command_id: &str) -> Result<Token> {
        self.tokens.generate(command_id)
    }

    pub fn validate_token(&self, value: &str) -> Option<Token> {
        self.tokens.validate(value)
    }

    pub fn revoke_token(&self, value: &str) {
        self.tokens.revoke(value);
    }

    pub fn revoke_tokens_for_command(&self, command_id: &str) -> usize {
        self.tokens.revoke_for_command(command_id)
    }

    pub fn token_store(&self) -> Arc<TokenStore> {
        Arc::clone(&self.tokens)
    }

    /// Issue a token for `command_id` along with where to connect.
    ///
    /// Only available while `Running`.
    pub fn connection_info(&self, command_id: &str) -> Result<ConnectionInfo> {
        let state = self.lifecycle.state();
        if state != LifecycleState::Running {
            return Err(ServerError::NotRunning { state });
        }

        let token = self.generate_token(command_id)?;
        Ok(ConnectionInfo {
            host: self.config.server.host.clone(),
            port: self.port(),
            token: token.value,
            user: self.config.server.user.clone(),
            expires_at: token.expires_at,
        })
    }

    async fn acquire(
        &self,
        address: &str,
    ) -> Result<(TcpListener, SocketAddr, Arc<dyn Transport>)> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::Listen {
                address: address.to_string(),
                source: Arc::new(e),
            })?;
        let addr = listener.local_addr()?;
        debug!(address = %addr, "Listener bound");

        let transport = self.factory.build(Arc::clone(&self.tokens)).await?;
        Ok((listener, addr, transport))
    }

    fn spawn_serve(
        &self,
        transport: Arc<dyn Transport>,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let handles = Arc::clone(&self.handles);

        self.lifecycle.spawn_task("serve", async move {
            lifecycle.transition_to_running();

            let listener = handles.lock().listener.take();
            let Some(listener) = listener else {
                debug!("Listener released before serving");
                return;
            };
            if !lifecycle.is_running() {
                return;
            }

            tokio::select! {
                result = transport.serve(listener) => match result {
                    Ok(()) => debug!("Transport finished serving"),
                    Err(err) if lifecycle.is_running() => {
                        error!(error = %err, "Serve error");
                        lifecycle.report_async_error(ServerError::serve(err.to_string()));
                    }
                    Err(err) => debug!(error = %err, "Serve error during shutdown ignored"),
                },
                _ = shutdown.cancelled() => {}
            }
        });
    }

    fn spawn_token_sweeper(&self, shutdown: tokio_util::sync::CancellationToken) {
        let tokens = Arc::clone(&self.tokens);
        let period = self.config.tokens.sweep_interval();

        self.lifecycle.spawn_task("token-sweeper", async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokens.sweep_expired();
                    }
                }
            }
        });
    }

    fn fail_startup(&self, err: ServerError) -> ServerError {
        error!(server = %self.config.server.name, error = %err, "Callback server failed to start");
        self.lifecycle.transition_to_failed(err.clone());
        self.discard_handles();
        err
    }

    /// Startup was superseded by a concurrent stop or failure
    fn abandon_startup(&self) -> ServerError {
        // A stop in progress owns the handles and shuts the transport down
        if self.lifecycle.state() != LifecycleState::Stopping {
            self.discard_handles();
        }
        debug!(state = %self.lifecycle.state(), "Startup abandoned");
        self.lifecycle
            .last_error()
            .unwrap_or_else(|| LifecycleError::FailedBeforeReady.into())
    }

    fn discard_handles(&self) {
        let mut handles = self.handles.lock();
        handles.listener = None;
        handles.transport = None;
        handles.addr = None;
    }
}

impl Managed for CallbackServer {
    fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }
}

#[async_trait]
impl Service for CallbackServer {
    async fn start(&self, signal: &CancelSignal) -> Result<()> {
        CallbackServer::start(self, signal).await
    }

    async fn stop(&self) {
        CallbackServer::stop(self).await
    }
}

/// Builder for [`CallbackServer`]
#[derive(Default)]
pub struct CallbackServerBuilder {
    config: Option<HostlinkConfig>,
    factory: Option<Arc<dyn TransportFactory>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CallbackServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: HostlinkConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the server, validating the configuration first
    pub fn build(self) -> Result<CallbackServer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(AcceptLoopFactory::reject_all(config.server.max_connections))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(CallbackServer::build(config, factory, clock))
    }
}

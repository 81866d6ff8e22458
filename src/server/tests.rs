use super::*;
use crate::config::HostlinkConfig;
use crate::error::{LifecycleError, Result, ServerError};
use crate::lifecycle::{supervise, CancelCause, CancelSignal, LifecycleState, Managed};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn create_test_config() -> HostlinkConfig {
    let mut config = HostlinkConfig::default();
    config.lifecycle.startup_timeout_ms = 2_000;
    config.lifecycle.shutdown_timeout_ms = 2_000;
    config
}

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ))
}

struct SlowFactory;

#[async_trait]
impl TransportFactory for SlowFactory {
    async fn build(&self, _tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ServerError::transport("never finishes in time"))
    }
}

struct FailingFactory;

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn build(&self, _tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>> {
        Err(ServerError::transport("handshake keys unavailable"))
    }
}

/// Serves briefly, then fails
struct FlakyTransport;

#[async_trait]
impl Transport for FlakyTransport {
    async fn serve(&self, _listener: TcpListener) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(ServerError::system("accept queue corrupted"))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct FlakyFactory;

#[async_trait]
impl TransportFactory for FlakyFactory {
    async fn build(&self, _tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(FlakyTransport))
    }
}

/// Serves until shut down; shutdown takes a while to drain
struct SlowShutdownTransport {
    closed: CancellationToken,
}

#[async_trait]
impl Transport for SlowShutdownTransport {
    async fn serve(&self, _listener: TcpListener) -> Result<()> {
        self.closed.cancelled().await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }
}

struct SlowShutdownFactory;

#[async_trait]
impl TransportFactory for SlowShutdownFactory {
    async fn build(&self, _tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(SlowShutdownTransport {
            closed: CancellationToken::new(),
        }))
    }
}

/// Fails its own server right after the ready signal fires
struct FailAfterReadyTransport {
    server: Arc<OnceLock<Weak<CallbackServer>>>,
}

#[async_trait]
impl Transport for FailAfterReadyTransport {
    async fn serve(&self, _listener: TcpListener) -> Result<()> {
        if let Some(server) = self.server.get().and_then(Weak::upgrade) {
            server
                .lifecycle()
                .transition_to_failed(ServerError::system("listener lost after ready"));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct FailAfterReadyFactory {
    server: Arc<OnceLock<Weak<CallbackServer>>>,
}

#[async_trait]
impl TransportFactory for FailAfterReadyFactory {
    async fn build(&self, _tokens: Arc<TokenStore>) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(FailAfterReadyTransport {
            server: Arc::clone(&self.server),
        }))
    }
}

/// Replies `ok <command>` for a live token and `denied` otherwise
struct TokenCheckHandler;

#[async_trait]
impl ConnectionHandler for TokenCheckHandler {
    async fn handle(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        tokens: Arc<TokenStore>,
        _cancel: CancellationToken,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        if let Ok(Some(line)) = lines.next_line().await {
            let reply = match tokens.validate(line.trim()) {
                Some(token) => format!("ok {}\n", token.command_id),
                None => "denied\n".to_string(),
            };
            let _ = writer.write_all(reply.as_bytes()).await;
        }
    }
}

async fn ask(addr: SocketAddr, token: &str) -> String {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{}\n", token).as_bytes())
        .await
        .unwrap();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await.unwrap();
    line.trim().to_string()
}

#[test]
fn test_token_generation() {
    let clock = manual_clock();
    let store = TokenStore::new(Duration::from_secs(3600), clock.clone());

    let token = store.generate("cmd-1").unwrap();
    assert_eq!(token.value.len(), TOKEN_BYTES * 2);
    assert!(token.value.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(token.command_id, "cmd-1");
    assert_eq!(token.created_at, clock.now());
    assert_eq!(token.expires_at - token.created_at, chrono::Duration::hours(1));

    let other = store.generate("cmd-1").unwrap();
    assert_ne!(token.value, other.value);
    assert_eq!(store.len(), 2);
}

#[test]
fn test_token_validation_and_expiry() {
    let clock = manual_clock();
    let store = TokenStore::new(Duration::from_secs(60), clock.clone());
    let token = store.generate("cmd-1").unwrap();

    assert!(store.validate("").is_none());
    assert!(store.validate("   ").is_none());
    assert!(store.validate("not-a-token").is_none());
    assert_eq!(store.validate(&token.value).unwrap(), token);

    // Still valid at the exact expiry instant
    clock.advance(Duration::from_secs(60));
    assert!(store.validate(&token.value).is_some());

    clock.advance(Duration::from_secs(1));
    assert!(store.validate(&token.value).is_none());
    assert!(store.is_empty());
}

#[test]
fn test_token_revocation() {
    let store = TokenStore::new(Duration::from_secs(60), manual_clock());
    let first = store.generate("build").unwrap();
    store.generate("build").unwrap();
    let other = store.generate("deploy").unwrap();

    store.revoke(&first.value);
    assert!(store.validate(&first.value).is_none());
    assert_eq!(store.len(), 2);

    assert_eq!(store.revoke_for_command("build"), 1);
    assert_eq!(store.revoke_for_command("build"), 0);
    assert!(store.validate(&other.value).is_some());
}

#[test]
fn test_token_sweep() {
    let clock = manual_clock();
    let store = TokenStore::new(Duration::from_secs(60), clock.clone());
    store.generate("old").unwrap();
    clock.advance(Duration::from_secs(30));
    let fresh = store.generate("fresh").unwrap();

    clock.advance(Duration::from_secs(45));
    assert_eq!(store.sweep_expired(), 1);
    assert_eq!(store.len(), 1);
    assert!(store.validate(&fresh.value).is_some());
}

#[test]
fn test_closed_conn_errors() {
    use std::io::{Error, ErrorKind};
    assert!(is_closed_conn_error(&Error::from(ErrorKind::ConnectionReset)));
    assert!(is_closed_conn_error(&Error::from(ErrorKind::BrokenPipe)));
    assert!(!is_closed_conn_error(&Error::from(ErrorKind::PermissionDenied)));
}

#[tokio::test]
async fn test_server_start_and_stop() {
    let server = CallbackServer::new(create_test_config());
    assert_eq!(server.state(), LifecycleState::Created);
    assert_eq!(server.address(), "");
    assert_eq!(server.port(), 0);
    assert_eq!(server.host(), "127.0.0.1");

    server.start(&CancelSignal::new()).await.unwrap();
    assert_eq!(server.state(), LifecycleState::Running);
    assert!(server.is_running());
    assert_ne!(server.port(), 0);
    assert_eq!(server.address(), format!("127.0.0.1:{}", server.port()));
    assert!(server.last_error().is_none());

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(server.address(), "");
    assert_eq!(server.port(), 0);
    assert!(server.errors().recv().await.is_none());
    assert_eq!(server.lifecycle().task_count(), 0);
    server.wait().await.unwrap();
}

#[tokio::test]
async fn test_server_cannot_start_twice() {
    let server = CallbackServer::new(create_test_config());
    server.start(&CancelSignal::new()).await.unwrap();

    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::Lifecycle(LifecycleError::InvalidTransition {
            state: LifecycleState::Running,
            ..
        })
    ));
    assert!(server.is_running());

    server.stop().await;
    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::Lifecycle(LifecycleError::InvalidTransition {
            state: LifecycleState::Stopped,
            ..
        })
    ));
}

#[tokio::test]
async fn test_server_stop_is_idempotent() {
    let server = Arc::new(CallbackServer::new(create_test_config()));
    server.start(&CancelSignal::new()).await.unwrap();

    let mut stops = Vec::new();
    for _ in 0..4 {
        let server = Arc::clone(&server);
        stops.push(tokio::spawn(async move { server.stop().await }));
    }
    for stop in stops {
        stop.await.unwrap();
    }

    assert_eq!(server.state(), LifecycleState::Stopped);
    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_second_stop_waits_for_first() {
    let server = Arc::new(CallbackServer::with_transport(
        create_test_config(),
        Arc::new(SlowShutdownFactory),
    ));
    server.start(&CancelSignal::new()).await.unwrap();

    let first = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.state(), LifecycleState::Stopping);

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert!(server.errors().recv().await.is_none());

    first.await.unwrap();
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_server_stop_before_start() {
    let server = CallbackServer::new(create_test_config());
    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert!(server.errors().recv().await.is_none());
    assert!(server.start(&CancelSignal::new()).await.is_err());
}

#[tokio::test]
async fn test_connection_info_requires_running() {
    let server = CallbackServer::new(create_test_config());
    let err = server.connection_info("cmd-1").unwrap_err();
    assert!(matches!(
        err,
        ServerError::NotRunning {
            state: LifecycleState::Created
        }
    ));

    server.start(&CancelSignal::new()).await.unwrap();
    let info = server.connection_info("cmd-1").unwrap();
    assert_eq!(info.host, "127.0.0.1");
    assert_eq!(info.port, server.port());
    assert_eq!(info.user, "hostlink");
    let token = server.validate_token(&info.token).expect("issued token is live");
    assert_eq!(token.command_id, "cmd-1");
    assert_eq!(token.expires_at, info.expires_at);

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["user"], "hostlink");
    assert_eq!(json["port"], info.port);

    server.stop().await;
    assert!(matches!(
        server.connection_info("cmd-1").unwrap_err(),
        ServerError::NotRunning {
            state: LifecycleState::Stopped
        }
    ));
}

#[tokio::test]
async fn test_server_token_operations() {
    let server = CallbackServer::with_clock(create_test_config(), manual_clock());
    let first = server.generate_token("cmd-1").unwrap();
    let second = server.generate_token("cmd-1").unwrap();
    let third = server.generate_token("cmd-2").unwrap();

    server.revoke_token(&first.value);
    assert!(server.validate_token(&first.value).is_none());
    assert_eq!(server.revoke_tokens_for_command("cmd-1"), 1);
    assert!(server.validate_token(&second.value).is_none());
    assert!(server.validate_token(&third.value).is_some());
}

#[tokio::test]
async fn test_listen_failure_fails_server() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = create_test_config();
    config.server.port = blocker.local_addr().unwrap().port();

    let server = CallbackServer::new(config);
    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert!(matches!(err, ServerError::Listen { .. }));
    assert!(err.to_string().starts_with("failed to listen on 127.0.0.1:"));
    assert_eq!(server.state(), LifecycleState::Failed);
    assert!(matches!(server.last_error(), Some(ServerError::Listen { .. })));

    let waited = server.wait().await.unwrap_err();
    assert!(matches!(waited, ServerError::Listen { .. }));

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Failed);
    drop(blocker);
}

#[tokio::test]
async fn test_cancelled_signal_fails_start() {
    let server = CallbackServer::new(create_test_config());
    let signal = CancelSignal::new();
    signal.cancel();

    let err = server.start(&signal).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::Lifecycle(LifecycleError::CancelledBeforeStart {
            cause: CancelCause::Cancelled
        })
    ));
    assert_eq!(server.state(), LifecycleState::Failed);
    assert_eq!(server.port(), 0);
}

#[tokio::test]
async fn test_startup_timeout() {
    let mut config = create_test_config();
    config.lifecycle.startup_timeout_ms = 100;
    let server = CallbackServer::with_transport(config, Arc::new(SlowFactory));

    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert!(err.is_startup_timeout());
    assert!(matches!(
        err,
        ServerError::Lifecycle(LifecycleError::StartupTimeout {
            cause: CancelCause::DeadlineExceeded
        })
    ));
    assert_eq!(server.state(), LifecycleState::Failed);
    assert_eq!(server.address(), "");
}

#[tokio::test]
async fn test_caller_signal_bounds_startup() {
    let server = CallbackServer::with_transport(create_test_config(), Arc::new(SlowFactory));
    let signal = CancelSignal::new();

    let canceller = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = server.start(&signal).await.unwrap_err();
    assert!(matches!(
        err,
        ServerError::Lifecycle(LifecycleError::StartupTimeout {
            cause: CancelCause::Cancelled
        })
    ));
    assert_eq!(server.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_stop_during_startup_is_not_reported_as_started() {
    let server = Arc::new(CallbackServer::with_transport(
        create_test_config(),
        Arc::new(SlowFactory),
    ));

    let start = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start(&CancelSignal::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.state(), LifecycleState::Starting);

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ServerError::Lifecycle(LifecycleError::FailedBeforeReady)
    ));
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_failure_right_after_ready_fails_start() {
    let slot = Arc::new(OnceLock::new());
    let server = Arc::new(CallbackServer::with_transport(
        create_test_config(),
        Arc::new(FailAfterReadyFactory {
            server: Arc::clone(&slot),
        }),
    ));
    let _ = slot.set(Arc::downgrade(&server));

    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert!(err.to_string().contains("listener lost after ready"));
    assert_eq!(server.state(), LifecycleState::Failed);
    assert!(server.local_addr().is_none());

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_transport_build_failure() {
    let server = CallbackServer::with_transport(create_test_config(), Arc::new(FailingFactory));

    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "failed to create transport: handshake keys unavailable"
    );
    assert_eq!(server.state(), LifecycleState::Failed);
    assert_eq!(server.port(), 0);
}

#[tokio::test]
async fn test_zero_connection_limit_is_rejected() {
    let server = CallbackServer::with_transport(
        create_test_config(),
        Arc::new(AcceptLoopFactory::reject_all(0)),
    );
    let err = server.start(&CancelSignal::new()).await.unwrap_err();
    assert!(matches!(err, ServerError::Transport { .. }));
    assert_eq!(server.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_serve_error_is_reported_without_state_change() {
    let server = CallbackServer::with_transport(create_test_config(), Arc::new(FlakyFactory));
    server.start(&CancelSignal::new()).await.unwrap();

    let reported = tokio::time::timeout(Duration::from_secs(5), server.errors().recv())
        .await
        .expect("error delivered")
        .expect("channel open");
    assert!(matches!(reported, ServerError::Serve { .. }));
    assert!(reported.to_string().contains("accept queue corrupted"));
    assert_eq!(server.state(), LifecycleState::Running);

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_default_transport_closes_connections() {
    let server = CallbackServer::new(create_test_config());
    server.start(&CancelSignal::new()).await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection closed by server");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.stop().await;
}

#[tokio::test]
async fn test_custom_handler_sees_tokens() {
    let server = CallbackServer::with_transport(
        create_test_config(),
        Arc::new(AcceptLoopFactory::new(Arc::new(TokenCheckHandler), 4)),
    );
    server.start(&CancelSignal::new()).await.unwrap();
    let addr = server.local_addr().unwrap();

    let info = server.connection_info("cmd-7").unwrap();
    assert_eq!(ask(addr, &info.token).await, "ok cmd-7");
    assert_eq!(ask(addr, "bogus").await, "denied");

    server.revoke_tokens_for_command("cmd-7");
    assert_eq!(ask(addr, &info.token).await, "denied");

    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_expired_tokens_swept_in_background() {
    let clock = manual_clock();
    let mut config = create_test_config();
    config.tokens.ttl_seconds = 1;
    config.tokens.sweep_interval_seconds = 1;

    let server = CallbackServer::with_clock(config, clock.clone());
    server.start(&CancelSignal::new()).await.unwrap();
    server.generate_token("cmd-1").unwrap();
    clock.advance(Duration::from_secs(5));

    let store = server.token_store();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !store.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("expired token swept");

    server.stop().await;
}

#[tokio::test]
async fn test_supervise_stops_server() {
    let server = Arc::new(CallbackServer::new(create_test_config()));
    server.start(&CancelSignal::new()).await.unwrap();

    let stop = CancelSignal::new();
    let supervised = {
        let server = Arc::clone(&server);
        let stop = stop.clone();
        tokio::spawn(async move { supervise(server.as_ref(), stop).await })
    };

    stop.cancel();
    supervised.await.unwrap().unwrap();
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_builder_validates_config() {
    let mut config = create_test_config();
    config.server.host = String::new();
    assert!(matches!(
        CallbackServer::builder().config(config).build(),
        Err(ServerError::Config(_))
    ));

    let server = CallbackServer::builder()
        .config(create_test_config())
        .clock(manual_clock())
        .build()
        .unwrap();
    assert_eq!(server.state(), LifecycleState::Created);
    assert_eq!(server.config().lifecycle.startup_timeout_ms, 2_000);
}

#[test]
fn test_constructor_applies_defaults() {
    let mut config = create_test_config();
    config.server.host = String::new();
    config.tokens.ttl_seconds = 0;

    let server = CallbackServer::new(config);
    assert_eq!(server.host(), "127.0.0.1");
    assert_eq!(server.token_store().ttl(), Duration::from_secs(3600));
}

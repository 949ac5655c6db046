use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::reconnect::{ReconnectPolicy, RetryReason};
use super::transport::{FeedConnector, FeedFrame, FeedTransport};
use crate::config::{redact_url, FeedConfig};
use crate::errors::FeedError;
use crate::models::{FeedState, FeedStatus, InstrumentKey, Tick, UpstreamCredentials};
use crate::protocol::{self, ControlRequest, SubscriptionAction};
use crate::subscription::SubscriptionRegistry;

/// Upstream instructions issued by the session layer
///
/// Implemented by [`FeedHandle`]; the session handler depends on this
/// trait so it can be exercised against a recording fake.
pub trait UpstreamControl: Send + Sync {
    fn subscribe(&self, keys: Vec<InstrumentKey>) -> Result<(), FeedError>;

    fn unsubscribe(&self, keys: Vec<InstrumentKey>) -> Result<(), FeedError>;
}

/// Commands accepted by the feed task
#[derive(Debug)]
pub enum FeedCommand {
    /// New credentials from the credential collaborator
    CredentialsUpdated(UpstreamCredentials),
    /// The credential collaborator could not produce credentials
    CredentialFetchFailed(String),
    Subscribe(Vec<InstrumentKey>),
    Unsubscribe(Vec<InstrumentKey>),
    Shutdown,
}

/// Counters and lifecycle fields shared between the task and its handles
struct FeedShared {
    state: watch::Sender<FeedState>,
    connected_since: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    connections: AtomicU64,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
    ticks_forwarded: AtomicU64,
    decode_failures: AtomicU64,
    invalid_prices: AtomicU64,
    active_instruments: AtomicUsize,
}

impl FeedShared {
    fn new() -> Self {
        let (state, _) = watch::channel(FeedState::CredentialsMissing);
        Self {
            state,
            connected_since: RwLock::new(None),
            last_error: RwLock::new(None),
            connections: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            frames_received: AtomicU64::new(0),
            ticks_forwarded: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            invalid_prices: AtomicU64::new(0),
            active_instruments: AtomicUsize::new(0),
        }
    }

    fn set_state(&self, state: FeedState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Feed state {:?} -> {:?}", *current, state);
            *current = state;
            true
        });
    }

    fn record_error(&self, error: &FeedError) {
        *self.last_error.write() = Some(error.to_string());
    }
}

/// Cloneable handle to the running feed task
///
/// Instructions are queued to the task; nothing here touches the
/// connection directly, so only the task ever owns a live connection.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    shared: Arc<FeedShared>,
}

impl FeedHandle {
    fn send(&self, command: FeedCommand) -> Result<(), FeedError> {
        self.commands
            .send(command)
            .map_err(|_| FeedError::ChannelClosed)
    }

    /// Credential update event. Triggers a full reconnect.
    pub fn credentials_updated(&self, credentials: UpstreamCredentials) -> Result<(), FeedError> {
        if !credentials.is_complete() {
            return Err(FeedError::MissingCredentials);
        }
        self.send(FeedCommand::CredentialsUpdated(credentials))
    }

    /// Credential fetch failure event
    pub fn credential_fetch_failed(&self, reason: impl Into<String>) -> Result<(), FeedError> {
        self.send(FeedCommand::CredentialFetchFailed(reason.into()))
    }

    /// Stop the feed task, closing any live connection
    pub fn shutdown(&self) -> Result<(), FeedError> {
        self.send(FeedCommand::Shutdown)
    }

    pub fn state(&self) -> FeedState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<FeedState> {
        self.shared.state.subscribe()
    }

    pub fn status(&self) -> FeedStatus {
        let state = self.state();
        let uptime_seconds = self
            .shared
            .connected_since
            .read()
            .map(|since| since.elapsed().as_secs());

        FeedStatus {
            state,
            connected: state.is_connected(),
            uptime_seconds,
            connections: self.shared.connections.load(Ordering::Relaxed),
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
            ticks_forwarded: self.shared.ticks_forwarded.load(Ordering::Relaxed),
            decode_failures: self.shared.decode_failures.load(Ordering::Relaxed),
            invalid_prices: self.shared.invalid_prices.load(Ordering::Relaxed),
            active_instruments: self.shared.active_instruments.load(Ordering::Relaxed),
            last_error: self.shared.last_error.read().clone(),
        }
    }
}

impl UpstreamControl for FeedHandle {
    /// Queue a subscribe instruction
    ///
    /// Fails immediately if any key's exchange has no upstream code. While
    /// not connected the instruction is dropped by the task; the registry
    /// keeps the intent and it is replayed on the next connect.
    fn subscribe(&self, keys: Vec<InstrumentKey>) -> Result<(), FeedError> {
        ensure_mapped(&keys)?;
        if keys.is_empty() {
            return Ok(());
        }
        self.send(FeedCommand::Subscribe(keys))
    }

    fn unsubscribe(&self, keys: Vec<InstrumentKey>) -> Result<(), FeedError> {
        ensure_mapped(&keys)?;
        if keys.is_empty() {
            return Ok(());
        }
        self.send(FeedCommand::Unsubscribe(keys))
    }
}

fn ensure_mapped(keys: &[InstrumentKey]) -> Result<(), FeedError> {
    match keys.iter().find(|k| k.exchange().exchange_type().is_none()) {
        Some(key) => Err(FeedError::UnmappedExchange(key.exchange())),
        None => Ok(()),
    }
}

/// What the task does next
enum Step {
    AwaitCredentials,
    Connect,
    Retry(RetryReason),
    Stop,
}

/// Owner of the single upstream connection
///
/// Runs as one task. State machine:
///
/// ```text
/// CredentialsMissing --credentials--> Connecting --open--> Connected
///        ^                               |  ^                  |
///        |                         error |  | timer/credentials | close/error
///        |                               v  |                  v
///        +------(no credentials)----- Disconnected <------- (Closing)
/// ```
///
/// On every `Connected` transition the registry's current upstream set is
/// subscribed before any frame is read.
pub struct UpstreamFeedConnection {
    config: FeedConfig,
    policy: ReconnectPolicy,
    registry: Arc<SubscriptionRegistry>,
    connector: Arc<dyn FeedConnector>,
    tick_tx: mpsc::UnboundedSender<Tick>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    shared: Arc<FeedShared>,
    credentials: Option<UpstreamCredentials>,
    /// Instruments subscribed on the current connection
    active: HashSet<InstrumentKey>,
    /// Consecutive failed attempts
    failures: u32,
}

impl UpstreamFeedConnection {
    /// Create the feed task and its handle
    ///
    /// Valid ticks are sent on `tick_tx` for fan-out.
    pub fn new(
        config: FeedConfig,
        registry: Arc<SubscriptionRegistry>,
        connector: Arc<dyn FeedConnector>,
        tick_tx: mpsc::UnboundedSender<Tick>,
    ) -> (Self, FeedHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(FeedShared::new());
        let policy = ReconnectPolicy::new(config.reconnect.clone());

        let feed = Self {
            config,
            policy,
            registry,
            connector,
            tick_tx,
            commands: cmd_rx,
            shared: Arc::clone(&shared),
            credentials: None,
            active: HashSet::new(),
            failures: 0,
        };
        let handle = FeedHandle {
            commands: cmd_tx,
            shared,
        };

        (feed, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("📡 Upstream feed task started");

        let mut step = Step::AwaitCredentials;
        loop {
            step = match step {
                Step::AwaitCredentials => self.await_credentials().await,
                Step::Connect => self.connect_and_stream().await,
                Step::Retry(reason) => self.wait_retry(reason).await,
                Step::Stop => break,
            };
        }

        self.set_disconnected();
        self.shared.set_state(FeedState::Disconnected);
        info!("📡 Upstream feed task stopped");
    }

    /// `CredentialsMissing`: nothing to connect with
    async fn await_credentials(&mut self) -> Step {
        self.shared.set_state(FeedState::CredentialsMissing);
        info!("⏸️  Waiting for upstream credentials");

        loop {
            match self.commands.recv().await {
                Some(FeedCommand::CredentialsUpdated(credentials)) => {
                    info!("🔑 Credentials received for client {}", credentials.client_code);
                    self.credentials = Some(credentials);
                    return Step::Connect;
                }
                Some(FeedCommand::CredentialFetchFailed(reason)) => {
                    warn!("Credential fetch failed: {}", reason);
                    self.shared.record_error(&FeedError::MissingCredentials);
                }
                Some(FeedCommand::Subscribe(_)) | Some(FeedCommand::Unsubscribe(_)) => {
                    trace!("Instruction held in registry until connected");
                }
                Some(FeedCommand::Shutdown) | None => return Step::Stop,
            }
        }
    }

    /// `Disconnected`: sleep for the policy delay, or reconnect at once on new credentials
    async fn wait_retry(&mut self, reason: RetryReason) -> Step {
        self.shared.set_state(FeedState::Disconnected);

        if self.credentials.is_none() {
            return Step::AwaitCredentials;
        }

        let delay = self.policy.delay(reason, self.failures.saturating_sub(1));
        info!("🔄 Reconnecting upstream in {:?}", delay);

        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Step::Connect,
                command = self.commands.recv() => match command {
                    Some(FeedCommand::CredentialsUpdated(credentials)) => {
                        info!("🔑 New credentials supersede pending reconnect");
                        self.credentials = Some(credentials);
                        self.failures = 0;
                        return Step::Connect;
                    }
                    Some(FeedCommand::CredentialFetchFailed(reason)) => {
                        warn!("Credential fetch failed while disconnected: {}", reason);
                    }
                    Some(FeedCommand::Subscribe(_)) | Some(FeedCommand::Unsubscribe(_)) => {
                        trace!("Instruction held in registry until connected");
                    }
                    Some(FeedCommand::Shutdown) | None => return Step::Stop,
                },
            }
        }
    }

    /// `Connecting` then `Connected` until the connection ends
    async fn connect_and_stream(&mut self) -> Step {
        let Some(credentials) = self.credentials.clone() else {
            return Step::AwaitCredentials;
        };

        self.shared.set_state(FeedState::Connecting);

        let url = match self.config.upstream_url(&credentials) {
            Ok(url) => url,
            Err(e) => return self.connect_failed(e),
        };

        info!("🔌 Connecting to upstream feed {}", redact_url(&url));

        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout();
        let timeout_secs = self.config.connect_timeout_secs;
        let attempt = tokio::time::timeout(timeout, connector.connect(&url));
        tokio::pin!(attempt);

        let mut transport = loop {
            tokio::select! {
                result = &mut attempt => match result {
                    Ok(Ok(transport)) => break transport,
                    Ok(Err(e)) => return self.connect_failed(e),
                    Err(_) => return self.connect_failed(FeedError::ConnectTimeout(timeout_secs)),
                },
                command = self.commands.recv() => match command {
                    Some(FeedCommand::CredentialsUpdated(credentials)) => {
                        info!("🔑 Credentials replaced while connecting, restarting attempt");
                        self.credentials = Some(credentials);
                        return Step::Connect;
                    }
                    Some(FeedCommand::CredentialFetchFailed(reason)) => {
                        warn!("Credential fetch failed while connecting: {}", reason);
                    }
                    Some(FeedCommand::Subscribe(_)) | Some(FeedCommand::Unsubscribe(_)) => {
                        trace!("Instruction deferred to post-connect resubscribe");
                    }
                    Some(FeedCommand::Shutdown) | None => return Step::Stop,
                },
            }
        };

        self.on_connected();

        // Replay everything the registry wants before reading any frame
        let wanted = self.registry.upstream_instruments();
        if let Err(e) = self.send_control(&mut *transport, SubscriptionAction::Subscribe, wanted).await {
            warn!("❌ Resubscribe after connect failed: {}", e);
            self.shared.record_error(&e);
            close_transport(&mut *transport, self.config.connect_timeout()).await;
            self.set_disconnected();
            return Step::Retry(RetryReason::Closed);
        }

        let step = self.stream(&mut *transport).await;
        self.set_disconnected();
        step
    }

    /// `Connected`: pump frames and instructions
    async fn stream(&mut self, transport: &mut dyn FeedTransport) -> Step {
        loop {
            tokio::select! {
                frame = transport.next_frame() => match frame {
                    Some(Ok(FeedFrame::Binary(data))) => self.on_binary(&data),
                    Some(Ok(FeedFrame::Text(text))) => debug!("Upstream text frame: {}", text),
                    Some(Err(e)) => {
                        warn!("❌ Upstream protocol error: {}", e);
                        self.shared.record_error(&e);
                        self.shared.set_state(FeedState::Closing);
                        close_transport(&mut *transport, self.config.connect_timeout()).await;
                        return Step::Retry(RetryReason::Closed);
                    }
                    None => {
                        info!("🔴 Upstream feed closed the connection");
                        return Step::Retry(RetryReason::Closed);
                    }
                },
                command = self.commands.recv() => match command {
                    Some(FeedCommand::CredentialsUpdated(credentials)) => {
                        info!("🔑 Credentials replaced, tearing down current connection");
                        self.shared.set_state(FeedState::Closing);
                        close_transport(&mut *transport, self.config.connect_timeout()).await;
                        self.credentials = Some(credentials);
                        return Step::Connect;
                    }
                    Some(FeedCommand::CredentialFetchFailed(reason)) => {
                        warn!("Credential fetch failed, keeping current connection: {}", reason);
                    }
                    Some(FeedCommand::Subscribe(keys)) => {
                        if let Err(e) = self.send_control(transport, SubscriptionAction::Subscribe, keys).await {
                            return self.instruction_failed(transport, e).await;
                        }
                    }
                    Some(FeedCommand::Unsubscribe(keys)) => {
                        if let Err(e) = self.send_control(transport, SubscriptionAction::Unsubscribe, keys).await {
                            return self.instruction_failed(transport, e).await;
                        }
                    }
                    Some(FeedCommand::Shutdown) | None => {
                        self.shared.set_state(FeedState::Closing);
                        close_transport(&mut *transport, self.config.connect_timeout()).await;
                        return Step::Stop;
                    }
                },
            }
        }
    }

    async fn instruction_failed(&mut self, transport: &mut dyn FeedTransport, error: FeedError) -> Step {
        warn!("❌ Upstream instruction failed: {}", error);
        self.shared.record_error(&error);
        self.shared.set_state(FeedState::Closing);
        close_transport(&mut *transport, self.config.connect_timeout()).await;
        Step::Retry(RetryReason::Closed)
    }

    /// Reconcile `keys` against the registry and the active set, then send
    ///
    /// Subscribes only keys that still have interest and are not active;
    /// unsubscribes only active keys that lost all interest.
    async fn send_control(
        &mut self,
        transport: &mut dyn FeedTransport,
        action: SubscriptionAction,
        keys: Vec<InstrumentKey>,
    ) -> Result<(), FeedError> {
        let keys: Vec<InstrumentKey> = keys
            .into_iter()
            .filter(|key| match action {
                SubscriptionAction::Subscribe => {
                    !self.active.contains(key) && self.registry.has_interest(key)
                }
                SubscriptionAction::Unsubscribe => {
                    self.active.contains(key) && !self.registry.has_interest(key)
                }
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let Some(request) = ControlRequest::for_instruments(action, self.config.mode, &keys)? else {
            return Ok(());
        };

        transport.send_text(request.to_json()?).await?;

        for key in keys {
            match action {
                SubscriptionAction::Subscribe => self.active.insert(key),
                SubscriptionAction::Unsubscribe => self.active.remove(&key),
            };
        }
        self.shared
            .active_instruments
            .store(self.active.len(), Ordering::Relaxed);

        info!(
            "📤 Upstream {}: {} instruments ({} active)",
            action.as_str(),
            request.token_count(),
            self.active.len()
        );
        Ok(())
    }

    fn on_binary(&self, frame: &[u8]) {
        self.shared.frames_received.fetch_add(1, Ordering::Relaxed);

        match protocol::decode(frame) {
            Ok(tick) if tick.is_valid() => {
                if self.tick_tx.send(tick).is_err() {
                    warn!("Fan-out channel closed, dropping tick");
                    return;
                }
                self.shared.ticks_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(tick) => {
                self.shared.invalid_prices.fetch_add(1, Ordering::Relaxed);
                trace!("Dropping tick for {} with price {}", tick.token, tick.last_traded_price);
            }
            Err(e) => {
                self.shared.decode_failures.fetch_add(1, Ordering::Relaxed);
                trace!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
            }
        }
    }

    fn on_connected(&mut self) {
        info!("✅ Upstream feed connected");
        self.failures = 0;
        self.active.clear();
        self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
        self.shared.connections.fetch_add(1, Ordering::Relaxed);
        *self.shared.connected_since.write() = Some(Instant::now());
        self.shared.set_state(FeedState::Connected);
    }

    fn set_disconnected(&mut self) {
        self.active.clear();
        self.shared.active_instruments.store(0, Ordering::Relaxed);
        *self.shared.connected_since.write() = None;
    }

    fn connect_failed(&mut self, error: FeedError) -> Step {
        if error.is_retryable() {
            warn!("❌ {}", error);
        } else {
            error!("❌ Upstream connect cannot succeed until reconfigured: {}", error);
        }

        self.failures = self.failures.saturating_add(1);
        self.shared
            .reconnect_attempts
            .store(self.failures, Ordering::Relaxed);
        self.shared.record_error(&error);
        Step::Retry(RetryReason::Error)
    }
}

/// Close the transport, giving up after `limit`
async fn close_transport(transport: &mut dyn FeedTransport, limit: Duration) {
    if tokio::time::timeout(limit, transport.close()).await.is_err() {
        warn!("Upstream close handshake exceeded {:?}, dropping connection", limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::memory::{MemoryBroker, MemoryConnection, MemoryConnector};
    use crate::models::{ExchangeCode, SessionId};
    use crate::protocol::encode_frame as frame;
    use serde_json::Value;

    struct Harness {
        handle: FeedHandle,
        broker: MemoryBroker,
        registry: Arc<SubscriptionRegistry>,
        ticks: mpsc::UnboundedReceiver<Tick>,
    }

    fn nse(token: &str) -> InstrumentKey {
        InstrumentKey::new(ExchangeCode::Nse, token).unwrap()
    }

    fn creds(token: &str) -> UpstreamCredentials {
        UpstreamCredentials::new(token, "A123", "key")
    }

    fn local_config() -> FeedConfig {
        FeedConfig {
            scheme: "ws".to_string(),
            host: "localhost".to_string(),
            ..FeedConfig::default()
        }
    }

    fn start() -> Harness {
        start_with(local_config())
    }

    fn start_with(config: FeedConfig) -> Harness {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (connector, broker) = MemoryConnector::new();
        let (tick_tx, ticks) = mpsc::unbounded_channel();

        let (feed, handle) =
            UpstreamFeedConnection::new(config, Arc::clone(&registry), Arc::new(connector), tick_tx);
        feed.spawn();

        Harness {
            handle,
            broker,
            registry,
            ticks,
        }
    }

    async fn wait_for(handle: &FeedHandle, state: FeedState) {
        let mut rx = handle.state_changes();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .expect("feed stopped");
    }

    async fn accept(broker: &mut MemoryBroker) -> MemoryConnection {
        tokio::time::timeout(Duration::from_secs(60), broker.accept())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    fn subscribed_tokens(message: &str) -> (u64, Vec<String>) {
        let value: Value = serde_json::from_str(message).unwrap();
        let action = value["action"].as_u64().unwrap();
        let mut tokens: Vec<String> = value["params"]["tokenList"]
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|group| group["tokens"].as_array().unwrap().clone())
            .map(|t| t.as_str().unwrap().to_string())
            .collect();
        tokens.sort();
        (action, tokens)
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_without_credentials() {
        let h = start();
        wait_for(&h.handle, FeedState::CredentialsMissing).await;
        assert!(!h.handle.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_trigger_connect() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();

        let conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        let pairs: Vec<(String, String)> = conn.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("feedToken".to_string(), "feed-1".to_string())));
        assert_eq!(h.handle.status().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_credentials_rejected() {
        let h = start();
        let err = h.handle.credentials_updated(creds("")).unwrap_err();
        assert_eq!(err, FeedError::MissingCredentials);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_registry_after_reconnect() {
        let mut h = start();
        let s1 = SessionId::new();
        h.registry.add_interest(nse("A"), s1);
        h.registry.add_interest(nse("B"), s1);

        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let mut first = accept(&mut h.broker).await;
        let (action, tokens) = subscribed_tokens(&first.next_sent().await.unwrap());
        assert_eq!((action, tokens), (1, vec!["A".to_string(), "B".to_string()]));

        // Unexpected close, then the 2s reconnect timer fires
        first.close();
        let mut second = accept(&mut h.broker).await;
        let (action, tokens) = subscribed_tokens(&second.next_sent().await.unwrap());
        assert_eq!((action, tokens), (1, vec!["A".to_string(), "B".to_string()]));
        assert_eq!(h.handle.status().active_instruments, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_two_seconds() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        let closed_at = tokio::time::Instant::now();
        conn.close();
        let _second = accept(&mut h.broker).await;

        assert!(closed_at.elapsed() >= Duration::from_secs(2));
        assert!(closed_at.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_waits_five_seconds() {
        let mut h = start();
        h.broker.fail_next_connects(1);

        let started = tokio::time::Instant::now();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let _conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        let status = h.handle.status();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_update_replaces_live_connection() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let first = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        h.handle.credentials_updated(creds("feed-2")).unwrap();
        let second = accept(&mut h.broker).await;

        // Old connection torn down before the new one was opened
        assert!(first.is_closed());
        assert!(!second.is_closed());
        let pairs: Vec<(String, String)> = second.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("feedToken".to_string(), "feed-2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_close_does_not_block_reconnect() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let first = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        first.stall_close();
        let replaced_at = tokio::time::Instant::now();
        h.handle.credentials_updated(creds("feed-2")).unwrap();
        let second = accept(&mut h.broker).await;

        // Close gives up after the 10s connect timeout
        assert!(replaced_at.elapsed() >= Duration::from_secs(10));
        assert!(replaced_at.elapsed() < Duration::from_secs(15));
        assert!(first.is_closed());
        let pairs: Vec<(String, String)> = second.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("feedToken".to_string(), "feed-2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_update_cancels_pending_timer() {
        let mut h = start();
        h.broker.fail_next_connects(1);
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        wait_for(&h.handle, FeedState::Disconnected).await;

        let started = tokio::time::Instant::now();
        h.handle.credentials_updated(creds("feed-2")).unwrap();
        let conn = accept(&mut h.broker).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        let pairs: Vec<(String, String)> = conn.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("feedToken".to_string(), "feed-2".to_string())));

        // The superseded timer must not open a second connection
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.broker.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_update_restarts_hung_connect() {
        let mut h = start();
        let s1 = SessionId::new();
        h.broker.hang_next_connects(1);

        h.handle.credentials_updated(creds("feed-1")).unwrap();
        wait_for(&h.handle, FeedState::Connecting).await;

        // Interest arriving mid-attempt is replayed once connected
        h.registry.add_interest(nse("2885"), s1);
        h.handle.subscribe(vec![nse("2885")]).unwrap();

        h.handle.credentials_updated(creds("feed-2")).unwrap();
        let mut conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        let pairs: Vec<(String, String)> = conn.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("feedToken".to_string(), "feed-2".to_string())));
        assert_eq!(
            subscribed_tokens(&conn.next_sent().await.unwrap()),
            (1, vec!["2885".to_string()])
        );
        assert_eq!(h.handle.status().connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_then_error_delay() {
        let mut h = start();
        h.broker.hang_next_connects(1);

        let started = tokio::time::Instant::now();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let _conn = accept(&mut h.broker).await;

        // 10s connect timeout plus the 5s error delay
        assert!(started.elapsed() >= Duration::from_secs(15));
        wait_for(&h.handle, FeedState::Connected).await;

        let status = h.handle.status();
        assert_eq!(status.connections, 1);
        assert!(status.last_error.unwrap().contains("timed out after 10s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbuildable_url_keeps_retrying() {
        let mut h = start_with(FeedConfig {
            host: "bad host".to_string(),
            ..local_config()
        });

        h.handle.credentials_updated(creds("feed-1")).unwrap();
        wait_for(&h.handle, FeedState::Disconnected).await;
        let status = h.handle.status();
        assert_eq!(status.reconnect_attempts, 1);
        assert!(status.last_error.unwrap().starts_with("Invalid upstream URL"));

        // Not retryable, but still retried on the error delay
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.handle.status().reconnect_attempts, 2);
        assert!(h.broker.try_accept().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_instructions_while_disconnected_are_deferred() {
        let mut h = start();
        let s1 = SessionId::new();

        h.registry.add_interest(nse("2885"), s1);
        h.handle.subscribe(vec![nse("2885")]).unwrap();

        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let mut conn = accept(&mut h.broker).await;

        let (_, tokens) = subscribed_tokens(&conn.next_sent().await.unwrap());
        assert_eq!(tokens, vec!["2885".to_string()]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.try_next_sent().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_unsubscribe_while_connected() {
        let mut h = start();
        let s1 = SessionId::new();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let mut conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        h.registry.add_interest(nse("1594"), s1);
        h.handle.subscribe(vec![nse("1594")]).unwrap();
        assert_eq!(subscribed_tokens(&conn.next_sent().await.unwrap()), (1, vec!["1594".to_string()]));

        // Still interested: unsubscribe is filtered out
        h.handle.unsubscribe(vec![nse("1594")]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.try_next_sent().is_none());

        h.registry.remove_session(s1);
        h.handle.unsubscribe(vec![nse("1594")]).unwrap();
        assert_eq!(subscribed_tokens(&conn.next_sent().await.unwrap()), (0, vec!["1594".to_string()]));
        assert_eq!(h.handle.status().active_instruments, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmapped_exchange_fails_subscribe() {
        let mut h = start();
        let s1 = SessionId::new();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let mut conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        let mcx = InstrumentKey::new(ExchangeCode::Mcx, "234230").unwrap();
        h.registry.add_interest(mcx.clone(), s1);
        let err = h.handle.subscribe(vec![nse("2885"), mcx]).unwrap_err();
        assert_eq!(err, FeedError::UnmappedExchange(ExchangeCode::Mcx));

        // Nothing from the rejected batch reaches the wire
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.try_next_sent().is_none());

        h.registry.add_interest(nse("2885"), s1);
        h.handle.subscribe(vec![nse("2885")]).unwrap();
        assert_eq!(subscribed_tokens(&conn.next_sent().await.unwrap()), (1, vec!["2885".to_string()]));
        assert_eq!(h.handle.status().active_instruments, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_decoded_and_filtered() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        conn.send_binary(frame("99926000", 2_451_035, Some([1, 2, 3, 4])));
        conn.send_binary(frame("99926000", 0, None));
        conn.send_binary(vec![0u8; 20]);
        conn.send_text(r#"{"status":"ok"}"#);
        conn.send_binary(frame("2885", 150_000, None));

        let first = h.ticks.recv().await.unwrap();
        let second = h.ticks.recv().await.unwrap();
        assert_eq!(first.token, "99926000");
        assert_eq!(second.token, "2885");

        let status = h.handle.status();
        assert_eq!(status.frames_received, 4);
        assert_eq!(status.ticks_forwarded, 2);
        assert_eq!(status.invalid_prices, 1);
        assert_eq!(status.decode_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_reconnects() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let first = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        first.send_error("bad frame header");
        let _second = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        assert!(first.is_closed());
        assert_eq!(h.handle.status().connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connection() {
        let mut h = start();
        h.handle.credentials_updated(creds("feed-1")).unwrap();
        let conn = accept(&mut h.broker).await;
        wait_for(&h.handle, FeedState::Connected).await;

        h.handle.shutdown().unwrap();
        wait_for(&h.handle, FeedState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(conn.is_closed());
        assert!(h.handle.subscribe(vec![nse("2885")]).is_err());
    }
}

//! Subscription client
//!
//! A stateful supervisor that multiplexes many logical subscriptions over a
//! single websocket. The supervisor owns the registry of subscriptions and
//! runs one [`Session`] at a time; sessions fail, the registry survives, and
//! every non-unsubscribed entry is resumed on the next session with a fresh
//! wire id. Two wire protocols are supported behind
//! [`SubscriptionProtocol`]: the legacy Apollo `subscriptions-transport-ws`
//! and the modern `graphql-transport-ws`.
//!
//! All asynchronous failures funnel through a single error channel consumed
//! by the supervisor loop, including the internal retry sentinel that asks
//! for a fresh session. This keeps the reconnect state machine linear.

use crate::error::{GraphQLClientError, Result};
use crate::graphql::GraphQLRequestBody;
use crate::request::construct_subscription;
use crate::stats;
use crate::websocket::{close_code, WebSocketConn, WebSocketOptions};
use bytes::Bytes;
use graphql_client::GraphQLQuery;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod protocol;
pub mod registry;
pub mod session;

pub use protocol::{GraphqlWs, OperationMessage, SubscriptionProtocol, TransportWs};
pub use registry::{Subscription, SubscriptionHandler, SubscriptionRegistry, SubscriptionStatus};
pub use session::{
    ClientCallbacks, ErrorCallback, LifecycleCallback, Session, SubscriptionCompleteCallback,
};

/// How often the supervisor polls the initialization-timeout condition
const WATCHDOG_TICK: Duration = Duration::from_millis(200);

/// Client-wide lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientStatus {
    Initializing = 0,
    Running = 1,
    Closing = 2,
}

impl ClientStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientStatus::Running,
            2 => ClientStatus::Closing,
            _ => ClientStatus::Initializing,
        }
    }
}

/// Connection-init payload: a static value or a producer invoked per session
#[derive(Clone)]
pub enum ConnectionParams {
    Static(Value),
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionParams::Static(value) => f.debug_tuple("Static").field(value).finish(),
            ConnectionParams::Producer(_) => f.write_str("Producer(<fn>)"),
        }
    }
}

/// A close status, or inclusive range of statuses, that triggers a reconnect
/// without consulting the error observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatusMatcher {
    Code(i32),
    Range(i32, i32),
}

impl CloseStatusMatcher {
    pub fn matches(&self, status: i32) -> bool {
        match self {
            CloseStatusMatcher::Code(code) => *code == status,
            CloseStatusMatcher::Range(low, high) => (*low..=*high).contains(&status),
        }
    }
}

impl FromStr for CloseStatusMatcher {
    type Err = GraphQLClientError;

    /// Parse `"4400"` or `"4400-4499"`
    fn from_str(s: &str) -> Result<Self> {
        let invalid =
            || GraphQLClientError::Configuration(format!("invalid retry status code: {s}"));
        match s.split_once('-') {
            Some((low, high)) => {
                let low: i32 = low.trim().parse().map_err(|_| invalid())?;
                let high: i32 = high.trim().parse().map_err(|_| invalid())?;
                if low > high {
                    return Err(invalid());
                }
                Ok(CloseStatusMatcher::Range(low, high))
            }
            None => Ok(CloseStatusMatcher::Code(
                s.trim().parse().map_err(|_| invalid())?,
            )),
        }
    }
}

/// The subscription supervisor
///
/// Configure with the consuming `with_*` methods, register subscriptions
/// before or after [`run`](Self::run), then drive it from one task:
///
/// ```no_run
/// use graphql_stream_client::subscription::SubscriptionClient;
///
/// # async fn demo() -> graphql_stream_client::Result<()> {
/// let client = SubscriptionClient::new("ws://localhost:8080/graphql")
///     .with_exit_when_no_subscription(true);
/// let id = client
///     .subscribe_raw("subscription { messages }", None, None, |event| {
///         println!("{event:?}");
///         Ok(())
///     })
///     .await?;
/// client.run().await?;
/// # let _ = id;
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionClient {
    url: String,
    protocol: Arc<dyn SubscriptionProtocol>,
    websocket_options: WebSocketOptions,
    connection_params: Option<ConnectionParams>,
    retry_delay: Duration,
    retry_timeout: Duration,
    retry_status_codes: Vec<CloseStatusMatcher>,
    connection_initialisation_timeout: Duration,
    websocket_keep_alive_interval: Duration,
    sync_mode: bool,
    exit_when_no_subscription: bool,
    callbacks: ClientCallbacks,
    registry: Arc<SubscriptionRegistry>,
    session: RwLock<Option<Arc<Session>>>,
    error_tx: std::sync::RwLock<Option<mpsc::UnboundedSender<GraphQLClientError>>>,
    status: AtomicU8,
}

impl SubscriptionClient {
    /// Create a client for the given websocket endpoint, speaking the legacy
    /// `subscriptions-transport-ws` protocol by default
    pub fn new(url: impl Into<String>) -> Self {
        SubscriptionClient {
            url: url.into(),
            protocol: Arc::new(TransportWs),
            websocket_options: WebSocketOptions::default(),
            connection_params: None,
            retry_delay: Duration::from_secs(1),
            retry_timeout: Duration::from_secs(60),
            retry_status_codes: Vec::new(),
            connection_initialisation_timeout: Duration::ZERO,
            websocket_keep_alive_interval: Duration::ZERO,
            sync_mode: false,
            exit_when_no_subscription: false,
            callbacks: ClientCallbacks::default(),
            registry: Arc::new(SubscriptionRegistry::new()),
            session: RwLock::new(None),
            error_tx: std::sync::RwLock::new(None),
            status: AtomicU8::new(ClientStatus::Initializing as u8),
        }
    }

    /// Select the wire protocol, e.g. [`GraphqlWs`]
    pub fn with_protocol<P: SubscriptionProtocol + 'static>(mut self, protocol: P) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    /// Dial options (handshake timeout, read limit)
    pub fn with_websocket_options(mut self, options: WebSocketOptions) -> Self {
        self.websocket_options = options;
        self
    }

    /// Maximum inbound message size in bytes
    pub fn with_read_limit(mut self, read_limit: usize) -> Self {
        self.websocket_options.read_limit = Some(read_limit);
        self
    }

    /// Static payload for the protocol init frame
    pub fn with_connection_params(mut self, params: Value) -> Self {
        self.connection_params = Some(ConnectionParams::Static(params));
        self
    }

    /// Produce the init payload per session (fresh tokens and the like)
    pub fn with_connection_params_fn<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.connection_params = Some(ConnectionParams::Producer(Arc::new(producer)));
        self
    }

    /// Delay between websocket dial attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Give up dialing after this long; `Duration::ZERO` retries forever
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Close statuses that trigger a reconnect without consulting the error
    /// observer
    pub fn with_retry_status_codes(mut self, codes: Vec<CloseStatusMatcher>) -> Self {
        self.retry_status_codes = codes;
        self
    }

    /// Fail the session when the server has not acknowledged within this
    /// window; `Duration::ZERO` disables the watchdog
    pub fn with_connection_initialisation_timeout(mut self, timeout: Duration) -> Self {
        self.connection_initialisation_timeout = timeout;
        self
    }

    /// Ping the peer on this interval; a failed ping rebuilds the session.
    /// `Duration::ZERO` disables the keep-alive task
    pub fn with_websocket_keep_alive(mut self, interval: Duration) -> Self {
        self.websocket_keep_alive_interval = interval;
        self
    }

    /// Dispatch inbound messages inline, guaranteeing per-subscription
    /// ordering, instead of per-message tasks
    pub fn with_sync_mode(mut self, sync_mode: bool) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Stop the client once the last subscription is gone
    pub fn with_exit_when_no_subscription(mut self, exit: bool) -> Self {
        self.exit_when_no_subscription = exit;
        self
    }

    /// Observer fired when a session is acknowledged
    pub fn on_connected<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.callbacks.on_connected = Some(Arc::new(callback));
        self
    }

    /// Observer fired when a session's websocket is torn down, and when
    /// dialing gives up
    pub fn on_disconnected<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.callbacks.on_disconnected = Some(Arc::new(callback));
        self
    }

    /// Observer fired on protocol-level liveness signals
    pub fn on_connection_alive<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.callbacks.on_connection_alive = Some(Arc::new(callback));
        self
    }

    /// Observer consulted on session-level errors: return `Some` to make the
    /// error fatal, `None` to retry with a fresh session
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&GraphQLClientError) -> Option<GraphQLClientError> + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(callback));
        self
    }

    /// Observer fired when the server completes a subscription
    pub fn on_subscription_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Subscription) + Send + Sync + 'static,
    {
        self.callbacks.on_subscription_complete = Some(Arc::new(callback));
        self
    }

    /// The endpoint this client dials
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current client-wide status
    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ClientStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn swap_status(&self, status: ClientStatus) -> ClientStatus {
        ClientStatus::from_u8(self.status.swap(status as u8, Ordering::SeqCst))
    }

    /// True while a session is current
    pub async fn is_session_active(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Register a typed subscription derived with `graphql_client`
    pub async fn subscribe<Q, F>(&self, variables: Q::Variables, handler: F) -> Result<String>
    where
        Q: GraphQLQuery,
        F: Fn(Result<Bytes>) -> Result<()> + Send + Sync + 'static,
    {
        let payload = construct_subscription::<Q>(variables)?;
        self.subscribe_body(payload, Arc::new(handler)).await
    }

    /// Register a subscription from a raw document string
    ///
    /// Returns the stable subscription id. Registration is durable: with no
    /// acknowledged session, the subscription stays `Waiting` and is flushed
    /// when the next session acknowledges.
    pub async fn subscribe_raw<F>(
        &self,
        query: impl Into<String>,
        variables: Option<Value>,
        operation_name: Option<String>,
        handler: F,
    ) -> Result<String>
    where
        F: Fn(Result<Bytes>) -> Result<()> + Send + Sync + 'static,
    {
        let mut payload = GraphQLRequestBody::new(query);
        payload.variables = variables;
        payload.operation_name = operation_name;
        self.subscribe_body(payload, Arc::new(handler)).await
    }

    async fn subscribe_body(
        &self,
        payload: GraphQLRequestBody,
        handler: SubscriptionHandler,
    ) -> Result<String> {
        let subscription = Subscription::new(payload, handler);
        let key = subscription.key().to_string();
        debug!(key = %key, "registering subscription");
        self.registry.insert(subscription.clone()).await;

        let session = self.session.read().await.clone();
        if let Some(session) = session {
            session.insert_subscription(subscription).await;
            if session.is_acknowledged() {
                if let Some(claimed) = session.claim_for_subscribe(&key).await {
                    self.protocol.subscribe(&session, &claimed).await?;
                    session
                        .set_subscription_status(&key, SubscriptionStatus::Running)
                        .await;
                }
            }
        }
        Ok(key)
    }

    /// Look up a subscription by its stable id; retired entries are absent
    pub async fn get_subscription(&self, id: &str) -> Option<Subscription> {
        self.registry
            .get(id)
            .await
            .filter(|s| s.status() != SubscriptionStatus::Unsubscribed)
    }

    /// Stop a subscription: retire its registry entry, then send the
    /// protocol stop frame when a session is running it.
    ///
    /// An unknown id is an error; unsubscribing an entry that is already
    /// unsubscribed is not. The inert entry is dropped once the server
    /// completes it or the next session renews the registry.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let entry = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| GraphQLClientError::SubscriptionNotExists(id.to_string()))?;
        if entry.status() == SubscriptionStatus::Unsubscribed {
            return Ok(());
        }
        self.registry
            .set_status(id, SubscriptionStatus::Unsubscribed)
            .await;

        let session = self.session.read().await.clone();
        if let Some(session) = &session {
            if let Some(entry) = session.find_subscription_by_key(id).await {
                if entry.status() == SubscriptionStatus::Running {
                    self.protocol.unsubscribe(session, &entry).await?;
                }
                session
                    .set_subscription_status(id, SubscriptionStatus::Unsubscribed)
                    .await;
            }
        }

        self.check_exit_when_empty().await;
        Ok(())
    }

    async fn check_exit_when_empty(&self) {
        if !self.exit_when_no_subscription {
            return;
        }
        let session = self.session.read().await.clone();
        match session {
            Some(session) => session.check_exit_when_empty().await,
            None => {
                if !self.registry.has_active().await {
                    if let Some(tx) = self.error_sender() {
                        let _ = tx.send(GraphQLClientError::SubscriptionStopped);
                    }
                }
            }
        }
    }

    fn error_sender(&self) -> Option<mpsc::UnboundedSender<GraphQLClientError>> {
        self.error_tx.read().ok().and_then(|slot| slot.clone())
    }

    /// Run the supervisor until shutdown; see [`run_with_cancellation`](Self::run_with_cancellation)
    pub async fn run(&self) -> Result<()> {
        self.run_with_cancellation(CancellationToken::new()).await
    }

    /// Run the supervisor loop: build sessions, react to errors, reconnect.
    ///
    /// Returns `Ok(())` on graceful shutdown — cancellation, [`close`](Self::close),
    /// or the stop sentinel — and the fatal error otherwise.
    pub async fn run_with_cancellation(&self, ctx: CancellationToken) -> Result<()> {
        self.set_status(ClientStatus::Running);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.error_tx.write() {
            *slot = Some(error_tx.clone());
        }

        let result = self.supervise(&ctx, error_tx, &mut error_rx).await;

        if let Ok(mut slot) = self.error_tx.write() {
            *slot = None;
        }
        self.set_status(ClientStatus::Initializing);
        result
    }

    async fn supervise(
        &self,
        ctx: &CancellationToken,
        error_tx: mpsc::UnboundedSender<GraphQLClientError>,
        error_rx: &mut mpsc::UnboundedReceiver<GraphQLClientError>,
    ) -> Result<()> {
        'reconnect: loop {
            // tear down the previous session before building a new one
            let previous = self.session.write().await.take();
            if let Some(previous) = previous {
                let _ = self.teardown_session(&previous).await;
            }
            if self.status() == ClientStatus::Closing || ctx.is_cancelled() {
                return Ok(());
            }

            let session = match self.start_session(ctx, error_tx.clone()).await? {
                Some(session) => session,
                // cancelled while dialing
                None => return Ok(()),
            };
            *self.session.write().await = Some(Arc::clone(&session));
            session.sync_from_registry().await;

            let read_task = tokio::spawn(Session::read_loop(
                Arc::clone(&session),
                Arc::clone(&self.protocol),
                self.retry_status_codes.clone(),
            ));
            let keep_alive_task = if self.websocket_keep_alive_interval > Duration::ZERO {
                Some(tokio::spawn(Session::keep_alive_loop(
                    Arc::clone(&session),
                    self.websocket_keep_alive_interval,
                )))
            } else {
                None
            };

            let outcome = self.watch_session(ctx, &session, &error_tx, error_rx).await;

            read_task.abort();
            if let Some(task) = keep_alive_task {
                task.abort();
            }

            match outcome {
                SessionOutcome::Reconnect => continue 'reconnect,
                SessionOutcome::Shutdown(result) => {
                    let _ = self.close_internal().await;
                    return result;
                }
            }
        }
    }

    /// Select over the shutdown and error signals of one session
    async fn watch_session(
        &self,
        ctx: &CancellationToken,
        session: &Arc<Session>,
        error_tx: &mpsc::UnboundedSender<GraphQLClientError>,
        error_rx: &mut mpsc::UnboundedReceiver<GraphQLClientError>,
    ) -> SessionOutcome {
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("context cancelled, shutting down");
                    return SessionOutcome::Shutdown(Ok(()));
                }
                _ = session.cancelled() => {
                    debug!("session cancelled, shutting down");
                    return SessionOutcome::Shutdown(Ok(()));
                }
                received = error_rx.recv() => {
                    let Some(err) = received else {
                        return SessionOutcome::Shutdown(Ok(()));
                    };
                    if self.status() == ClientStatus::Closing {
                        return SessionOutcome::Shutdown(Ok(()));
                    }
                    if err.is_subscription_stopped() {
                        return SessionOutcome::Shutdown(Ok(()));
                    }
                    if err.is_retry() {
                        debug!("retry requested, rebuilding session");
                        return SessionOutcome::Reconnect;
                    }
                    match &self.callbacks.on_error {
                        Some(callback) => match callback(&err) {
                            Some(fatal) => {
                                warn!(error = %fatal, "fatal session error");
                                return SessionOutcome::Shutdown(Err(fatal));
                            }
                            None => return SessionOutcome::Reconnect,
                        },
                        None => {
                            warn!(error = %err, "session error, rebuilding session");
                            return SessionOutcome::Reconnect;
                        }
                    }
                }
                _ = watchdog.tick() => {
                    if !self.connection_initialisation_timeout.is_zero()
                        && !session.is_acknowledged()
                        && session.connection_age() > self.connection_initialisation_timeout
                    {
                        let _ = error_tx.send(GraphQLClientError::CloseStatus {
                            code: close_code::CONNECTION_INITIALISATION_TIMEOUT,
                            reason: "connection initialisation timeout".into(),
                        });
                    }
                }
            }
        }
    }

    /// Build one session: renew the registry, dial with retry, send the
    /// protocol init. `Ok(None)` means the run was cancelled while dialing.
    async fn start_session(
        &self,
        ctx: &CancellationToken,
        error_tx: mpsc::UnboundedSender<GraphQLClientError>,
    ) -> Result<Option<Arc<Session>>> {
        let renewed = self.registry.renew_all().await;
        let dial_started = Instant::now();

        loop {
            if ctx.is_cancelled() {
                return Ok(None);
            }

            let connected = tokio::select! {
                _ = ctx.cancelled() => return Ok(None),
                connected = WebSocketConn::connect(
                    &self.url,
                    self.protocol.subprotocols(),
                    &self.websocket_options,
                ) => connected,
            };
            let conn = match connected {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, url = %self.url, "websocket dial failed");
                    if self.dial_budget_exhausted(dial_started) {
                        if let Some(callback) = &self.callbacks.on_disconnected {
                            callback();
                        }
                        return Err(err);
                    }
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(None),
                        _ = sleep(self.retry_delay) => continue,
                    }
                }
            };

            let session = Arc::new(Session::new(
                conn,
                ctx.child_token(),
                Arc::clone(&self.registry),
                error_tx.clone(),
                self.callbacks.clone(),
                self.sync_mode,
                self.exit_when_no_subscription,
            ));
            for subscription in &renewed {
                session.insert_subscription(subscription.clone()).await;
            }
            stats::add_active_connection(session.id());

            let params = self.resolve_connection_params();
            if let Err(err) = self.protocol.connection_init(&session, params).await {
                warn!(error = %err, "connection init failed");
                let _ = session.close_connection().await;
                stats::add_closed_connection(session.id());
                if self.dial_budget_exhausted(dial_started) {
                    if let Some(callback) = &self.callbacks.on_disconnected {
                        callback();
                    }
                    return Err(err);
                }
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(None),
                    _ = sleep(self.retry_delay) => continue,
                }
            }

            info!(url = %self.url, session = session.id(), "session established");
            return Ok(Some(session));
        }
    }

    fn dial_budget_exhausted(&self, started: Instant) -> bool {
        !self.retry_timeout.is_zero() && started.elapsed() > self.retry_timeout
    }

    fn resolve_connection_params(&self) -> Option<Value> {
        match &self.connection_params {
            None => None,
            Some(ConnectionParams::Static(value)) => Some(value.clone()),
            Some(ConnectionParams::Producer(producer)) => Some(producer()),
        }
    }

    /// Unsubscribe everything on the session, send the protocol terminate,
    /// close the websocket, and aggregate whatever went wrong
    async fn teardown_session(&self, session: &Arc<Session>) -> Result<()> {
        let mut unsubscribe_errors = Vec::new();
        for subscription in session.snapshot().await {
            if subscription.status() == SubscriptionStatus::Running {
                if let Err(err) = self.protocol.unsubscribe(session, &subscription).await {
                    if !err.is_connection_dropped() {
                        unsubscribe_errors.push(format!("{}: {}", subscription.key(), err));
                    }
                }
            }
        }

        let protocol_close = match self.protocol.close(session).await {
            Err(err) if !err.is_connection_dropped() => Some(err.to_string()),
            _ => None,
        };
        let connection_close = match session.close_connection().await {
            Err(err) if !err.is_connection_dropped() => Some(err.to_string()),
            _ => None,
        };

        session.cancel();
        stats::add_closed_connection(session.id());
        session.fire_on_disconnected_once();

        if unsubscribe_errors.is_empty() && protocol_close.is_none() && connection_close.is_none() {
            Ok(())
        } else {
            Err(GraphQLClientError::SessionTeardown {
                unsubscribe: unsubscribe_errors,
                protocol_close,
                connection_close,
            })
        }
    }

    async fn close_internal(&self) -> Result<()> {
        self.set_status(ClientStatus::Closing);
        let session = self.session.write().await.take();
        let result = match session {
            Some(session) => self.teardown_session(&session).await,
            None => Ok(()),
        };
        self.registry.reset_to_waiting().await;
        result
    }

    /// Shut the client down: tear down the current session and stop the
    /// supervisor. Logical subscriptions stay registered and resume on the
    /// next [`run`](Self::run). Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.swap_status(ClientStatus::Closing) == ClientStatus::Closing {
            return Ok(());
        }
        let session = self.session.write().await.take();
        let result = match session {
            Some(session) => self.teardown_session(&session).await,
            None => Ok(()),
        };
        self.registry.reset_to_waiting().await;
        result
    }
}

enum SessionOutcome {
    /// Tear the session down and build a new one
    Reconnect,
    /// Stop the supervisor with the given result
    Shutdown(Result<()>),
}

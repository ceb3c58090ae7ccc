//! Per-connection session state
//!
//! A session owns everything tied to one underlying websocket: the
//! connection, a cancellable scope, the per-session subscription map with
//! refreshed ephemeral ids, the acknowledgement flag, the read loop, and the
//! optional keep-alive task. Sessions are created by the supervisor for each
//! connection attempt and discarded on reconnect.

use crate::error::{GraphQLClientError, Result};
use crate::subscription::protocol::{OperationMessage, SubscriptionProtocol};
use crate::subscription::registry::{Subscription, SubscriptionRegistry, SubscriptionStatus};
use crate::subscription::CloseStatusMatcher;
use crate::websocket::{close_code, WebSocketConn};
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback fired on connection lifecycle transitions
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback consulted on session-level errors; returning `Some` makes the
/// error fatal, `None` asks the supervisor to retry with a new session
pub type ErrorCallback = Arc<dyn Fn(&GraphQLClientError) -> Option<GraphQLClientError> + Send + Sync>;

/// Callback fired when the server completes a subscription
pub type SubscriptionCompleteCallback = Arc<dyn Fn(&Subscription) + Send + Sync>;

/// The set of observer callbacks a client carries
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub(crate) on_connected: Option<LifecycleCallback>,
    pub(crate) on_disconnected: Option<LifecycleCallback>,
    pub(crate) on_connection_alive: Option<LifecycleCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_subscription_complete: Option<SubscriptionCompleteCallback>,
}

/// All state tied to one websocket connection
pub struct Session {
    id: String,
    conn: WebSocketConn,
    cancel: CancellationToken,
    subscriptions: RwLock<IndexMap<String, Subscription>>,
    registry: Arc<SubscriptionRegistry>,
    connection_init_at: Instant,
    acknowledged: AtomicBool,
    disconnect_reported: AtomicBool,
    error_tx: mpsc::UnboundedSender<GraphQLClientError>,
    callbacks: ClientCallbacks,
    sync_mode: bool,
    exit_when_no_subscription: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn: WebSocketConn,
        cancel: CancellationToken,
        registry: Arc<SubscriptionRegistry>,
        error_tx: mpsc::UnboundedSender<GraphQLClientError>,
        callbacks: ClientCallbacks,
        sync_mode: bool,
        exit_when_no_subscription: bool,
    ) -> Self {
        Session {
            id: Uuid::new_v4().to_string(),
            conn,
            cancel,
            subscriptions: RwLock::new(IndexMap::new()),
            registry,
            connection_init_at: Instant::now(),
            acknowledged: AtomicBool::new(false),
            disconnect_reported: AtomicBool::new(false),
            error_tx,
            callbacks,
            sync_mode,
            exit_when_no_subscription,
        }
    }

    /// Connection identifier used by the statistics module
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send one protocol message over the websocket
    pub async fn send(&self, message: &OperationMessage) -> Result<()> {
        self.conn.send_json(message).await
    }

    /// True once the server acknowledged connection initialization.
    /// Monotonic for the lifetime of the session.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub(crate) fn set_acknowledged(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
    }

    /// Time since the connection init frame was sent
    pub(crate) fn connection_age(&self) -> Duration {
        self.connection_init_at.elapsed()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) async fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.key().to_string(), subscription);
    }

    /// Copy registry entries missing from the session map, in registration
    /// order; covers subscriptions registered while the session was being
    /// built
    pub(crate) async fn sync_from_registry(&self) {
        for key in self.registry.keys().await {
            let known = self.subscriptions.read().await.contains_key(&key);
            if !known {
                if let Some(entry) = self.registry.get(&key).await {
                    self.insert_subscription(entry).await;
                }
            }
        }
    }

    /// Look up a subscription by its stable key
    pub(crate) async fn find_subscription_by_key(&self, key: &str) -> Option<Subscription> {
        self.subscriptions.read().await.get(key).cloned()
    }

    /// Look up a subscription by its ephemeral wire id
    pub(crate) async fn find_subscription(&self, session_id: &str) -> Option<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .find(|s| s.session_id() == session_id)
            .cloned()
    }

    /// Subscriptions still waiting for their subscribe frame, in
    /// registration order
    pub(crate) async fn waiting_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.status() == SubscriptionStatus::Waiting)
            .cloned()
            .collect()
    }

    /// Atomically claim a `Waiting` subscription for its subscribe frame.
    /// Exactly one of the ack flush and a concurrent `subscribe` call wins,
    /// so the server never sees the same id started twice.
    pub(crate) async fn claim_for_subscribe(&self, key: &str) -> Option<Subscription> {
        let mut subscriptions = self.subscriptions.write().await;
        match subscriptions.get_mut(key) {
            Some(entry) if entry.status() == SubscriptionStatus::Waiting => {
                entry.set_status(SubscriptionStatus::Running);
                Some(entry.clone())
            }
            _ => None,
        }
    }

    /// Update a subscription's status in the session map and the registry
    pub(crate) async fn set_subscription_status(&self, key: &str, status: SubscriptionStatus) {
        if let Some(entry) = self.subscriptions.write().await.get_mut(key) {
            entry.set_status(status);
        }
        self.registry.set_status(key, status).await;
    }

    /// Snapshot of the session's subscriptions
    pub(crate) async fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.read().await.values().cloned().collect()
    }

    pub(crate) fn fire_on_connected(&self) {
        if let Some(callback) = &self.callbacks.on_connected {
            callback();
        }
    }

    pub(crate) fn fire_on_connection_alive(&self) {
        if let Some(callback) = &self.callbacks.on_connection_alive {
            callback();
        }
    }

    /// Fire the disconnect observer exactly once per session
    pub(crate) fn fire_on_disconnected_once(&self) {
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            if let Some(callback) = &self.callbacks.on_disconnected {
                callback();
            }
        }
    }

    /// Forward an error to the supervisor; a dropped receiver means the
    /// client is already shutting down and the error is moot
    pub(crate) fn report_error(&self, err: GraphQLClientError) {
        let _ = self.error_tx.send(err);
    }

    /// Run the user handler and forward a returned error to the supervisor
    pub(crate) fn dispatch(&self, subscription: &Subscription, result: Result<Bytes>) {
        if let Err(err) = subscription.invoke_handler(result) {
            self.report_error(err);
        }
    }

    /// Server completed a subscription: notify, then drop it from the
    /// session and the registry
    pub(crate) async fn complete_subscription(&self, subscription: &Subscription) {
        debug!(key = subscription.key(), "subscription completed by server");
        if let Some(callback) = &self.callbacks.on_subscription_complete {
            callback(subscription);
        }
        self.subscriptions.write().await.shift_remove(subscription.key());
        self.registry.remove(subscription.key()).await;
        self.check_exit_when_empty().await;
    }

    /// With the exit-when-empty policy, stop the client once no logical
    /// subscription remains and no session entry is still awaiting its
    /// server-side completion
    pub(crate) async fn check_exit_when_empty(&self) {
        if !self.exit_when_no_subscription {
            return;
        }
        if self.registry.has_active().await {
            return;
        }
        if !self.subscriptions.read().await.is_empty() {
            return;
        }
        self.report_error(GraphQLClientError::SubscriptionStopped);
    }

    pub(crate) async fn close_connection(&self) -> Result<()> {
        self.conn.close().await
    }

    /// The session's read loop: decode inbound frames and dispatch them to
    /// the protocol, or translate failures into supervisor signals
    pub(crate) async fn read_loop(
        self: Arc<Self>,
        protocol: Arc<dyn SubscriptionProtocol>,
        retry_status_codes: Vec<CloseStatusMatcher>,
    ) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = self.conn.receive::<OperationMessage>() => received,
            };

            match received {
                Ok(message) => {
                    debug!(message_type = %message.message_type, id = ?message.id, "received message");
                    let subscription = match &message.id {
                        Some(id) => self.find_subscription(id).await,
                        None => None,
                    };
                    if self.sync_mode {
                        if let Err(err) = protocol.on_message(&self, subscription, message).await {
                            self.report_error(err);
                        }
                    } else {
                        let session = Arc::clone(&self);
                        let protocol = Arc::clone(&protocol);
                        tokio::spawn(async move {
                            if let Err(err) = protocol.on_message(&session, subscription, message).await
                            {
                                session.report_error(err);
                            }
                        });
                    }
                }
                Err(err) => {
                    if self.is_cancelled() {
                        return;
                    }
                    if err.is_connection_dropped() {
                        debug!(error = %err, "connection dropped, requesting retry");
                        self.report_error(GraphQLClientError::Retry);
                        return;
                    }

                    let status = err.close_status();
                    if status >= 0 {
                        if retry_status_codes.iter().any(|m| m.matches(status)) {
                            self.report_error(GraphQLClientError::Retry);
                            return;
                        }
                        match status {
                            close_code::BAD_GATEWAY | close_code::NO_STATUS_RECEIVED => {
                                self.report_error(GraphQLClientError::Retry);
                                return;
                            }
                            close_code::NORMAL_CLOSURE | close_code::ABNORMAL_CLOSURE => {
                                debug!(status, "close event from server, stopping session");
                                self.cancel();
                                return;
                            }
                            close_code::INTERNAL_ERROR
                            | close_code::INVALID_MESSAGE
                            | close_code::CONNECTION_INITIALISATION_TIMEOUT
                            | close_code::TOO_MANY_INITIALISATION_REQUESTS
                            | close_code::SUBSCRIBER_ALREADY_EXISTS
                            | close_code::UNAUTHORIZED => {
                                self.report_error(err);
                                return;
                            }
                            _ => {}
                        }
                    }

                    // not a close status the tables know: let the error
                    // observer decide, otherwise keep reading
                    if let Some(callback) = &self.callbacks.on_error {
                        if callback(&err).is_some() {
                            self.cancel();
                            return;
                        }
                    }
                    warn!(error = %err, "read error, continuing");
                }
            }
        }
    }

    /// Ping the peer on an interval; a failed ping asks the supervisor for a
    /// fresh session
    pub(crate) async fn keep_alive_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick is immediate
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.conn.ping().await {
                        warn!(error = %err, "keep-alive ping failed");
                        self.report_error(GraphQLClientError::Retry);
                        return;
                    }
                }
            }
        }
    }
}

//! Subscription records and the client-wide registry
//!
//! The registry is the canonical set of logical subscriptions. It survives
//! reconnects; each session derives its own view from it at startup. A
//! subscription keeps a stable `key` for its whole life and a fresh
//! `session_id` per session so server-side ids never collide across
//! reconnects.

use crate::error::Result;
use crate::graphql::GraphQLRequestBody;
use bytes::Bytes;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Callback invoked with raw response bytes or a subscription-level error.
/// A returned error is forwarded to the supervisor; returning
/// [`GraphQLClientError::SubscriptionStopped`](crate::GraphQLClientError::SubscriptionStopped)
/// shuts the client down cleanly.
pub type SubscriptionHandler = Arc<dyn Fn(Result<Bytes>) -> Result<()> + Send + Sync + 'static>;

/// Lifecycle state of a logical subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Registered, waiting for an acknowledged session to send the subscribe
    Waiting,
    /// Subscribe frame sent on an acknowledged session
    Running,
    /// Stopped by the caller or completed by the server; inert
    Unsubscribed,
}

/// A logical subscription request
#[derive(Clone)]
pub struct Subscription {
    key: String,
    session_id: String,
    payload: GraphQLRequestBody,
    handler: SubscriptionHandler,
    status: SubscriptionStatus,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .field("status", &self.status)
            .field("operation_name", &self.payload.operation_name)
            .finish()
    }
}

impl Subscription {
    /// Create a new subscription; key and session id start out equal
    pub fn new(payload: GraphQLRequestBody, handler: SubscriptionHandler) -> Self {
        let id = Uuid::new_v4().to_string();
        Subscription {
            key: id.clone(),
            session_id: id,
            payload,
            handler,
            status: SubscriptionStatus::Waiting,
        }
    }

    /// Stable identifier, constant across reconnects
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ephemeral identifier used on the wire for the current session
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The subscribe payload (query, variables, operation name)
    pub fn payload(&self) -> &GraphQLRequestBody {
        &self.payload
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
    }

    /// Clone for a fresh session: same key, payload and handler, new
    /// session id, status back to `Waiting`
    pub(crate) fn renewed(&self) -> Self {
        Subscription {
            key: self.key.clone(),
            session_id: Uuid::new_v4().to_string(),
            payload: self.payload.clone(),
            handler: Arc::clone(&self.handler),
            status: SubscriptionStatus::Waiting,
        }
    }

    /// Run the user handler with a data frame or subscription-level error
    pub fn invoke_handler(&self, result: Result<Bytes>) -> Result<()> {
        (self.handler)(result)
    }
}

/// The supervisor-owned set of logical subscriptions, in registration order
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<IndexMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, subscription: Subscription) {
        self.entries
            .write()
            .await
            .insert(subscription.key().to_string(), subscription);
    }

    pub async fn remove(&self, key: &str) -> Option<Subscription> {
        self.entries.write().await.shift_remove(key)
    }

    pub async fn get(&self, key: &str) -> Option<Subscription> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn set_status(&self, key: &str, status: SubscriptionStatus) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.set_status(status);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// True when any subscription is `Waiting` or `Running`
    pub async fn has_active(&self) -> bool {
        self.entries
            .read()
            .await
            .values()
            .any(|s| s.status() != SubscriptionStatus::Unsubscribed)
    }

    /// Prepare for a new session: drop `Unsubscribed` leftovers, renew every
    /// remaining entry in place, and return the renewed set in registration
    /// order
    pub async fn renew_all(&self) -> Vec<Subscription> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, s| s.status() != SubscriptionStatus::Unsubscribed);
        let mut renewed = Vec::with_capacity(entries.len());
        for entry in entries.values_mut() {
            *entry = entry.renewed();
            renewed.push(entry.clone());
        }
        renewed
    }

    /// Reset every entry to `Waiting` without touching ids, used when a
    /// session goes away but the client keeps running
    pub async fn reset_to_waiting(&self) {
        for entry in self.entries.write().await.values_mut() {
            if entry.status() == SubscriptionStatus::Running {
                entry.set_status(SubscriptionStatus::Waiting);
            }
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

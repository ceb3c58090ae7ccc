//! Subscription wire protocols
//!
//! Both supported subprotocols exchange the same envelope — an optional id,
//! a type tag, and an opaque payload — but differ in their type vocabulary
//! and a handful of rules. Everything protocol-specific lives behind
//! [`SubscriptionProtocol`]; all mutable state stays in the session.

use crate::error::{GraphQLClientError, Result};
use crate::graphql::{GraphQLError, GraphQLResponse};
use crate::subscription::registry::{Subscription, SubscriptionStatus};
use crate::subscription::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod graphql_ws;
mod transport_ws;

pub use graphql_ws::GraphqlWs;
pub use transport_ws::TransportWs;

/// Wire envelope shared by both subscription protocols
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        OperationMessage {
            id: None,
            message_type: message_type.into(),
            payload: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// The capability set a subscription wire protocol implements
///
/// Implementations are stateless; they drive the [`Session`] they are handed.
#[async_trait]
pub trait SubscriptionProtocol: Send + Sync {
    /// `Sec-WebSocket-Protocol` values to offer during the handshake
    fn subprotocols(&self) -> &'static [&'static str];

    /// Send the protocol's init frame carrying `params` as an opaque payload
    async fn connection_init(&self, session: &Session, params: Option<Value>) -> Result<()>;

    /// Send the start/subscribe frame binding the subscription's session id
    /// to its payload
    async fn subscribe(&self, session: &Session, subscription: &Subscription) -> Result<()>;

    /// Send the stop/complete frame for the subscription's session id;
    /// an already-closed transport is not an error
    async fn unsubscribe(&self, session: &Session, subscription: &Subscription) -> Result<()>;

    /// Interpret one inbound frame: drive session state or invoke the
    /// subscription handler
    async fn on_message(
        &self,
        session: &Session,
        subscription: Option<Subscription>,
        message: OperationMessage,
    ) -> Result<()>;

    /// Best-effort terminate frame; must be idempotent
    async fn close(&self, session: &Session) -> Result<()>;
}

/// Shared acknowledgement flow: mark the session acknowledged, notify the
/// connect observer, then flush every waiting subscription in registration
/// order
pub(crate) async fn acknowledge_session<P>(protocol: &P, session: &Session) -> Result<()>
where
    P: SubscriptionProtocol + ?Sized,
{
    session.set_acknowledged();
    session.fire_on_connected();
    for subscription in session.waiting_subscriptions().await {
        let Some(claimed) = session.claim_for_subscribe(subscription.key()).await else {
            continue;
        };
        protocol.subscribe(session, &claimed).await?;
        session
            .set_subscription_status(claimed.key(), SubscriptionStatus::Running)
            .await;
    }
    Ok(())
}

/// Turn a `data`/`next` payload into what the handler sees: the raw bytes of
/// `payload.data`, or the structured error list when `payload.errors` is
/// present
pub(crate) fn payload_to_handler_result(payload: Option<Value>) -> Result<Bytes> {
    let envelope: GraphQLResponse = serde_json::from_value(payload.unwrap_or(Value::Null))
        .map_err(|e| GraphQLClientError::Serialization(e.to_string()))?;
    if let Some(errors) = envelope.errors {
        if !errors.is_empty() {
            return Err(GraphQLClientError::GraphQL(errors));
        }
    }
    let data = envelope.data.unwrap_or(Value::Null);
    Ok(Bytes::from(serde_json::to_vec(&data)?))
}

/// Interpret the payload of an `error` frame as a structured error list
pub(crate) fn payload_to_errors(payload: Option<Value>) -> GraphQLClientError {
    match payload {
        Some(value @ Value::Array(_)) => match serde_json::from_value::<Vec<GraphQLError>>(value) {
            Ok(errors) => GraphQLClientError::GraphQL(errors),
            Err(e) => GraphQLClientError::Serialization(e.to_string()),
        },
        Some(value @ Value::Object(_)) => match serde_json::from_value::<GraphQLError>(value.clone())
        {
            Ok(error) => GraphQLClientError::GraphQL(vec![error]),
            Err(_) => GraphQLClientError::Custom(value.to_string()),
        },
        Some(other) => GraphQLClientError::Custom(other.to_string()),
        None => GraphQLClientError::Custom("subscription error without payload".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let message = OperationMessage::new("subscribe")
            .with_id("sub-1")
            .with_payload(json!({"query": "subscription { a }"}));

        let text = serde_json::to_string(&message).unwrap();
        let decoded: OperationMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_envelope_omits_missing_fields() {
        let text = serde_json::to_string(&OperationMessage::new("connection_ack")).unwrap();
        assert_eq!(text, r#"{"type":"connection_ack"}"#);
    }

    #[test]
    fn test_envelope_decodes_bare_type() {
        let decoded: OperationMessage = serde_json::from_str(r#"{"type":"ka"}"#).unwrap();
        assert_eq!(decoded.message_type, "ka");
        assert!(decoded.id.is_none());
        assert!(decoded.payload.is_none());
    }

    #[test]
    fn test_data_payload_yields_raw_bytes() {
        let payload = json!({"data": {"value": 42}});
        let bytes = payload_to_handler_result(Some(payload)).unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), r#"{"value":42}"#);
    }

    #[test]
    fn test_data_payload_with_errors_yields_error() {
        let payload = json!({"data": null, "errors": [{"message": "boom"}]});
        let err = payload_to_handler_result(Some(payload)).unwrap_err();
        match err {
            GraphQLClientError::GraphQL(errors) => assert_eq!(errors[0].message, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_payload_variants() {
        let err = payload_to_errors(Some(json!([{"message": "one"}, {"message": "two"}])));
        match err {
            GraphQLClientError::GraphQL(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        let err = payload_to_errors(Some(json!({"message": "single"})));
        match err {
            GraphQLClientError::GraphQL(errors) => assert_eq!(errors[0].message, "single"),
            other => panic!("unexpected error: {other}"),
        }

        let err = payload_to_errors(None);
        assert!(matches!(err, GraphQLClientError::Custom(_)));
    }
}

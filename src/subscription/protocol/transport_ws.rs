//! Legacy Apollo `subscriptions-transport-ws` protocol
//!
//! Advertised as subprotocol `graphql-ws`. Operations start with a `start`
//! frame wrapping the request body and stream back `data` frames; the server
//! signals liveness with `ka` frames.

use crate::error::{GraphQLClientError, Result};
use crate::subscription::protocol::{
    acknowledge_session, payload_to_errors, payload_to_handler_result, OperationMessage,
    SubscriptionProtocol,
};
use crate::subscription::registry::Subscription;
use crate::subscription::session::Session;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

const CONNECTION_INIT: &str = "connection_init";
const CONNECTION_ACK: &str = "connection_ack";
const CONNECTION_ERROR: &str = "connection_error";
const CONNECTION_KEEP_ALIVE: &str = "ka";
const START: &str = "start";
const DATA: &str = "data";
const ERROR: &str = "error";
const COMPLETE: &str = "complete";
const STOP: &str = "stop";
const CONNECTION_TERMINATE: &str = "connection_terminate";

const SUBPROTOCOLS: &[&str] = &["graphql-ws"];

/// The legacy Apollo subscription protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportWs;

#[async_trait]
impl SubscriptionProtocol for TransportWs {
    fn subprotocols(&self) -> &'static [&'static str] {
        SUBPROTOCOLS
    }

    async fn connection_init(&self, session: &Session, params: Option<Value>) -> Result<()> {
        let mut message = OperationMessage::new(CONNECTION_INIT);
        message.payload = params;
        session.send(&message).await
    }

    async fn subscribe(&self, session: &Session, subscription: &Subscription) -> Result<()> {
        let message = OperationMessage::new(START)
            .with_id(subscription.session_id())
            .with_payload(serde_json::to_value(subscription.payload())?);
        session.send(&message).await
    }

    async fn unsubscribe(&self, session: &Session, subscription: &Subscription) -> Result<()> {
        let message = OperationMessage::new(STOP).with_id(subscription.session_id());
        match session.send(&message).await {
            Err(err) if err.is_connection_dropped() => {
                debug!(key = subscription.key(), "stop frame skipped, connection already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn on_message(
        &self,
        session: &Session,
        subscription: Option<Subscription>,
        message: OperationMessage,
    ) -> Result<()> {
        match message.message_type.as_str() {
            CONNECTION_ACK => acknowledge_session(self, session).await?,
            CONNECTION_KEEP_ALIVE => session.fire_on_connection_alive(),
            CONNECTION_ERROR => {
                session.report_error(GraphQLClientError::ConnectionError(
                    message.payload.unwrap_or(Value::Null),
                ));
            }
            DATA => match subscription {
                Some(subscription) => {
                    session.dispatch(&subscription, payload_to_handler_result(message.payload));
                }
                None => debug!(id = ?message.id, "data frame for unknown subscription"),
            },
            ERROR => {
                if let Some(subscription) = subscription {
                    session.dispatch(&subscription, Err(payload_to_errors(message.payload)));
                }
            }
            COMPLETE => {
                if let Some(subscription) = subscription {
                    session.complete_subscription(&subscription).await;
                }
            }
            other => debug!(message_type = other, "ignoring unexpected message"),
        }
        Ok(())
    }

    async fn close(&self, session: &Session) -> Result<()> {
        let message = OperationMessage::new(CONNECTION_TERMINATE);
        match session.send(&message).await {
            Err(err) if err.is_connection_dropped() => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::GraphQLRequestBody;
    use std::sync::Arc;

    #[test]
    fn test_subprotocols() {
        assert_eq!(TransportWs.subprotocols(), &["graphql-ws"]);
    }

    #[test]
    fn test_start_frame_shape() {
        let payload = GraphQLRequestBody::new("subscription { messages }")
            .with_operation_name("Messages");
        let subscription = Subscription::new(payload, Arc::new(|_| Ok(())));

        let message = OperationMessage::new(START)
            .with_id(subscription.session_id())
            .with_payload(serde_json::to_value(subscription.payload()).unwrap());

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["id"], subscription.session_id());
        assert_eq!(value["payload"]["query"], "subscription { messages }");
        assert_eq!(value["payload"]["operationName"], "Messages");
    }

    #[test]
    fn test_stop_frame_shape() {
        let message = OperationMessage::new(STOP).with_id("abc");
        let text = serde_json::to_string(&message).unwrap();
        assert_eq!(text, r#"{"id":"abc","type":"stop"}"#);
    }
}

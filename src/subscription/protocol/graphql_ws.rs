//! Modern `graphql-transport-ws` protocol
//!
//! Advertised as subprotocol `graphql-transport-ws`. Operations start with a
//! `subscribe` frame carrying the request body directly and stream back
//! `next` frames. Liveness runs over protocol-level `ping`/`pong` frames; an
//! inbound `ping` must be answered with a `pong` echoing its payload.

use crate::error::Result;
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
const PING: &str = "ping";
const PONG: &str = "pong";
const SUBSCRIBE: &str = "subscribe";
const NEXT: &str = "next";
const ERROR: &str = "error";
const COMPLETE: &str = "complete";

const SUBPROTOCOLS: &[&str] = &["graphql-transport-ws"];

/// The modern graphql-ws subscription protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphqlWs;

#[async_trait]
impl SubscriptionProtocol for GraphqlWs {
    fn subprotocols(&self) -> &'static [&'static str] {
        SUBPROTOCOLS
    }

    async fn connection_init(&self, session: &Session, params: Option<Value>) -> Result<()> {
        let mut message = OperationMessage::new(CONNECTION_INIT);
        message.payload = params;
        session.send(&message).await
    }

    async fn subscribe(&self, session: &Session, subscription: &Subscription) -> Result<()> {
        let message = OperationMessage::new(SUBSCRIBE)
            .with_id(subscription.session_id())
            .with_payload(serde_json::to_value(subscription.payload())?);
        session.send(&message).await
    }

    async fn unsubscribe(&self, session: &Session, subscription: &Subscription) -> Result<()> {
        let message = OperationMessage::new(COMPLETE).with_id(subscription.session_id());
        match session.send(&message).await {
            Err(err) if err.is_connection_dropped() => {
                debug!(key = subscription.key(), "complete frame skipped, connection already gone");
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
            PING => {
                // echo the payload back; a ping doubles as a liveness signal
                let mut pong = OperationMessage::new(PONG);
                pong.payload = message.payload;
                session.send(&pong).await?;
                session.fire_on_connection_alive();
            }
            PONG => session.fire_on_connection_alive(),
            NEXT => match subscription {
                Some(subscription) => {
                    session.dispatch(&subscription, payload_to_handler_result(message.payload));
                }
                None => debug!(id = ?message.id, "next frame for unknown subscription"),
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

    /// The modern protocol has no terminate frame; closing the websocket is
    /// the teardown
    async fn close(&self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

//! Error types for the GraphQL client
//!
//! A single error enum covers both transports: HTTP request failures for
//! queries/mutations, and transport/protocol failures for websocket
//! subscriptions. Two sentinel variants drive the subscription supervisor:
//! [`GraphQLClientError::SubscriptionStopped`] requests an orderly shutdown,
//! and [`GraphQLClientError::Retry`] asks the supervisor to tear down the
//! current session and open a new one without invoking user-level error
//! handling.

use crate::graphql::GraphQLError;
use thiserror::Error;

/// Main error type for the GraphQL client
#[derive(Error, Debug, Clone)]
pub enum GraphQLClientError {
    // Transport errors

    /// Network communication error (HTTP transport)
    #[error("Network error: {0}")]
    Network(String),

    /// WebSocket communication error (dial, read, write, closed stream)
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer closed the websocket with a numeric status
    #[error("WebSocket closed with status {code}: {reason}")]
    CloseStatus { code: i32, reason: String },

    // Protocol errors

    /// The server rejected connection initialization (`connection_error`)
    #[error("Connection error: {0}")]
    ConnectionError(serde_json::Value),

    /// Server-side GraphQL errors returned in a response or subscription frame
    #[error("{}", format_graphql_errors(.0))]
    GraphQL(Vec<GraphQLError>),

    // Usage errors

    /// Lookup of an unknown subscription id
    #[error("Subscription does not exist: {0}")]
    SubscriptionNotExists(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Encoding errors

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    // HTTP response errors

    /// Non-success HTTP status from the GraphQL endpoint
    #[error("HTTP error: {status}")]
    Http { status: u16, body: String },

    /// Response body did not match the GraphQL envelope
    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    /// Aggregated errors collected while tearing down a session
    #[error("Session teardown failed: {}", format_teardown(.unsubscribe, .protocol_close, .connection_close))]
    SessionTeardown {
        unsubscribe: Vec<String>,
        protocol_close: Option<String>,
        connection_close: Option<String>,
    },

    // Sentinels

    /// A handler or caller requested that the subscription client stop cleanly
    #[error("Subscription stopped")]
    SubscriptionStopped,

    /// Internal signal: rebuild the current session
    #[error("retry")]
    Retry,

    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

/// Type alias for Results using GraphQLClientError
pub type Result<T> = std::result::Result<T, GraphQLClientError>;

fn format_graphql_errors(errors: &[GraphQLError]) -> String {
    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    format!("GraphQL errors: {}", messages.join(", "))
}

fn format_teardown(
    unsubscribe: &[String],
    protocol_close: &Option<String>,
    connection_close: &Option<String>,
) -> String {
    let mut parts = Vec::new();
    if !unsubscribe.is_empty() {
        parts.push(format!("unsubscribe: [{}]", unsubscribe.join(", ")));
    }
    if let Some(err) = protocol_close {
        parts.push(format!("protocol close: {err}"));
    }
    if let Some(err) = connection_close {
        parts.push(format!("connection close: {err}"));
    }
    parts.join("; ")
}

impl GraphQLClientError {
    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        GraphQLClientError::Custom(msg.into())
    }

    /// The numeric close status carried by this error, or -1 when unknown
    pub fn close_status(&self) -> i32 {
        match self {
            GraphQLClientError::CloseStatus { code, .. } => *code,
            _ => -1,
        }
    }

    /// Check if this error is the internal retry sentinel
    pub fn is_retry(&self) -> bool {
        matches!(self, GraphQLClientError::Retry)
    }

    /// Check if this error is the clean-shutdown sentinel
    pub fn is_subscription_stopped(&self) -> bool {
        matches!(self, GraphQLClientError::SubscriptionStopped)
    }

    /// Check if this error indicates the websocket connection went away
    /// (EOF, reset, or writes against an already-closed stream)
    pub fn is_connection_dropped(&self) -> bool {
        match self {
            GraphQLClientError::WebSocket(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("closed") || msg.contains("reset") || msg.contains("eof")
            }
            _ => false,
        }
    }

    /// Check if this error is a network-related error
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            GraphQLClientError::Network(_)
                | GraphQLClientError::WebSocket(_)
                | GraphQLClientError::CloseStatus { .. }
        )
    }

    /// Check if this error carries server-side GraphQL errors
    pub fn is_graphql_error(&self) -> bool {
        matches!(self, GraphQLClientError::GraphQL(_))
    }
}

// Implement From traits for easier error conversion
impl From<reqwest::Error> for GraphQLClientError {
    fn from(error: reqwest::Error) -> Self {
        GraphQLClientError::Network(error.to_string())
    }
}

impl From<serde_json::Error> for GraphQLClientError {
    fn from(error: serde_json::Error) -> Self {
        GraphQLClientError::Serialization(error.to_string())
    }
}

impl From<tungstenite::Error> for GraphQLClientError {
    fn from(error: tungstenite::Error) -> Self {
        use tungstenite::error::{Error as WsError, ProtocolError};

        match error {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                GraphQLClientError::WebSocket("connection closed".into())
            }
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                GraphQLClientError::WebSocket("connection reset without closing handshake".into())
            }
            // a peer that sets reserved bits while closing is a known server
            // quirk, read as a normal closure rather than a protocol violation
            WsError::Protocol(ProtocolError::NonZeroReservedBits) => {
                GraphQLClientError::CloseStatus {
                    code: crate::websocket::close_code::NORMAL_CLOSURE,
                    reason: "non-zero reserved bits".into(),
                }
            }
            WsError::Io(e) => GraphQLClientError::WebSocket(format!("io error: {e}")),
            other => GraphQLClientError::WebSocket(other.to_string()),
        }
    }
}

//! GraphQL stream client
//!
//! A GraphQL client that speaks two transports: HTTP for queries and
//! mutations, and a long-lived websocket for subscriptions. The subscription
//! side multiplexes many logical subscriptions over a single connection,
//! reconnects with retry/backoff, and resumes registered subscriptions after
//! every reconnect.
//!
//! # Features
//!
//! - **HTTP Queries & Mutations**: JSON POST with typed or raw documents,
//!   structured GraphQL error surfacing, retry with `Retry-After` support
//! - **WebSocket Subscriptions**: one supervisor, many subscriptions, one
//!   socket, with automatic reconnection and re-subscription
//! - **Two Wire Protocols**: legacy Apollo `subscriptions-transport-ws` and
//!   modern `graphql-transport-ws` behind one trait
//! - **Lifecycle Observability**: connected/disconnected/alive/complete
//!   callbacks plus an error observer that decides retry vs. fail
//! - **Connection Statistics**: process-wide active/closed counters with a
//!   bounded deduplicating cache of closed connection ids
//!
//! # Quick Start
//!
//! ```no_run
//! use graphql_stream_client::{GraphqlWs, SubscriptionClient};
//!
//! #[tokio::main]
//! async fn main() -> graphql_stream_client::Result<()> {
//!     let client = SubscriptionClient::new("wss://example.com/graphql")
//!         .with_protocol(GraphqlWs)
//!         .with_retry_delay(std::time::Duration::from_secs(1));
//!
//!     client
//!         .subscribe_raw("subscription { messages { body } }", None, None, |event| {
//!             match event {
//!                 Ok(data) => println!("{}", String::from_utf8_lossy(&data)),
//!                 Err(err) => eprintln!("subscription error: {err}"),
//!             }
//!             Ok(())
//!         })
//!         .await?;
//!
//!     client.run().await
//! }
//! ```

/// Crate version constant
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Core modules
pub mod error;
pub mod graphql;

// HTTP transport
pub mod client;
pub mod request;

// WebSocket transport
pub mod stats;
pub mod subscription;
pub mod websocket;

// Re-exports for convenience
pub use client::{GraphQLClient, RetryPolicy};
pub use error::{GraphQLClientError, Result};
pub use graphql::{ErrorLocation, GraphQLError, GraphQLRequestBody, GraphQLResponse};
pub use request::{bind_target, RequestOption};
pub use stats::{
    add_active_connection, add_closed_connection, connection_stats, reset_connection_stats,
    set_closed_connection_cache_cap, ConnectionStats, ConnectionStatsSnapshot,
};
pub use subscription::{
    ClientStatus, CloseStatusMatcher, ConnectionParams, GraphqlWs, OperationMessage, Subscription,
    SubscriptionClient, SubscriptionHandler, SubscriptionProtocol, SubscriptionStatus, TransportWs,
};
pub use websocket::{close_code, WebSocketConn, WebSocketOptions};

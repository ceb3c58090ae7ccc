//! HTTP GraphQL client for queries and mutations
//!
//! Performs JSON POST requests carrying `{query, variables, operationName?}`
//! and decodes the `{data, errors, extensions}` envelope. Server-side
//! GraphQL errors surface as [`GraphQLClientError::GraphQL`]; transport and
//! HTTP failures keep their own variants. Retries on configured status codes
//! use exponential backoff and honor `Retry-After`.

use crate::error::{GraphQLClientError, Result};
use crate::graphql::{GraphQLRequestBody, GraphQLResponse};
use crate::request::{apply_request_options, construct_query, RequestOption};
use graphql_client::GraphQLQuery;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

mod retry;
pub use retry::RetryPolicy;

/// Hook for adorning every outgoing request (auth headers and the like)
pub type RequestModifier =
    Arc<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

/// HTTP GraphQL client
#[derive(Clone)]
pub struct GraphQLClient {
    url: String,
    http_client: reqwest::Client,
    request_modifier: Option<RequestModifier>,
    retry_policy: Option<RetryPolicy>,
}

impl GraphQLClient {
    /// Create a client for the given GraphQL endpoint
    pub fn new(url: impl Into<String>) -> Self {
        GraphQLClient {
            url: url.into(),
            http_client: reqwest::Client::new(),
            request_modifier: None,
            retry_policy: None,
        }
    }

    /// Use a custom `reqwest` client (connection pool, timeouts, TLS setup)
    pub fn with_http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = http_client;
        self
    }

    /// Install a request modifier applied to every outgoing request
    pub fn with_request_modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync + 'static,
    {
        self.request_modifier = Some(Arc::new(modifier));
        self
    }

    /// Enable retries on the policy's status codes
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Get the endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute a raw query and return the `data` value
    pub async fn query_raw(
        &self,
        query: impl Into<String>,
        variables: Option<Value>,
        options: &[RequestOption],
    ) -> Result<Value> {
        let mut body = GraphQLRequestBody::new(query);
        body.variables = variables;
        self.execute(body, options).await
    }

    /// Execute a raw mutation and return the `data` value
    pub async fn mutate_raw(
        &self,
        mutation: impl Into<String>,
        variables: Option<Value>,
        options: &[RequestOption],
    ) -> Result<Value> {
        self.query_raw(mutation, variables, options).await
    }

    /// Execute a typed query derived with `graphql_client`
    pub async fn query<Q: GraphQLQuery>(
        &self,
        variables: Q::Variables,
        options: &[RequestOption],
    ) -> Result<Q::ResponseData> {
        let body = construct_query::<Q>(variables)?;
        let data = self.execute(body, options).await?;
        serde_json::from_value(data)
            .map_err(|e| GraphQLClientError::InvalidResponse(e.to_string()))
    }

    /// Execute a typed mutation derived with `graphql_client`
    pub async fn mutate<Q: GraphQLQuery>(
        &self,
        variables: Q::Variables,
        options: &[RequestOption],
    ) -> Result<Q::ResponseData> {
        self.query::<Q>(variables, options).await
    }

    /// Send a request body, retrying per policy, and return the `data` value
    pub async fn execute(
        &self,
        body: GraphQLRequestBody,
        options: &[RequestOption],
    ) -> Result<Value> {
        let body = apply_request_options(body, options);
        let max_attempts = self
            .retry_policy
            .as_ref()
            .map(|p| p.max_attempts.max(1))
            .unwrap_or(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&body, options, attempt).await {
                Ok(data) => {
                    if attempt > 1 {
                        debug!(attempt, "request succeeded after retry");
                    }
                    return Ok(data);
                }
                Err(RequestOutcome::Fatal(err)) => return Err(err),
                Err(RequestOutcome::Retryable { err, delay }) => {
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
                    sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        body: &GraphQLRequestBody,
        options: &[RequestOption],
        attempt: u32,
    ) -> std::result::Result<Value, RequestOutcome> {
        let mut request = self.http_client.post(&self.url).json(body);
        if let Some(modifier) = &self.request_modifier {
            request = modifier(request);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RequestOutcome::Fatal(GraphQLClientError::Network(e.to_string())))?;

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let retry_delay = self
                .retry_policy
                .as_ref()
                .filter(|p| p.should_retry(status.as_u16()))
                .map(|p| p.delay_for(attempt, &headers));
            let text = response.text().await.unwrap_or_default();
            let err = GraphQLClientError::Http {
                status: status.as_u16(),
                body: text,
            };
            return Err(match retry_delay {
                Some(delay) => RequestOutcome::Retryable { err, delay },
                None => RequestOutcome::Fatal(err),
            });
        }

        let envelope: GraphQLResponse = response
            .json()
            .await
            .map_err(|e| RequestOutcome::Fatal(GraphQLClientError::InvalidResponse(e.to_string())))?;

        bind_response_targets(options, &headers, envelope.extensions.as_ref());

        if let Some(errors) = envelope.errors {
            if !errors.is_empty() {
                return Err(RequestOutcome::Fatal(GraphQLClientError::GraphQL(errors)));
            }
        }

        Ok(envelope.data.unwrap_or(Value::Null))
    }
}

enum RequestOutcome {
    Fatal(GraphQLClientError),
    Retryable {
        err: GraphQLClientError,
        delay: Duration,
    },
}

/// Fill the bind-extensions and bind-response-headers targets
fn bind_response_targets(
    options: &[RequestOption],
    headers: &reqwest::header::HeaderMap,
    extensions: Option<&Value>,
) {
    for option in options {
        match option {
            RequestOption::BindExtensions(target) => {
                if let (Some(value), Ok(mut slot)) = (extensions, target.lock()) {
                    *slot = Some(value.clone());
                }
            }
            RequestOption::BindResponseHeaders(target) => {
                if let Ok(mut slot) = target.lock() {
                    *slot = Some(headers.clone());
                }
            }
            _ => {}
        }
    }
}

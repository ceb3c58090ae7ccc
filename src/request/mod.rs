//! Request construction helpers
//!
//! Builds [`GraphQLRequestBody`] values either from raw document strings or
//! from typed operations derived with `graphql_client`, and defines the
//! per-request options accepted by the HTTP client.

use crate::error::Result;
use crate::graphql::GraphQLRequestBody;
use graphql_client::GraphQLQuery;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A slot a request option writes into after a successful call
pub type BindTarget<T> = Arc<Mutex<Option<T>>>;

/// Create an empty bind target for [`RequestOption::BindExtensions`] or
/// [`RequestOption::BindResponseHeaders`]
pub fn bind_target<T>() -> BindTarget<T> {
    Arc::new(Mutex::new(None))
}

/// Per-request options for GraphQL operations
#[derive(Clone)]
pub enum RequestOption {
    /// Override the operation name sent to the server
    OperationName(String),
    /// A directive appended to the operation header, e.g. `@live`
    OperationDirective(String),
    /// Capture the response `extensions` object into the given slot
    BindExtensions(BindTarget<Value>),
    /// Capture the HTTP response headers into the given slot
    BindResponseHeaders(BindTarget<HeaderMap>),
}

impl RequestOption {
    /// Stable discriminator for the option kind
    pub fn option_type(&self) -> &'static str {
        match self {
            RequestOption::OperationName(_) => "operation_name",
            RequestOption::OperationDirective(_) => "operation_directive",
            RequestOption::BindExtensions(_) => "bind_extensions",
            RequestOption::BindResponseHeaders(_) => "bind_response_headers",
        }
    }
}

impl fmt::Display for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOption::OperationName(name) => write!(f, "operation_name={name}"),
            RequestOption::OperationDirective(directive) => {
                write!(f, "operation_directive={directive}")
            }
            RequestOption::BindExtensions(_) => write!(f, "bind_extensions"),
            RequestOption::BindResponseHeaders(_) => write!(f, "bind_response_headers"),
        }
    }
}

impl fmt::Debug for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestOption({self})")
    }
}

/// Build a request body from a typed query derived with `graphql_client`
pub fn construct_query<Q: GraphQLQuery>(variables: Q::Variables) -> Result<GraphQLRequestBody> {
    let body = Q::build_query(variables);
    Ok(GraphQLRequestBody {
        query: body.query.to_string(),
        variables: Some(serde_json::to_value(&body.variables)?),
        operation_name: Some(body.operation_name.to_string()),
    })
}

/// Build a subscription request body from a typed operation
///
/// Identical to [`construct_query`]; the document itself decides the
/// operation kind.
pub fn construct_subscription<Q: GraphQLQuery>(
    variables: Q::Variables,
) -> Result<GraphQLRequestBody> {
    construct_query::<Q>(variables)
}

/// Apply the options that rewrite the request body itself
/// (operation name and operation directive)
pub fn apply_request_options(
    mut body: GraphQLRequestBody,
    options: &[RequestOption],
) -> GraphQLRequestBody {
    for option in options {
        match option {
            RequestOption::OperationName(name) => {
                body.operation_name = Some(name.clone());
            }
            RequestOption::OperationDirective(directive) => {
                body.query = insert_operation_directive(&body.query, directive);
            }
            _ => {}
        }
    }
    body
}

/// Insert a directive into the operation header, before the selection set:
/// `subscription Foo($x: Int!) { ... }` becomes
/// `subscription Foo($x: Int!) @live { ... }`
fn insert_operation_directive(query: &str, directive: &str) -> String {
    match query.find('{') {
        Some(index) => {
            let (head, rest) = query.split_at(index);
            format!("{} {} {}", head.trim_end(), directive, rest)
        }
        None => query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_option_type_discriminators() {
        assert_eq!(
            RequestOption::OperationName("Foo".into()).option_type(),
            "operation_name"
        );
        assert_eq!(
            RequestOption::OperationDirective("@live".into()).option_type(),
            "operation_directive"
        );
        assert_eq!(
            RequestOption::BindExtensions(bind_target()).option_type(),
            "bind_extensions"
        );
        assert_eq!(
            RequestOption::BindResponseHeaders(bind_target()).option_type(),
            "bind_response_headers"
        );
    }

    #[test]
    fn test_option_display() {
        assert_eq!(
            RequestOption::OperationName("GetUser".into()).to_string(),
            "operation_name=GetUser"
        );
        assert_eq!(
            RequestOption::OperationDirective("@live".into()).to_string(),
            "operation_directive=@live"
        );
        assert_eq!(
            RequestOption::BindExtensions(bind_target()).to_string(),
            "bind_extensions"
        );
    }

    #[test]
    fn test_insert_operation_directive() {
        let rewritten =
            insert_operation_directive("subscription OnEvent($id: ID!) { event(id: $id) }", "@live");
        assert_eq!(
            rewritten,
            "subscription OnEvent($id: ID!) @live { event(id: $id) }"
        );

        // a bare selection set keeps the directive in front of it
        let rewritten = insert_operation_directive("{ viewer { id } }", "@defer");
        assert!(rewritten.starts_with(" @defer {"));
    }

    #[test]
    fn test_apply_request_options() {
        let body = GraphQLRequestBody::new("subscription { messages }")
            .with_variables(json!({"room": "general"}));

        let body = apply_request_options(
            body,
            &[
                RequestOption::OperationName("Messages".into()),
                RequestOption::OperationDirective("@live".into()),
            ],
        );

        assert_eq!(body.operation_name.as_deref(), Some("Messages"));
        assert!(body.query.contains("@live {"));
        assert_eq!(body.variables.unwrap()["room"], "general");
    }
}

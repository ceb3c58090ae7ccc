//! Shared GraphQL wire types
//!
//! The request body and response envelope exchanged with a GraphQL server,
//! shared by the HTTP transport and the websocket subscription protocols.
//! Subscription `data`/`next` frames carry the same `{data, errors}` shape
//! as an HTTP response body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// GraphQL request body: `{query, variables, operationName?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLRequestBody {
    /// GraphQL document string
    pub query: String,
    /// Variables for the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Optional operation name
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequestBody {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequestBody {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// GraphQL response envelope: `{data, errors, extensions}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphQLResponse {
    /// Response data
    pub data: Option<Value>,
    /// GraphQL errors if any
    pub errors: Option<Vec<GraphQLError>>,
    /// Response extensions (server metadata)
    pub extensions: Option<Value>,
}

/// A single server-side GraphQL error
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphQLError {
    /// Error message
    pub message: String,
    /// Error locations in the query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,
    /// Error path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Error extensions (custom error data)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, Value>>,
}

/// GraphQL error location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorLocation {
    /// Line number in the query
    pub line: u32,
    /// Column number in the query
    pub column: u32,
}

impl GraphQLError {
    /// Build an error carrying only a message
    pub fn from_message(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_body_serialization() {
        let body = GraphQLRequestBody::new("query { viewer { id } }")
            .with_variables(json!({"limit": 10}))
            .with_operation_name("Viewer");

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["query"], "query { viewer { id } }");
        assert_eq!(value["variables"]["limit"], 10);
        assert_eq!(value["operationName"], "Viewer");
    }

    #[test]
    fn test_request_body_omits_empty_fields() {
        let body = GraphQLRequestBody::new("{ __typename }");
        let text = serde_json::to_string(&body).unwrap();
        assert!(!text.contains("variables"));
        assert!(!text.contains("operationName"));
    }

    #[test]
    fn test_response_deserialization() {
        let text = r#"{
            "data": {"hello": "world"},
            "errors": [{"message": "partial failure", "locations": [{"line": 1, "column": 2}]}],
            "extensions": {"traceId": "abc"}
        }"#;

        let response: GraphQLResponse = serde_json::from_str(text).unwrap();
        assert_eq!(response.data.unwrap()["hello"], "world");
        let errors = response.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "partial failure");
        assert_eq!(errors[0].locations.as_ref().unwrap()[0].line, 1);
        assert_eq!(response.extensions.unwrap()["traceId"], "abc");
    }
}

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::GraphQLError;

/// Fatal startup failures. The gateway never starts serving when one of these
/// is returned.
#[derive(Debug, thiserror::Error)]
pub enum CompositionError {
    #[error("subgraph \"{subgraph}\" is unreachable: {reason}")]
    Unreachable { subgraph: String, reason: String },
    #[error("failed to parse schema for subgraph \"{subgraph}\": {reason}")]
    InvalidSchema { subgraph: String, reason: String },
    #[error("type \"{type_name}\" is a {first} in \"{first_subgraph}\" but a {second} in \"{second_subgraph}\"")]
    KindMismatch {
        type_name: String,
        first: &'static str,
        first_subgraph: String,
        second: &'static str,
        second_subgraph: String,
    },
    #[error("field \"{type_name}.{field}\" has type {first} in \"{first_subgraph}\" but {second} in \"{second_subgraph}\"")]
    FieldTypeMismatch {
        type_name: String,
        field: String,
        first: String,
        first_subgraph: String,
        second: String,
        second_subgraph: String,
    },
    #[error("field \"{type_name}.{field}\" is defined by multiple subgraphs ({}) without @shareable", .subgraphs.join(", "))]
    FieldConflict {
        type_name: String,
        field: String,
        subgraphs: Vec<String>,
    },
    #[error("field \"{type_name}.{field}\" from \"{subgraph}\" cannot be resolved: the subgraph declares no @key for \"{type_name}\"")]
    UnresolvableField {
        type_name: String,
        field: String,
        subgraph: String,
    },
    #[error("unsupported @key(fields: \"{fields}\") on \"{type_name}\" in \"{subgraph}\": nested key selections are not supported")]
    UnsupportedKey {
        type_name: String,
        fields: String,
        subgraph: String,
    },
    #[error("supergraph is empty: {0}")]
    EmptySupergraph(String),
}

/// Client errors raised before any subgraph is called.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("Syntax Error: {0}")]
    Parse(String),
    #[error("{0}")]
    Validation(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::Parse(_) => "GRAPHQL_PARSE_FAILED",
            RequestError::Validation(_) => "GRAPHQL_VALIDATION_FAILED",
        }
    }

    pub fn to_graphql_error(&self) -> GraphQLError {
        GraphQLError::new(self.to_string()).with_extension("code", json!(self.code()))
    }
}

/// Failure of a single subgraph call. Recoverable: surfaced as field errors.
#[derive(Debug, thiserror::Error)]
pub enum SubgraphError {
    #[error("request to subgraph \"{subgraph}\" failed: {source}")]
    Network {
        subgraph: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to subgraph \"{subgraph}\" timed out after {timeout:?}")]
    Timeout { subgraph: String, timeout: Duration },
    #[error("subgraph \"{subgraph}\" responded with HTTP {status}")]
    Status { subgraph: String, status: StatusCode },
    #[error("subgraph \"{subgraph}\" returned a malformed response: {reason}")]
    Malformed { subgraph: String, reason: String },
}

impl SubgraphError {
    pub fn subgraph(&self) -> &str {
        match self {
            SubgraphError::Network { subgraph, .. }
            | SubgraphError::Timeout { subgraph, .. }
            | SubgraphError::Status { subgraph, .. }
            | SubgraphError::Malformed { subgraph, .. } => subgraph,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SubgraphError::Timeout { .. } => "SUBGRAPH_TIMEOUT",
            _ => "SUBGRAPH_REQUEST_FAILED",
        }
    }

    /// Field-level GraphQL error located at `path`.
    pub fn to_graphql_error(&self, path: Vec<Value>) -> GraphQLError {
        GraphQLError::new(self.to_string())
            .with_path(path)
            .with_extension("code", json!(self.code()))
            .with_extension("serviceName", json!(self.subgraph()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("gateway is still composing the supergraph")]
    NotReady,
    #[error("gateway is already serving a composed supergraph")]
    AlreadyServing,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Request(e) => e.code(),
            GatewayError::NotReady => "GATEWAY_NOT_READY",
            _ => "INTERNAL_SERVER_ERROR",
        }
    }
}

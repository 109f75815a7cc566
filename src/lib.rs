pub mod ai;
pub mod config;
pub mod context;
pub mod data_source;
pub mod error;
pub mod federation_gateway;
pub mod logging;
pub mod query_executor;
pub mod query_planner;
pub mod schema_loader;
pub mod server;
pub mod supergraph;

pub use context::RequestContext;
pub use data_source::AuthenticatedDataSource;
pub use error::{CompositionError, GatewayError, RequestError, SubgraphError};
pub use federation_gateway::{FederationGateway, GatewayState};
pub use query_executor::HttpQueryExecutor;
pub use query_planner::SimpleQueryPlanner;
pub use schema_loader::{IntrospectionLoader, SchemaLoader};
pub use supergraph::{Supergraph, compose};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SUBGRAPH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubgraphConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub schema_file: Option<PathBuf>,
    #[serde(default = "default_timeout", with = "duration_ms")]
    pub timeout: Duration,
}

impl SubgraphConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        SubgraphConfig {
            name: name.into(),
            url: url.into(),
            schema_file: None,
            timeout: DEFAULT_SUBGRAPH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn default_timeout() -> Duration {
    DEFAULT_SUBGRAPH_TIMEOUT
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// A subgraph together with the SDL it published.
#[derive(Clone, Debug)]
pub struct SubgraphSchema {
    pub config: SubgraphConfig,
    pub sdl: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Request variables as an object; anything else counts as no variables.
    pub fn variables_map(&self) -> Map<String, Value> {
        match &self.variables {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_path(mut self, path: Vec<Value>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        GraphQLResponse { data: None, errors }
    }
}

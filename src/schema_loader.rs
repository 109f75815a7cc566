use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::{
    AuthenticatedDataSource, CompositionError, GraphQLRequest, RequestContext, SubgraphConfig,
    SubgraphSchema,
};

pub const SERVICE_SDL_QUERY: &str = "query __ApolloGetServiceDefinition__ { _service { sdl } }";

/// Source of subgraph SDL at startup.
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load(&self, subgraph: &SubgraphConfig) -> Result<String, CompositionError>;
}

/// Reads `schema_file` when configured, otherwise asks the subgraph for its
/// SDL through `_service { sdl }`.
#[derive(Clone, Debug, Default)]
pub struct IntrospectionLoader {
    data_source: AuthenticatedDataSource,
}

impl IntrospectionLoader {
    pub fn new() -> Self {
        IntrospectionLoader {
            data_source: AuthenticatedDataSource::new(),
        }
    }

    pub fn with_data_source(data_source: AuthenticatedDataSource) -> Self {
        IntrospectionLoader { data_source }
    }
}

#[async_trait]
impl SchemaLoader for IntrospectionLoader {
    async fn load(&self, subgraph: &SubgraphConfig) -> Result<String, CompositionError> {
        let failed = |reason: String| CompositionError::Unreachable {
            subgraph: subgraph.name.clone(),
            reason,
        };

        if let Some(path) = &subgraph.schema_file {
            debug!(subgraph = %subgraph.name, "reading schema file {:?}", path);
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| failed(format!("failed to read {:?}: {}", path, e)));
        }

        info!(subgraph = %subgraph.name, url = %subgraph.url, "fetching subgraph sdl");
        let response = self
            .data_source
            .fetch(
                subgraph,
                &RequestContext::anonymous(),
                &GraphQLRequest::new(SERVICE_SDL_QUERY),
            )
            .await
            .map_err(|e| failed(e.to_string()))?;

        if let Some(error) = response.errors.first() {
            return Err(failed(error.message.clone()));
        }

        response
            .data
            .as_ref()
            .and_then(|data| data.pointer("/_service/sdl"))
            .and_then(|sdl| sdl.as_str())
            .map(str::to_string)
            .ok_or_else(|| failed("response carries no _service.sdl".to_string()))
    }
}

/// Fixed SDL per subgraph name.
#[derive(Clone, Debug, Default)]
pub struct StaticSchemaLoader {
    schemas: HashMap<String, String>,
}

impl StaticSchemaLoader {
    pub fn new() -> Self {
        StaticSchemaLoader::default()
    }

    pub fn with_schema(mut self, subgraph: impl Into<String>, sdl: impl Into<String>) -> Self {
        self.schemas.insert(subgraph.into(), sdl.into());
        self
    }
}

#[async_trait]
impl SchemaLoader for StaticSchemaLoader {
    async fn load(&self, subgraph: &SubgraphConfig) -> Result<String, CompositionError> {
        self.schemas
            .get(&subgraph.name)
            .cloned()
            .ok_or_else(|| CompositionError::Unreachable {
                subgraph: subgraph.name.clone(),
                reason: "no schema registered".to_string(),
            })
    }
}

/// Loads every subgraph concurrently. The first failure in configuration
/// order wins.
pub async fn load_all(
    loader: &dyn SchemaLoader,
    subgraphs: &[SubgraphConfig],
) -> Result<Vec<SubgraphSchema>, CompositionError> {
    let results = join_all(subgraphs.iter().map(|subgraph| loader.load(subgraph))).await;

    subgraphs
        .iter()
        .zip(results)
        .map(|(config, sdl)| {
            Ok(SubgraphSchema {
                config: config.clone(),
                sdl: sdl?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn sdl_is_fetched_from_service_field() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/graphql")
                    .body_contains("_service");
                then.status(200)
                    .json_body(json!({ "data": { "_service": { "sdl": "type Query { a: Int }" } } }));
            })
            .await;

        let config = SubgraphConfig::new("a", server.url("/graphql"));
        let sdl = IntrospectionLoader::new().load(&config).await.unwrap();

        assert_eq!(sdl, "type Query { a: Int }");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_subgraph_fails() {
        let config = SubgraphConfig::new("gone", "http://127.0.0.1:9/graphql");
        let result = IntrospectionLoader::new().load(&config).await;

        assert!(matches!(
            result,
            Err(CompositionError::Unreachable { subgraph, .. }) if subgraph == "gone"
        ));
    }

    #[tokio::test]
    async fn missing_sdl_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/graphql");
                then.status(200).json_body(json!({ "data": { "_service": null } }));
            })
            .await;

        let config = SubgraphConfig::new("a", server.url("/graphql"));
        assert!(matches!(
            IntrospectionLoader::new().load(&config).await,
            Err(CompositionError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn schema_file_takes_precedence() {
        let path = std::env::temp_dir().join(format!("gateway-schema-{}.graphql", std::process::id()));
        std::fs::write(&path, "type Query { fromFile: Int }").unwrap();

        let mut config = SubgraphConfig::new("file", "http://127.0.0.1:9/graphql");
        config.schema_file = Some(path.clone());
        let sdl = IntrospectionLoader::new().load(&config).await.unwrap();

        assert_eq!(sdl, "type Query { fromFile: Int }");
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn load_all_reports_first_failure_in_order() {
        let loader = StaticSchemaLoader::new().with_schema("b", "type Query { b: Int }");
        let subgraphs = vec![
            SubgraphConfig::new("a", "http://a"),
            SubgraphConfig::new("b", "http://b"),
        ];

        let err = load_all(&loader, &subgraphs).await.unwrap_err();
        assert!(matches!(err, CompositionError::Unreachable { subgraph, .. } if subgraph == "a"));

        let loader = loader.with_schema("a", "type Query { a: Int }");
        let loaded = load_all(&loader, &subgraphs).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].config.name, "a");
    }
}

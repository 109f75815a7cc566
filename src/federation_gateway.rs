use std::sync::{Arc, OnceLock};
use tracing::{error, info};

use crate::query_executor::QueryExecutor;
use crate::query_planner::QueryPlanner;
use crate::schema_loader::{SchemaLoader, load_all};
use crate::{
    GatewayError, GraphQLRequest, GraphQLResponse, HttpQueryExecutor, IntrospectionLoader,
    RequestContext, SimpleQueryPlanner, SubgraphConfig, Supergraph, compose,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    Composing,
    Serving,
}

pub struct FederationGateway {
    subgraphs: Vec<SubgraphConfig>,
    loader: Box<dyn SchemaLoader>,
    query_planner: Box<dyn QueryPlanner>,
    query_executor: Box<dyn QueryExecutor>,
    supergraph: OnceLock<Arc<Supergraph>>,
}

impl FederationGateway {
    pub fn new(
        subgraphs: Vec<SubgraphConfig>,
        loader: Box<dyn SchemaLoader>,
        query_planner: Box<dyn QueryPlanner>,
        query_executor: Box<dyn QueryExecutor>,
    ) -> Self {
        FederationGateway {
            subgraphs,
            loader,
            query_planner,
            query_executor,
            supergraph: OnceLock::new(),
        }
    }

    /// Gateway wired with introspection loading, the simple planner and the
    /// HTTP executor.
    pub fn with_defaults(subgraphs: Vec<SubgraphConfig>) -> Self {
        FederationGateway::new(
            subgraphs,
            Box::new(IntrospectionLoader::new()),
            Box::new(SimpleQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new()),
        )
    }

    pub fn state(&self) -> GatewayState {
        if self.supergraph.get().is_some() {
            GatewayState::Serving
        } else {
            GatewayState::Composing
        }
    }

    pub fn supergraph(&self) -> Option<Arc<Supergraph>> {
        self.supergraph.get().cloned()
    }

    /// Loads every subgraph SDL and composes the supergraph. On failure the
    /// gateway stays in `Composing`.
    #[tracing::instrument(skip(self), name = "FederationGateway::compose")]
    pub async fn compose(&self) -> Result<Arc<Supergraph>, GatewayError> {
        if self.supergraph.get().is_some() {
            return Err(GatewayError::AlreadyServing);
        }

        let schemas = load_all(self.loader.as_ref(), &self.subgraphs)
            .await
            .inspect_err(|e| error!("failed to load subgraph schemas: {}", e))?;
        let supergraph = Arc::new(
            compose(&schemas).inspect_err(|e| error!("supergraph composition failed: {}", e))?,
        );

        self.supergraph
            .set(supergraph.clone())
            .map_err(|_| GatewayError::AlreadyServing)?;
        info!(subgraphs = self.subgraphs.len(), "gateway is serving");
        Ok(supergraph)
    }

    /// Parses, validates, plans and runs one client operation. Only client
    /// errors and `NotReady` are returned as `Err`; subgraph failures are part
    /// of the response.
    #[tracing::instrument(
        skip(self, request, ctx),
        fields(trace_id = %ctx.trace_id, operation = ?request.operation_name),
        name = "FederationGateway::process_request"
    )]
    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        ctx: &RequestContext,
    ) -> Result<GraphQLResponse, GatewayError> {
        let Some(supergraph) = self.supergraph.get() else {
            return Err(GatewayError::NotReady);
        };

        let plan = self.query_planner.plan_query(&request, supergraph)?;
        let variables = request.variables_map();

        Ok(self
            .query_executor
            .execute_plan(&plan, supergraph, ctx, &variables)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequestError;
    use crate::schema_loader::StaticSchemaLoader;

    fn gateway(loader: StaticSchemaLoader) -> FederationGateway {
        FederationGateway::new(
            vec![SubgraphConfig::new("products", "http://127.0.0.1:9/graphql")],
            Box::new(loader),
            Box::new(SimpleQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new()),
        )
    }

    #[tokio::test]
    async fn requests_before_composition_are_rejected() {
        let gateway = gateway(StaticSchemaLoader::new());
        assert_eq!(gateway.state(), GatewayState::Composing);

        let result = gateway
            .process_request(GraphQLRequest::new("{ a }"), &RequestContext::anonymous())
            .await;
        assert!(matches!(result, Err(GatewayError::NotReady)));
    }

    #[tokio::test]
    async fn failed_composition_keeps_composing() {
        let gateway = gateway(StaticSchemaLoader::new());
        assert!(matches!(
            gateway.compose().await,
            Err(GatewayError::Composition(_))
        ));
        assert_eq!(gateway.state(), GatewayState::Composing);
    }

    #[tokio::test]
    async fn composes_exactly_once() {
        let gateway = gateway(
            StaticSchemaLoader::new().with_schema("products", "type Query { top: [String] }"),
        );

        gateway.compose().await.unwrap();
        assert_eq!(gateway.state(), GatewayState::Serving);
        assert!(matches!(
            gateway.compose().await,
            Err(GatewayError::AlreadyServing)
        ));
    }

    #[tokio::test]
    async fn invalid_operations_never_reach_subgraphs() {
        let gateway = gateway(
            StaticSchemaLoader::new().with_schema("products", "type Query { top: [String] }"),
        );
        gateway.compose().await.unwrap();

        let result = gateway
            .process_request(GraphQLRequest::new("{ bottom }"), &RequestContext::anonymous())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Request(RequestError::Validation(_)))
        ));

        let response = gateway
            .process_request(GraphQLRequest::new("{ __typename }"), &RequestContext::anonymous())
            .await
            .unwrap();
        assert_eq!(
            response.data,
            Some(serde_json::json!({ "__typename": "Query" }))
        );
    }
}

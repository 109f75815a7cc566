use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::query_planner::{FetchKind, FetchNode, OperationKind, QueryPlan, SelectionNode};
use crate::{
    AuthenticatedDataSource, GraphQLError, GraphQLRequest, GraphQLResponse, RequestContext,
    SubgraphError, Supergraph,
};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs every fetch of `plan` and assembles the client response. Subgraph
    /// failures end up in `errors`; this never fails as a whole.
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &Supergraph,
        ctx: &RequestContext,
        variables: &Map<String, Value>,
    ) -> GraphQLResponse;
}

pub struct HttpQueryExecutor {
    data_source: AuthenticatedDataSource,
}

impl HttpQueryExecutor {
    pub fn new() -> Self {
        HttpQueryExecutor {
            data_source: AuthenticatedDataSource::new(),
        }
    }

    pub fn with_data_source(data_source: AuthenticatedDataSource) -> Self {
        HttpQueryExecutor { data_source }
    }

    async fn send(
        &self,
        schema: &Supergraph,
        ctx: &RequestContext,
        service: &str,
        body: GraphQLRequest,
    ) -> Result<GraphQLResponse, SubgraphError> {
        let subgraph = schema
            .subgraph(service)
            .ok_or_else(|| SubgraphError::Malformed {
                subgraph: service.to_string(),
                reason: "subgraph is not part of the supergraph".to_string(),
            })?;
        self.data_source.fetch(subgraph, ctx, &body).await
    }

    async fn fetch_root(
        &self,
        fetch: &FetchNode,
        schema: &Supergraph,
        ctx: &RequestContext,
        variables: &Map<String, Value>,
    ) -> Result<GraphQLResponse, SubgraphError> {
        let body = GraphQLRequest {
            query: fetch.operation.clone(),
            variables: Some(Value::Object(forwarded_variables(fetch, variables))),
            operation_name: fetch.operation_name.clone(),
        };
        self.send(schema, ctx, &fetch.service, body).await
    }

    async fn fetch_entities(
        &self,
        fetch: &FetchNode,
        representations: Vec<Value>,
        schema: &Supergraph,
        ctx: &RequestContext,
        variables: &Map<String, Value>,
    ) -> Result<GraphQLResponse, SubgraphError> {
        let mut forwarded = forwarded_variables(fetch, variables);
        forwarded.insert("representations".to_string(), Value::Array(representations));

        let body = GraphQLRequest {
            query: fetch.operation.clone(),
            variables: Some(Value::Object(forwarded)),
            operation_name: None,
        };
        self.send(schema, ctx, &fetch.service, body).await
    }
}

impl Default for HttpQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    #[tracing::instrument(
        skip(self, plan, schema, ctx, variables),
        fields(trace_id = %ctx.trace_id, fetches = plan.fetch_count()),
        name = "HttpQueryExecutor::execute_plan"
    )]
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &Supergraph,
        ctx: &RequestContext,
        variables: &Map<String, Value>,
    ) -> GraphQLResponse {
        let mut data = Value::Object(Map::new());
        let mut errors = Vec::new();

        let results = match plan.kind() {
            OperationKind::Query => {
                join_all(
                    plan.fetches
                        .iter()
                        .map(|fetch| self.fetch_root(fetch, schema, ctx, variables)),
                )
                .await
            }
            OperationKind::Mutation => {
                let mut results = Vec::with_capacity(plan.fetches.len());
                for fetch in &plan.fetches {
                    results.push(self.fetch_root(fetch, schema, ctx, variables).await);
                }
                results
            }
        };

        let mut succeeded = 0;
        let mut wave: Vec<&FetchNode> = Vec::new();
        for (fetch, result) in plan.fetches.iter().zip(results) {
            let FetchKind::Root { response_keys } = &fetch.kind else {
                continue;
            };
            match result {
                Ok(response) => {
                    errors.extend(
                        response
                            .errors
                            .into_iter()
                            .map(|e| with_service_name(e, &fetch.service)),
                    );
                    if let Some(Value::Object(fields)) = response.data {
                        succeeded += 1;
                        merge_values(&mut data, Value::Object(fields));
                        wave.extend(fetch.dependents.iter());
                    }
                }
                Err(e) => {
                    warn!(subgraph = %fetch.service, "root fetch failed: {}", e);
                    for key in response_keys {
                        errors.push(e.to_graphql_error(vec![json!(key)]));
                    }
                }
            }
        }

        while !wave.is_empty() {
            let prepared: Vec<(&FetchNode, Vec<Vec<Value>>, Vec<Value>)> = wave
                .iter()
                .filter_map(|fetch| {
                    let (locations, representations) = collect_representations(schema, &data, fetch);
                    if representations.is_empty() {
                        debug!(subgraph = %fetch.service, "no entities to resolve");
                        None
                    } else {
                        Some((*fetch, locations, representations))
                    }
                })
                .collect();

            let results = join_all(prepared.iter().map(|(fetch, _, representations)| {
                self.fetch_entities(fetch, representations.clone(), schema, ctx, variables)
            }))
            .await;

            let mut next = Vec::new();
            for ((fetch, locations, _), result) in prepared.into_iter().zip(results) {
                match result.and_then(|response| {
                    merge_entities(&mut data, &locations, response, &fetch.service)
                }) {
                    Ok(entity_errors) => {
                        errors.extend(entity_errors);
                        next.extend(fetch.dependents.iter());
                    }
                    Err(e) => {
                        warn!(subgraph = %fetch.service, "entity fetch failed: {}", e);
                        for location in locations {
                            errors.push(e.to_graphql_error(location));
                        }
                    }
                }
            }
            wave = next;
        }

        if !plan.fetches.is_empty() && succeeded == 0 {
            return GraphQLResponse {
                data: Some(Value::Null),
                errors,
            };
        }

        let root_type = plan.kind().root_type();
        let source = match data {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        let projected = project(schema, &plan.operation.selections, root_type, &source);

        GraphQLResponse {
            data: Some(Value::Object(projected)),
            errors,
        }
    }
}

fn forwarded_variables(fetch: &FetchNode, variables: &Map<String, Value>) -> Map<String, Value> {
    fetch
        .variables
        .iter()
        .filter_map(|name| variables.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

fn with_service_name(mut error: GraphQLError, service: &str) -> GraphQLError {
    let extensions = error.extensions.get_or_insert_with(Map::new);
    extensions
        .entry("serviceName")
        .or_insert_with(|| json!(service));
    error
}

/// Finds every object an entity fetch applies to and builds its
/// representation. Objects missing a key field are left alone.
fn collect_representations(
    schema: &Supergraph,
    data: &Value,
    fetch: &FetchNode,
) -> (Vec<Vec<Value>>, Vec<Value>) {
    let FetchKind::Entity {
        type_name,
        key_fields,
        path,
    } = &fetch.kind
    else {
        return (Vec::new(), Vec::new());
    };

    let mut found = Vec::new();
    collect_locations(data, path, &mut Vec::new(), &mut found);

    let mut locations = Vec::new();
    let mut representations = Vec::new();
    for location in found {
        let Some(Value::Object(object)) = value_at(data, &location) else {
            continue;
        };
        let typename = object
            .get("__typename")
            .and_then(Value::as_str)
            .unwrap_or(type_name);
        if !schema.satisfies(typename, type_name) {
            continue;
        }

        let mut representation = Map::new();
        representation.insert("__typename".to_string(), json!(typename));
        let complete = key_fields.iter().all(|key| match object.get(key) {
            Some(Value::Null) | None => false,
            Some(value) => {
                representation.insert(key.clone(), value.clone());
                true
            }
        });
        if complete {
            locations.push(location);
            representations.push(Value::Object(representation));
        }
    }

    (locations, representations)
}

fn collect_locations(
    value: &Value,
    path: &[String],
    current: &mut Vec<Value>,
    out: &mut Vec<Vec<Value>>,
) {
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                current.push(json!(index));
                collect_locations(item, path, current, out);
                current.pop();
            }
        }
        Value::Object(fields) => match path.split_first() {
            None => out.push(current.clone()),
            Some((key, rest)) => {
                if let Some(child) = fields.get(key) {
                    current.push(json!(key));
                    collect_locations(child, rest, current, out);
                    current.pop();
                }
            }
        },
        _ => {}
    }
}

fn value_at<'v>(value: &'v Value, path: &[Value]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        Value::String(key) => current.get(key.as_str()),
        Value::Number(index) => index.as_u64().and_then(|i| current.get(i as usize)),
        _ => None,
    })
}

fn value_at_mut<'v>(value: &'v mut Value, path: &[Value]) -> Option<&'v mut Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        Value::String(key) => current.get_mut(key.as_str()),
        Value::Number(index) => index.as_u64().and_then(|i| current.get_mut(i as usize)),
        _ => None,
    })
}

/// Merges `_entities` results back into the objects they came from and
/// rewrites error paths to point at those objects.
fn merge_entities(
    data: &mut Value,
    locations: &[Vec<Value>],
    response: GraphQLResponse,
    service: &str,
) -> Result<Vec<GraphQLError>, SubgraphError> {
    let malformed = |reason: String| SubgraphError::Malformed {
        subgraph: service.to_string(),
        reason,
    };

    let entities = match response.data {
        Some(Value::Object(mut fields)) => match fields.remove("_entities") {
            Some(Value::Array(entities)) => Some(entities),
            Some(Value::Null) | None => None,
            Some(_) => return Err(malformed("\"_entities\" is not a list".to_string())),
        },
        _ => None,
    };

    let entities = match entities {
        Some(entities) if entities.len() != locations.len() => {
            return Err(malformed(format!(
                "expected {} entities, got {}",
                locations.len(),
                entities.len()
            )));
        }
        Some(entities) => entities,
        // A null `_entities` is only valid when the subgraph says why.
        None if !locations.is_empty() && response.errors.is_empty() => {
            return Err(malformed("missing \"_entities\"".to_string()));
        }
        None => Vec::new(),
    };

    for (location, entity) in locations.iter().zip(entities) {
        if entity.is_null() {
            continue;
        }
        if let Some(target) = value_at_mut(data, location) {
            merge_values(target, entity);
        }
    }

    let errors = response
        .errors
        .into_iter()
        .map(|mut error| {
            error.path = error.path.take().and_then(|path| match path.as_slice() {
                [Value::String(root), Value::Number(index), rest @ ..] if root == "_entities" => {
                    let location = index
                        .as_u64()
                        .and_then(|i| locations.get(i as usize))?;
                    let mut rewritten = location.clone();
                    rewritten.extend(rest.iter().cloned());
                    Some(rewritten)
                }
                _ => None,
            });
            with_service_name(error, service)
        })
        .collect();

    Ok(errors)
}

pub(crate) fn merge_values(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(incoming)) if existing.len() == incoming.len() => {
            for (slot, value) in existing.iter_mut().zip(incoming) {
                merge_values(slot, value);
            }
        }
        (_, Value::Null) => {}
        (target, source) => *target = source,
    }
}

/// Shapes the merged subgraph data into exactly what the client selected.
fn project(
    schema: &Supergraph,
    selections: &[SelectionNode],
    parent_type: &str,
    source: &Map<String, Value>,
) -> Map<String, Value> {
    let mut out = Map::new();
    project_into(schema, selections, parent_type, source, &mut out);
    out
}

fn project_into(
    schema: &Supergraph,
    selections: &[SelectionNode],
    parent_type: &str,
    source: &Map<String, Value>,
    out: &mut Map<String, Value>,
) {
    let concrete = source
        .get("__typename")
        .and_then(Value::as_str)
        .unwrap_or(parent_type);

    for selection in selections {
        match selection {
            SelectionNode::Field(field) => {
                let key = field.response_key();
                let value = if field.name == "__typename" {
                    json!(concrete)
                } else {
                    let raw = source.get(key).unwrap_or(&Value::Null);
                    let named_type = schema
                        .field(concrete, &field.name)
                        .or_else(|| schema.field(parent_type, &field.name))
                        .map(|f| f.named_type.as_str())
                        .unwrap_or(parent_type);
                    project_value(schema, &field.selections, named_type, raw)
                };

                match out.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        out.insert(key.to_string(), value);
                    }
                }
            }
            SelectionNode::InlineFragment {
                type_condition,
                selections,
            } => {
                let applies = type_condition
                    .as_deref()
                    .is_none_or(|condition| schema.satisfies(concrete, condition));
                if applies {
                    project_into(schema, selections, concrete, source, out);
                }
            }
        }
    }
}

fn project_value(
    schema: &Supergraph,
    selections: &[SelectionNode],
    named_type: &str,
    raw: &Value,
) -> Value {
    match raw {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project_value(schema, selections, named_type, item))
                .collect(),
        ),
        Value::Object(fields) if !selections.is_empty() => {
            Value::Object(project(schema, selections, named_type, fields))
        }
        other => other.clone(),
    }
}

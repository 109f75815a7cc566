use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use tracing::{debug, warn};

use crate::context::REQUEST_ID_HEADER;
use crate::{GraphQLRequest, GraphQLResponse, RequestContext, SubgraphConfig, SubgraphError};

/// The single path every subgraph request takes. Bearer forwarding lives in
/// `build_request` and nowhere else.
#[derive(Clone, Debug, Default)]
pub struct AuthenticatedDataSource {
    client: reqwest::Client,
}

impl AuthenticatedDataSource {
    pub fn new() -> Self {
        AuthenticatedDataSource {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        AuthenticatedDataSource { client }
    }

    pub fn build_request(
        &self,
        subgraph: &SubgraphConfig,
        ctx: &RequestContext,
        body: &GraphQLRequest,
    ) -> Result<reqwest::Request, SubgraphError> {
        let mut builder = self
            .client
            .post(&subgraph.url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(subgraph.timeout)
            .json(body);

        if let Ok(trace_id) = HeaderValue::from_str(&ctx.trace_id) {
            builder = builder.header(REQUEST_ID_HEADER, trace_id);
        }

        if let Some(token) = &ctx.token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => builder = builder.header(AUTHORIZATION, value),
                Err(e) => warn!(
                    trace_id = %ctx.trace_id,
                    "token is not a valid header value, forwarding unauthenticated. error: {}",
                    e
                ),
            }
        }

        builder.build().map_err(|e| SubgraphError::Network {
            subgraph: subgraph.name.clone(),
            source: e,
        })
    }

    #[tracing::instrument(
        skip(self, subgraph, ctx, body),
        fields(subgraph = %subgraph.name, trace_id = %ctx.trace_id),
        name = "AuthenticatedDataSource::fetch"
    )]
    pub async fn fetch(
        &self,
        subgraph: &SubgraphConfig,
        ctx: &RequestContext,
        body: &GraphQLRequest,
    ) -> Result<GraphQLResponse, SubgraphError> {
        let request = self.build_request(subgraph, ctx, body)?;
        debug!("sending subgraph request: {}", body.query);

        let response = self.client.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                SubgraphError::Timeout {
                    subgraph: subgraph.name.clone(),
                    timeout: subgraph.timeout,
                }
            } else {
                SubgraphError::Network {
                    subgraph: subgraph.name.clone(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubgraphError::Status {
                subgraph: subgraph.name.clone(),
                status,
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                SubgraphError::Timeout {
                    subgraph: subgraph.name.clone(),
                    timeout: subgraph.timeout,
                }
            } else {
                SubgraphError::Network {
                    subgraph: subgraph.name.clone(),
                    source: e,
                }
            }
        })?;

        parse_response(&subgraph.name, &bytes)
    }
}

pub(crate) fn parse_response(subgraph: &str, bytes: &[u8]) -> Result<GraphQLResponse, SubgraphError> {
    let response =
        serde_json::from_slice::<GraphQLResponse>(bytes).map_err(|e| SubgraphError::Malformed {
            subgraph: subgraph.to_string(),
            reason: e.to_string(),
        })?;

    if response.data.is_none() && response.errors.is_empty() {
        return Err(SubgraphError::Malformed {
            subgraph: subgraph.to_string(),
            reason: "response has neither data nor errors".to_string(),
        });
    }

    Ok(response)
}

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, HeaderValue, LOCATION, ORIGIN, VARY,
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::{
    FederationGateway, GatewayError, GraphQLError, GraphQLRequest, GraphQLResponse,
    RequestContext,
};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

const GRAPHIQL_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Community Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    // The token cookie is HTTP-only, so the browser has to send it for us.
    function graphQLFetcher(graphQLParams) {
      return fetch('/graphql', {
        method: 'post',
        credentials: 'include',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

/// Origins allowed to make credentialed calls. Empty means any origin,
/// without credentials.
#[derive(Clone, Debug, Default)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        CorsPolicy {
            allowed_origins: allowed_origins
                .into_iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    fn apply(&self, origin: Option<&HeaderValue>, response: &mut Response<ResponseBody>) {
        let headers = response.headers_mut();

        if self.allowed_origins.is_empty() {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            return;
        }

        headers.insert(VARY, HeaderValue::from_static("Origin"));
        let Some(origin) = origin else {
            return;
        };
        let allowed = origin
            .to_str()
            .is_ok_and(|o| self.allowed_origins.iter().any(|a| a == o));
        if allowed {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        } else {
            debug!("origin {:?} is not in the allowlist", origin);
        }
    }
}

fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, body: &GraphQLResponse) -> Response<ResponseBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => response(status, "application/json", bytes),
        Err(e) => {
            error!("failed to serialize response: {}", e);
            response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "Internal Server Error",
            )
        }
    }
}

fn error_response(status: StatusCode, message: String, code: &str) -> Response<ResponseBody> {
    let error = GraphQLError::new(message).with_extension("code", json!(code));
    json_response(status, &GraphQLResponse::from_errors(vec![error]))
}

pub async fn handle_request<B>(
    req: Request<B>,
    gateway: Arc<FederationGateway>,
    cors: Arc<CorsPolicy>,
) -> Result<Response<ResponseBody>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let origin = req.headers().get(ORIGIN).cloned();

    let mut result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let ctx = RequestContext::from_headers(req.headers());
            graphql(req, &gateway, &ctx).await
        }

        (&Method::GET, "/graphiql") => {
            response(StatusCode::OK, "text/html; charset=utf-8", GRAPHIQL_HTML)
        }

        (&Method::GET, "/") => {
            let mut redirect = response(StatusCode::FOUND, "text/plain", "");
            redirect
                .headers_mut()
                .insert(LOCATION, HeaderValue::from_static("/graphiql"));
            redirect
        }

        (&Method::OPTIONS, _) => {
            let mut preflight = response(StatusCode::NO_CONTENT, "text/plain", "");
            let headers = preflight.headers_mut();
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            headers.insert(
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization, X-Request-Id"),
            );
            preflight
        }

        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    cors.apply(origin.as_ref(), &mut result);
    Ok(result)
}

async fn graphql<B>(
    req: Request<B>,
    gateway: &FederationGateway,
    ctx: &RequestContext,
) -> Response<ResponseBody>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(trace_id = %ctx.trace_id, "failed to read request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "Failed to read request body".to_string(),
                "BAD_REQUEST",
            );
        }
    };

    let request = match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid JSON request: {}", e),
                "BAD_REQUEST",
            );
        }
    };

    match gateway.process_request(request, ctx).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(GatewayError::Request(e)) => {
            debug!(trace_id = %ctx.trace_id, "rejected operation: {}", e);
            json_response(
                StatusCode::BAD_REQUEST,
                &GraphQLResponse::from_errors(vec![e.to_graphql_error()]),
            )
        }
        Err(e @ GatewayError::NotReady) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), e.code())
        }
        Err(e) => {
            error!(trace_id = %ctx.trace_id, "failed to process request: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), e.code())
        }
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Retries `accept` until it yields a connection. Errors such as `EMFILE`
/// or `ECONNABORTED` are transient for a listening socket.
async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Serves connections forever, one task per connection.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<FederationGateway>,
    cors: Arc<CorsPolicy>,
) -> Result<(), GatewayError> {
    info!("listening on http://{}", listener.local_addr()?);

    loop {
        let (stream, remote) = accept_retrying(|| listener.accept()).await;
        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);
        let cors = Arc::clone(&cors);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, gateway.clone(), cors.clone()));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(%remote, "connection closed with error: {}", e);
            }
        });
    }
}

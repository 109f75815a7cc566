use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use community_gateway::config::Args;
use community_gateway::server::{CorsPolicy, serve};
use community_gateway::{FederationGateway, GatewayError, logging};
use tokio::net::TcpListener;
use tracing::{error, info};

async fn run(args: Args) -> Result<(), GatewayError> {
    let subgraphs = args.resolve_subgraphs()?;
    info!(
        subgraphs = ?subgraphs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "composing supergraph"
    );

    let gateway = Arc::new(FederationGateway::with_defaults(subgraphs));
    gateway.compose().await?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = TcpListener::bind(addr).await?;
    info!("GraphiQL UI available at http://{}/graphiql", addr);

    serve(
        listener,
        gateway,
        Arc::new(CorsPolicy::new(args.allowed_origins.clone())),
    )
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(args.log_format, &args.log_filter) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("gateway stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

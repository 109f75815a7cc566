use serde::Deserialize;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::GatewayError;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

pub fn build_logger(
    format: LogFormat,
    filter: &str,
) -> Result<Box<dyn Layer<Registry> + Send + Sync>, tracing_subscriber::filter::ParseError> {
    let filter = EnvFilter::try_new(filter)?;

    Ok(match format {
        LogFormat::Json => fmt::Layer::<Registry>::default()
            .json()
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => fmt::Layer::<Registry>::default()
            .pretty()
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::Layer::<Registry>::default()
            .compact()
            .with_filter(filter)
            .boxed(),
    })
}

/// Installs the global subscriber. Call once, before anything logs.
pub fn init(format: LogFormat, filter: &str) -> Result<(), GatewayError> {
    let logger = build_logger(format, filter)
        .map_err(|e| GatewayError::Config(format!("invalid log filter \"{}\": {}", filter, e)))?;

    set_global_default(tracing_subscriber::registry().with(logger))
        .map_err(|e| GatewayError::Config(format!("failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_every_format() {
        for format in [LogFormat::Json, LogFormat::Pretty, LogFormat::Compact] {
            assert!(build_logger(format, "community_gateway=debug,info").is_ok());
        }
    }

    #[test]
    fn rejects_bad_filter() {
        assert!(build_logger(LogFormat::Compact, "community_gateway=loud").is_err());
    }
}

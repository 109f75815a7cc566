use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::logging::{DEFAULT_LOG_FILTER, LogFormat};
use crate::{GatewayError, SubgraphConfig};

pub const DEFAULT_PORT: u16 = 4000;

/// Subgraph URL variables read when neither a supergraph file nor
/// `--subgraph` is given.
pub const SUBGRAPH_URL_VARS: [(&str, &str); 4] = [
    ("auth-service", "AUTH_SERVICE_URL"),
    ("community-engagement-service", "COMMUNITY_SERVICE_URL"),
    ("business-event-service", "BUSINESS_SERVICE_URL"),
    ("ai-microservice", "AI_SERVICE_URL"),
];

#[derive(Clone, Debug, Parser)]
#[command(name = "community-gateway", version, about = "Authenticated GraphQL federation gateway")]
pub struct Args {
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// YAML file listing subgraphs, see `schemas/supergraph.yaml`.
    #[arg(long, env = "SUPERGRAPH_CONFIG")]
    pub supergraph_config: Option<PathBuf>,

    /// `name=url`, repeatable. Order is kept.
    #[arg(
        long = "subgraph",
        env = "SUBGRAPHS",
        value_delimiter = ',',
        value_parser = parse_subgraph
    )]
    pub subgraphs: Vec<SubgraphConfig>,

    /// Origins allowed to send credentialed requests.
    #[arg(long = "allowed-origin", env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[arg(long, env = "SUBGRAPH_TIMEOUT_MS", default_value_t = 30_000)]
    pub subgraph_timeout_ms: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,
}

impl Args {
    /// Resolves the subgraph list: supergraph file first, then `--subgraph`,
    /// then the per-service URL variables.
    pub fn resolve_subgraphs(&self) -> Result<Vec<SubgraphConfig>, GatewayError> {
        let default_timeout = Duration::from_millis(self.subgraph_timeout_ms);

        let subgraphs = if let Some(path) = &self.supergraph_config {
            load_supergraph_config(path, default_timeout)?
        } else if !self.subgraphs.is_empty() {
            self.subgraphs
                .iter()
                .cloned()
                .map(|s| s.with_timeout(default_timeout))
                .collect()
        } else {
            subgraphs_from_env(|var| std::env::var(var).ok())?
                .into_iter()
                .map(|s| s.with_timeout(default_timeout))
                .collect()
        };

        if subgraphs.is_empty() {
            return Err(GatewayError::Config(
                "no subgraphs configured: use --supergraph-config or --subgraph name=url".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(subgraphs.len());
        for subgraph in &subgraphs {
            if seen.contains(&subgraph.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "subgraph \"{}\" is configured twice",
                    subgraph.name
                )));
            }
            seen.push(subgraph.name.as_str());
        }

        Ok(subgraphs)
    }
}

pub fn parse_subgraph(raw: &str) -> Result<SubgraphConfig, String> {
    let (name, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=url, got \"{}\"", raw))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || url.is_empty() {
        return Err(format!("expected name=url, got \"{}\"", raw));
    }
    Ok(SubgraphConfig::new(name, url))
}

/// All four per-service variables, or none. A partial set fails instead of
/// composing a partial supergraph.
fn subgraphs_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<SubgraphConfig>, GatewayError> {
    let mut subgraphs = Vec::with_capacity(SUBGRAPH_URL_VARS.len());
    let mut missing = Vec::new();
    for (name, var) in SUBGRAPH_URL_VARS {
        match lookup(var).filter(|url| !url.trim().is_empty()) {
            Some(url) => subgraphs.push(SubgraphConfig::new(name, url.trim())),
            None => missing.push(var),
        }
    }

    if !subgraphs.is_empty() && !missing.is_empty() {
        return Err(GatewayError::Config(format!(
            "missing subgraph URL variables: {}",
            missing.join(", ")
        )));
    }
    Ok(subgraphs)
}

#[derive(Debug, Deserialize)]
struct SubgraphEntry {
    routing_url: String,
    #[serde(default)]
    schema: Option<SchemaEntry>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SchemaEntry {
    file: PathBuf,
}

/// Reads a `subgraphs: { name: { routing_url, schema: { file } } }` file.
/// Schema files resolve relative to the config file.
pub fn load_supergraph_config(
    path: &Path,
    default_timeout: Duration,
) -> Result<Vec<SubgraphConfig>, GatewayError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    parse_supergraph_config(&contents, base_dir, default_timeout)
}

pub fn parse_supergraph_config(
    contents: &str,
    base_dir: &Path,
    default_timeout: Duration,
) -> Result<Vec<SubgraphConfig>, GatewayError> {
    let invalid = |reason: String| GatewayError::Config(format!("invalid supergraph config: {}", reason));

    let document: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|e| invalid(e.to_string()))?;
    let Some(entries) = document.get("subgraphs").and_then(|s| s.as_mapping()) else {
        return Err(invalid("missing \"subgraphs\" mapping".to_string()));
    };

    let mut subgraphs = Vec::with_capacity(entries.len());
    for (name, entry) in entries {
        let name = name
            .as_str()
            .ok_or_else(|| invalid("subgraph names must be strings".to_string()))?;
        let entry: SubgraphEntry = serde_yaml::from_value(entry.clone())
            .map_err(|e| invalid(format!("subgraph \"{}\": {}", name, e)))?;

        let mut subgraph = SubgraphConfig::new(name, entry.routing_url).with_timeout(
            entry
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
        );
        subgraph.schema_file = entry.schema.map(|s| base_dir.join(s.file));
        debug!(subgraph = %subgraph.name, url = %subgraph.url, "configured subgraph");
        subgraphs.push(subgraph);
    }

    Ok(subgraphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SUPERGRAPH_YAML: &str = r#"
subgraphs:
  auth-service:
    routing_url: http://localhost:4001/graphql
    schema:
      file: ./auth.graphql
  community-engagement-service:
    routing_url: http://localhost:4002/graphql
    timeout_ms: 500
"#;

    #[test]
    fn supergraph_file_keeps_order() {
        let subgraphs = parse_supergraph_config(
            SUPERGRAPH_YAML,
            Path::new("schemas"),
            Duration::from_secs(30),
        )
        .unwrap();

        assert_eq!(subgraphs.len(), 2);
        assert_eq!(subgraphs[0].name, "auth-service");
        assert_eq!(
            subgraphs[0].schema_file,
            Some(PathBuf::from("schemas").join("./auth.graphql"))
        );
        assert_eq!(subgraphs[0].timeout, Duration::from_secs(30));
        assert_eq!(subgraphs[1].name, "community-engagement-service");
        assert_eq!(subgraphs[1].url, "http://localhost:4002/graphql");
        assert_eq!(subgraphs[1].schema_file, None);
        assert_eq!(subgraphs[1].timeout, Duration::from_millis(500));
    }

    #[test]
    fn bundled_supergraph_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("schemas/supergraph.yaml");
        let subgraphs = load_supergraph_config(&path, Duration::from_secs(30)).unwrap();

        let names: Vec<&str> = subgraphs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "auth-service",
                "community-engagement-service",
                "business-event-service",
                "ai-microservice"
            ]
        );
        assert_eq!(subgraphs[2].timeout, Duration::from_secs(10));
    }

    #[test]
    fn supergraph_file_without_subgraphs_fails() {
        assert!(matches!(
            parse_supergraph_config("services: {}", Path::new(""), Duration::from_secs(1)),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn subgraph_flag_parsing() {
        assert_eq!(
            parse_subgraph("auth-service=http://localhost:4001/graphql").unwrap(),
            SubgraphConfig::new("auth-service", "http://localhost:4001/graphql")
        );
        assert!(parse_subgraph("auth-service").is_err());
        assert!(parse_subgraph("=http://x").is_err());
    }

    #[test]
    fn cli_flags_resolve_in_order() {
        let args = Args::try_parse_from([
            "community-gateway",
            "--port",
            "5000",
            "--subgraph",
            "b=http://b/graphql",
            "--subgraph",
            "a=http://a/graphql",
            "--allowed-origin",
            "http://localhost:3000",
            "--subgraph-timeout-ms",
            "250",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(args.port, 5000);
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.allowed_origins, vec!["http://localhost:3000".to_string()]);

        let subgraphs = args.resolve_subgraphs().unwrap();
        let names: Vec<&str> = subgraphs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(subgraphs[0].timeout, Duration::from_millis(250));
    }

    #[test]
    fn duplicate_subgraphs_are_rejected() {
        let args = Args::try_parse_from([
            "community-gateway",
            "--subgraph",
            "a=http://a/graphql",
            "--subgraph",
            "a=http://other/graphql",
        ])
        .unwrap();

        assert!(matches!(
            args.resolve_subgraphs(),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn service_url_variables_are_a_fallback() {
        let subgraphs = subgraphs_from_env(|var| {
            Some(format!("http://{}/graphql", var.to_lowercase()))
        })
        .unwrap();

        let names: Vec<&str> = subgraphs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "auth-service",
                "community-engagement-service",
                "business-event-service",
                "ai-microservice"
            ]
        );
        assert_eq!(subgraphs[0].url, "http://auth_service_url/graphql");
        assert!(subgraphs_from_env(|_| None).unwrap().is_empty());
    }

    #[test]
    fn partial_service_url_variables_fail() {
        let result = subgraphs_from_env(|var| match var {
            "AUTH_SERVICE_URL" => Some("http://localhost:4001/graphql".to_string()),
            "AI_SERVICE_URL" => Some("http://localhost:4004/graphql".to_string()),
            "BUSINESS_SERVICE_URL" => Some("  ".to_string()),
            _ => None,
        });

        let message = match result {
            Err(GatewayError::Config(message)) => message,
            other => panic!("expected a config error, got {:?}", other),
        };
        assert!(message.contains("COMMUNITY_SERVICE_URL"));
        assert!(message.contains("BUSINESS_SERVICE_URL"));
        assert!(!message.contains("AUTH_SERVICE_URL"));
    }
}

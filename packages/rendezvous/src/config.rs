use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use figment::{providers::Format, Figment};
use serde::{Deserialize, Serialize};
use utils::config::{find_config_file, CliEnvExt};

use crate::args::CliArgs;

/// The fully parsed and validated config struct we use in the application.
/// Built from multiple sources (in order of preference):
///
/// 1. cli args
/// 2. environment variables
/// 3. settings.json
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// The replica id this process runs as.
    pub replica_id: String,

    /// Dispatch replication as detached tasks instead of joining every
    /// peer call before returning to the client.
    pub async_replication: bool,
    /// Stamp and check per-origin versions on replicated contexts.
    pub context_versioning: bool,

    /// Reaper cadence for stale requests, in minutes. Non-positive
    /// disables the reaper.
    pub cleanup_requests_interval_m: i64,
    /// Age, in minutes, beyond which an inactive request is evicted.
    pub cleanup_requests_validity_m: i64,
    /// Reaper cadence for stale subscribers, in minutes. Non-positive
    /// disables the reaper.
    pub cleanup_subscribers_interval_m: i64,
    /// Age, in minutes, beyond which an idle subscriber is evicted.
    pub cleanup_subscribers_validity_m: i64,

    /// How often a blocked subscriber read wakes to refresh its liveness
    /// timestamp, in seconds.
    pub subscribers_refresh_interval_s: u64,
    /// Per-wake timeout of version-registry waits and the overall deadline
    /// of visible-bids waits, in seconds.
    pub wait_replica_timeout_s: u64,

    /// The log-level to use, in the format of
    /// [tracing directives](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives).
    pub log_level: Vec<String>,
    /// The allowed cors origins. Default is empty.
    pub cors_allowed_origins: Vec<String>,
    /// OTLP trace collector endpoint, if tracing export is wanted.
    pub jaeger: Option<String>,
    /// OTLP metrics collector endpoint, if metrics export is wanted.
    pub prometheus: Option<String>,

    /// replica id -> address, for the whole fleet including this replica.
    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,

    /// From the CONSISTENCY_CHECKS env var: setting it to 0 turns the
    /// whole engine into a no-op for latency measurements.
    #[serde(default = "default_true")]
    pub consistency_checks: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Connection {
    pub host: String,
    pub port: u16,
}

/// Default values for the config struct; these only fill holes after all
/// the parsing and loading is done.
impl Default for Config {
    fn default() -> Self {
        Self {
            replica_id: String::new(),
            async_replication: false,
            context_versioning: false,
            cleanup_requests_interval_m: 30,
            cleanup_requests_validity_m: 30,
            cleanup_subscribers_interval_m: 30,
            cleanup_subscribers_validity_m: 30,
            subscribers_refresh_interval_s: 60,
            wait_replica_timeout_s: 60,
            log_level: vec!["info".to_string()],
            cors_allowed_origins: Vec::new(),
            jaeger: None,
            prometheus: None,
            connections: BTreeMap::new(),
            consistency_checks: true,
        }
    }
}

impl Config {
    /// The socket this replica listens on: the port assigned to it in the
    /// connections document, bound on all interfaces.
    pub fn listen_addr(&self) -> Result<(String, u16)> {
        let connection = self
            .connections
            .get(&self.replica_id)
            .with_context(|| format!("replica id '{}' not in connections", self.replica_id))?;
        Ok(("0.0.0.0".to_string(), connection.port))
    }

    /// Base URLs of every peer replica (everyone but us).
    pub fn peer_urls(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|(id, _)| *id != &self.replica_id)
            .map(|(_, conn)| format!("http://{}:{}", conn.host, conn.port))
            .collect()
    }

    pub fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in &self.log_level {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }

        Ok(filter)
    }
}

/// The builder we use to build Config
#[derive(Debug)]
pub struct ConfigBuilder {
    pub cli_args: CliArgs,
}

impl ConfigBuilder {
    pub const SETTINGS_FILENAME: &'static str = "settings.json";
    pub const CONNECTIONS_FILENAME: &'static str = "connections.json";
    pub const DIRNAME: &'static str = "rendezvous";

    pub fn new(cli_args: CliArgs) -> Self {
        Self { cli_args }
    }

    pub fn build(self) -> Result<Config> {
        // dotenv + env var merge first, since env may point at the files
        let cli_env_args = self.cli_args.merge_cli_env()?;

        let settings_path = match cli_env_args.settings.clone() {
            Some(path) => path,
            None => find_config_file(
                cli_env_args.home_dir(),
                Self::DIRNAME,
                Self::SETTINGS_FILENAME,
            )?,
        };

        let connections_path = match cli_env_args.connections.clone() {
            Some(path) => path,
            None => find_config_file(
                cli_env_args.home_dir(),
                Self::DIRNAME,
                Self::CONNECTIONS_FILENAME,
            )?,
        };

        let mut config: Config = Figment::new()
            .merge(figment::providers::Json::file(&settings_path))
            .merge(figment::providers::Serialized::defaults(&cli_env_args))
            .join(figment::providers::Serialized::defaults(Config::default()))
            .extract()
            .with_context(|| format!("error parsing {}", settings_path.display()))?;

        config.connections = Self::load_connections(&connections_path)?;

        // env var gate, kept out of the config files on purpose: latency
        // runs flip it without touching deployment configs
        if let Ok(value) = std::env::var("CONSISTENCY_CHECKS") {
            config.consistency_checks = value.trim() != "0";
        }

        if config.replica_id.is_empty() {
            bail!("no replica id provided (--replica-id or RENDEZVOUS_REPLICA_ID)");
        }
        if !config.connections.contains_key(&config.replica_id) {
            bail!(
                "replica id '{}' not present in {}",
                config.replica_id,
                connections_path.display()
            );
        }

        Ok(config)
    }

    fn load_connections(path: &PathBuf) -> Result<BTreeMap<String, Connection>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("error opening {}", path.display()))?;
        let connections: BTreeMap<String, Connection> = serde_json::from_str(&raw)
            .with_context(|| format!("error parsing {}", path.display()))?;
        if connections.is_empty() {
            bail!("connections file {} has no replicas", path.display());
        }
        Ok(connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{contents}").unwrap();
        path
    }

    const SETTINGS: &str = r#"{
        "async_replication": true,
        "context_versioning": false,
        "cleanup_requests_interval_m": -1,
        "cleanup_requests_validity_m": 10,
        "cleanup_subscribers_interval_m": 5,
        "cleanup_subscribers_validity_m": 5,
        "subscribers_refresh_interval_s": 30,
        "wait_replica_timeout_s": 15
    }"#;

    const CONNECTIONS: &str = r#"{
        "eu": { "host": "rendezvous-eu", "port": 8001 },
        "us": { "host": "rendezvous-us", "port": 8002 }
    }"#;

    #[test]
    fn build_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_file(dir.path(), "settings.json", SETTINGS);
        let connections = write_file(dir.path(), "connections.json", CONNECTIONS);

        let config = ConfigBuilder::new(CliArgs {
            replica_id: Some("eu".to_string()),
            settings: Some(settings),
            connections: Some(connections),
            dotenv: Some(dir.path().join("no-dotenv")),
            ..Default::default()
        })
        .build()
        .unwrap();

        assert!(config.async_replication);
        assert_eq!(config.cleanup_requests_interval_m, -1);
        assert_eq!(config.wait_replica_timeout_s, 15);
        // defaults fill the holes
        assert_eq!(config.log_level, vec!["info".to_string()]);

        assert_eq!(config.listen_addr().unwrap(), ("0.0.0.0".to_string(), 8001));
        assert_eq!(
            config.peer_urls(),
            vec!["http://rendezvous-us:8002".to_string()]
        );
    }

    #[test]
    fn unknown_replica_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_file(dir.path(), "settings.json", SETTINGS);
        let connections = write_file(dir.path(), "connections.json", CONNECTIONS);

        let err = ConfigBuilder::new(CliArgs {
            replica_id: Some("ap".to_string()),
            settings: Some(settings),
            connections: Some(connections),
            dotenv: Some(dir.path().join("no-dotenv")),
            ..Default::default()
        })
        .build()
        .unwrap_err();
        assert!(err.to_string().contains("not present"));
    }

    #[test]
    fn missing_replica_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_file(dir.path(), "settings.json", SETTINGS);
        let connections = write_file(dir.path(), "connections.json", CONNECTIONS);

        let err = ConfigBuilder::new(CliArgs {
            settings: Some(settings),
            connections: Some(connections),
            dotenv: Some(dir.path().join("no-dotenv")),
            ..Default::default()
        })
        .build()
        .unwrap_err();
        assert!(err.to_string().contains("no replica id"));
    }
}

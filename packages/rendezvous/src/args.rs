use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utils::{config::CliEnvExt, serde::deserialize_vec_string};

/// This struct is used for both args and environment variables:
/// every env var can be overridden by a cli arg, and these override the
/// config file. Env vars follow the pattern RENDEZVOUS_{UPPERCASE_ARG_NAME}.
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// The replica id this process runs as; must be one of the keys of the
    /// connections document
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_id: Option<String>,

    /// The home directory where settings.json and connections.json live;
    /// if not provided, a series of default directories is tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load
    /// if not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// Explicit path to settings.json, bypassing the directory lookup
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<PathBuf>,

    /// Explicit path to connections.json, bypassing the directory lookup
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<PathBuf>,

    /// Log level in the format of comma-separated tracing directives.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub log_level: Vec<String>,
}

impl CliEnvExt for CliArgs {
    const ENV_VAR_PREFIX: &'static str = "RENDEZVOUS";

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn dotenv_path(&self) -> Option<PathBuf> {
        self.dotenv.clone()
    }
}

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use figment::Figment;
use serde::{de::DeserializeOwned, Serialize};

/// Shared machinery for CLI-arg structs that can also be filled from
/// environment variables: every arg can be overridden by
/// `<ENV_VAR_PREFIX>_<UPPERCASE_ARG_NAME>`, and both override the config
/// file.
pub trait CliEnvExt: Serialize + DeserializeOwned {
    const ENV_VAR_PREFIX: &'static str;

    /// Explicit home directory, if one was passed.
    fn home_dir(&self) -> Option<PathBuf>;

    /// Explicit dotenv path, if one was passed.
    fn dotenv_path(&self) -> Option<PathBuf>;

    /// Load the dotenv file first (it may define the env vars the merge
    /// below reads), then merge env vars over the parsed CLI args.
    fn merge_cli_env(self) -> Result<Self> {
        let dotenv_path = self
            .dotenv_path()
            .map(Ok)
            .unwrap_or_else(|| std::env::current_dir().map(|dir| dir.join(".env")))?;

        if dotenv_path.exists() {
            if let Err(e) = dotenvy::from_path(&dotenv_path) {
                bail!("error loading dotenv file {}: {}", dotenv_path.display(), e);
            }
        }

        let merged = Figment::new()
            .merge(figment::providers::Env::prefixed(&format!(
                "{}_",
                Self::ENV_VAR_PREFIX
            )))
            .merge(figment::providers::Serialized::defaults(&self))
            .extract()?;

        Ok(merged)
    }
}

/// Directories tried, in order, when looking for a config file named
/// `filename` belonging to application `app`:
///
/// 1. an explicit home directory (cli/env)
/// 2. the current working directory
/// 3. `~/.<app>/`
/// 4. the system config dir (`~/.config/<app>` on Linux)
/// 5. `~/.config/<app>` explicitly (macOS/Windows place config_dir elsewhere)
/// 6. `/etc/<app>/`
pub fn config_filepaths(home: Option<PathBuf>, app: &str, filename: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(dir) = home {
        dirs.push(dir);
    }

    if let Ok(dir) = std::env::current_dir() {
        dirs.push(dir);
    }

    if let Some(dir) = dirs::home_dir().map(|dir| dir.join(format!(".{app}"))) {
        dirs.push(dir);
    }

    if let Some(dir) = dirs::config_dir().map(|dir| dir.join(app)) {
        dirs.push(dir);
    }

    if let Some(dir) = dirs::home_dir().map(|dir| dir.join(".config").join(app)) {
        dirs.push(dir);
    }

    dirs.push(PathBuf::from("/etc").join(app));

    dirs.into_iter().map(|dir| dir.join(filename)).collect()
}

/// First existing candidate from [`config_filepaths`], or an error listing
/// everything that was tried.
pub fn find_config_file(home: Option<PathBuf>, app: &str, filename: &str) -> Result<PathBuf> {
    let candidates = config_filepaths(home, app, filename);
    candidates
        .iter()
        .find(|path| path.exists())
        .cloned()
        .with_context(|| {
            format!(
                "no config file found, try creating one of these: {:?}",
                candidates
            )
        })
}

/// Expand a leading tilde in a path taken from config or CLI.
pub fn expand_path(path: &std::path::Path) -> PathBuf {
    shellexpand::tilde(&path.to_string_lossy()).to_string().into()
}

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::TeleindexConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "teleindex.toml",
    "teleindex.yaml",
    "teleindex.yml",
    "teleindex.json",
];

/// Env var overriding `database.url`.
pub const DATABASE_URL_ENV: &str = "TELEINDEX_DATABASE_URL";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<TeleindexConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Returns `TeleindexConfig::default()` if no config file is found or the
/// file fails to parse. Env overrides are applied in both cases.
pub fn discover_and_load() -> TeleindexConfig {
    let mut cfg = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                TeleindexConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            TeleindexConfig::default()
        },
    };
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg
}

/// Apply `TELEINDEX_*` overrides on top of a loaded config.
pub fn apply_env_overrides(cfg: &mut TeleindexConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(DATABASE_URL_ENV).filter(|v| !v.is_empty()) {
        debug!("database url overridden from environment");
        cfg.database.url = url;
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "teleindex").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<TeleindexConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}

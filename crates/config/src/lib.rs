//! Configuration loading, validation and env substitution.
//!
//! Config files: `teleindex.toml`, `teleindex.yaml`, `teleindex.yml` or
//! `teleindex.json`. Searched in `./` then the user config directory
//! (`~/.config/teleindex/` on Linux).
//!
//! Supports `${ENV_VAR}` substitution anywhere in the raw file.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config,
    },
    schema::{
        BackfillConfig, DatabaseConfig, IndexConfig, ListenerConfig, MetricsConfig, StorageConfig,
        SyncConfig, TeleindexConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, check_config, validate},
};

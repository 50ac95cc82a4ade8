//! Channel ingestion engine.
//!
//! Pulls channel history from a [`platform::MessagingPlatform`], normalizes
//! messages (optionally offloading media to an [`objects::ObjectStore`]) and
//! upserts them into an [`index::IndexStore`]. A live listener indexes new
//! messages as they arrive; reconciliation brings every channel up to date.

pub mod backfill;
pub mod directory;
pub mod engine;
pub mod error;
pub mod index;
pub mod index_memory;
pub mod listener;
pub mod media;
pub mod model;
pub mod normalize;
pub mod objects;
pub mod platform;
pub mod progress;
pub mod reconcile;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod tasks;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use {
    engine::IngestEngine,
    error::{Error, Result},
};

/// Run database migrations for the status store.
///
/// Creates the `kv` and `kv_sets` tables used by
/// [`store_sqlite::SqliteStatusStore`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

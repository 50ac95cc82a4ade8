//! Status store contract: a small key/value space plus string sets.

use async_trait::async_trait;

use crate::Result;

/// Key holding the serialized [`crate::model::ListenerStatus`].
pub const LISTENER_STATUS_KEY: &str = "listener:status";
/// Set key holding monitored channel ids.
pub const LISTENER_CHANNELS_KEY: &str = "listener:channels";

/// Persistence backend shared by the listener and the admin CLI.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write `value` only if the stored value still equals `expected`
    /// (`None` meaning absent). Returns `false` when another writer got there
    /// first.
    async fn compare_and_set(&self, key: &str, expected: Option<&str>, value: &str)
    -> Result<bool>;
    /// Returns `true` if the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    /// Returns `true` if the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;
    /// Members in ascending order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
}

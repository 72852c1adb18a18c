use async_trait::async_trait;
use bytes::Bytes;

use crate::key::StorageKey;

#[async_trait]
pub trait StorageBackend: Sync + Send + 'static {
    /// Stores the encoded image under the given key and returns the URL it
    /// can be accessed at.
    ///
    /// Storing under an existing key replaces the previous image.
    async fn store(&self, key: &StorageKey, data: Bytes) -> anyhow::Result<String>;

    /// Removes the image stored under the given key.
    ///
    /// Returns `false` if nothing was stored under the key.
    async fn delete(&self, key: &StorageKey) -> anyhow::Result<bool>;

    /// Removes every image in the backend's namespace, returning how many
    /// were removed.
    async fn purge(&self) -> anyhow::Result<usize>;

    /// Maps an access URL previously returned by [`StorageBackend::store`]
    /// back to its key.
    ///
    /// URLs that were not produced by this backend yield `None`.
    fn key_for_url(&self, access_url: &str) -> Option<StorageKey>;
}

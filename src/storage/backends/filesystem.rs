use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::key::{StorageKey, IMAGE_SUFFIX};
use crate::StorageBackend;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct FileSystemBackend {
    directory: PathBuf,
    public_prefix: String,
}

impl FileSystemBackend {
    pub fn new(dir: PathBuf, public_prefix: &str) -> Self {
        Self {
            directory: dir,
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    #[inline]
    fn format_path(&self, key: &StorageKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    #[inline]
    fn format_url(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.public_prefix, key.file_name())
    }

    async fn write_replacing(&self, path: &PathBuf, data: &[u8]) -> std::io::Result<()> {
        let tmp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));

        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    async fn store(&self, key: &StorageKey, data: Bytes) -> anyhow::Result<String> {
        let path = self.format_path(key);

        debug!("Storing image @ {:?}", &path);
        match self.write_replacing(&path, &data).await {
            Ok(()) => {},
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.directory).await?;
                self.write_replacing(&path, &data).await?;
            },
            Err(other) => return Err(other.into()),
        }

        Ok(self.format_url(key))
    }

    async fn delete(&self, key: &StorageKey) -> anyhow::Result<bool> {
        let path = self.format_path(key);

        debug!("Purging image @ {:?}", &path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(other) => Err(other.into()),
        }
    }

    async fn purge(&self) -> anyhow::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(other) => return Err(other.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let key = match name.to_str().and_then(StorageKey::from_file_name) {
                Some(key) => key,
                None => continue,
            };

            if self.delete(&key).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn key_for_url(&self, access_url: &str) -> Option<StorageKey> {
        let file_name = access_url
            .strip_prefix(&self.public_prefix)?
            .strip_prefix('/')?;

        if !file_name.ends_with(IMAGE_SUFFIX) {
            return None;
        }

        StorageKey::from_file_name(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StorageKey {
        StorageKey::derive(name).unwrap()
    }

    #[tokio::test]
    async fn test_store_overwrites_by_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().join("images"), "/uploads/");

        let first = backend.store(&key("Jane Doe.png"), Bytes::from_static(b"first")).await?;
        let second = backend.store(&key("Jane  Doe.heic"), Bytes::from_static(b"second")).await?;

        assert_eq!(first, "/uploads/Jane_Doe.webp");
        assert_eq!(first, second);

        let stored = tokio::fs::read(dir.path().join("images").join("Jane_Doe.webp")).await?;
        assert_eq!(stored, b"second");

        let mut entries = tokio::fs::read_dir(dir.path().join("images")).await?;
        let mut count = 0;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "temporary files must not be left behind");

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_and_purge() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().to_path_buf(), "/uploads");

        backend.store(&key("Jane Doe"), Bytes::from_static(b"a")).await?;
        backend.store(&key("John Roe"), Bytes::from_static(b"b")).await?;
        tokio::fs::write(dir.path().join("notes.txt"), b"keep").await?;

        assert!(backend.delete(&key("Jane Doe")).await?);
        assert!(!backend.delete(&key("Jane Doe")).await?);

        assert_eq!(backend.purge().await?, 1);
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("John_Roe.webp").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_purge_missing_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = FileSystemBackend::new(dir.path().join("missing"), "/uploads");
        assert_eq!(backend.purge().await?, 0);
        Ok(())
    }

    #[test]
    fn test_key_for_url_is_exact() {
        let backend = FileSystemBackend::new(PathBuf::from("/tmp/x"), "/uploads");

        assert_eq!(backend.key_for_url("/uploads/Jane_Doe.webp"), Some(key("Jane Doe")));
        assert_eq!(backend.key_for_url("/uploads/Jane_Doe.png"), None);
        assert_eq!(backend.key_for_url("/uploadsJane_Doe.webp"), None);
        assert_eq!(backend.key_for_url("/other/Jane_Doe.webp"), None);
        assert_eq!(backend.key_for_url("/uploads/../secret.webp"), None);
        assert_eq!(backend.key_for_url("/uploads/a/b.webp"), None);
        assert_eq!(backend.key_for_url("https://res.cloudinary.com/x/Jane_Doe.webp"), None);
    }
}

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::StatusCode;
use tracing::instrument;

use crate::fetch::{FetchError, Fetcher};
use crate::key::{extension_of, StorageKey};
use crate::processor::{looks_like_heic, Transcoder};
use crate::resolver::{ReferenceResolver, Resolution};
use crate::StorageBackend;

/// A successfully stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub key: StorageKey,
    pub url: String,
}

/// The outcome of the optional HEIC conversion step.
pub enum Transcoded {
    Converted(Bytes),
    Passthrough(Bytes),
}

impl Transcoded {
    #[inline]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Converted(data) | Self::Passthrough(data) => data,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("no drive reference to ingest")]
    NotAReference,

    #[error("logical name {0:?} does not produce a usable storage key")]
    InvalidName(String),

    #[error("fetch responded with status {0}")]
    FetchStatus(StatusCode),

    #[error("fetch failed: {0}")]
    Network(reqwest::Error),

    #[error("image exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("webp encoding failed: {0}")]
    Encode(anyhow::Error),

    #[error("storing image failed: {0}")]
    Store(anyhow::Error),
}

impl From<FetchError> for IngestError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Status(status) => Self::FetchStatus(status),
            FetchError::Network(e) => Self::Network(e),
            FetchError::TooLarge { limit } => Self::TooLarge { limit },
        }
    }
}

impl IngestError {
    fn log(&self, logical_name: &str) {
        match self {
            Self::NotAReference => {
                debug!("Skipping image for {}: {}", logical_name, self)
            },
            Self::InvalidName(_) | Self::FetchStatus(_) | Self::TooLarge { .. } => {
                warn!("Failed to ingest image for {}: {}", logical_name, self)
            },
            Self::Network(_) | Self::Encode(_) | Self::Store(_) => {
                error!("Failed to ingest image for {}: {}", logical_name, self)
            },
        }
    }
}

/// Fetches referenced images, normalises them to WebP and stores them.
///
/// The pipeline holds no state between invocations, every call either
/// stores a complete image or nothing at all.
pub struct IngestPipeline {
    resolver: ReferenceResolver,
    fetcher: Fetcher,
    transcoder: Arc<dyn Transcoder>,
    storage: Arc<dyn StorageBackend>,
    webp_quality: f32,
}

impl IngestPipeline {
    pub fn new(
        resolver: ReferenceResolver,
        fetcher: Fetcher,
        transcoder: Arc<dyn Transcoder>,
        storage: Arc<dyn StorageBackend>,
        webp_quality: f32,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            transcoder,
            storage,
            webp_quality,
        }
    }

    #[inline]
    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Ingests the image behind `reference`, returning its access URL.
    ///
    /// An empty string means no image was stored; callers should persist
    /// their record without one.
    pub async fn ingest(&self, reference: Option<&str>, logical_name: &str) -> String {
        match self.try_ingest(reference, logical_name).await {
            Ok(stored) => {
                debug!("Ingested {} from reference", stored.key);
                stored.url
            },
            Err(e) => {
                e.log(logical_name);
                String::new()
            },
        }
    }

    /// Stores caller supplied image bytes, returning the access URL or an
    /// empty string on failure.
    pub async fn ingest_upload(&self, data: Bytes, logical_name: &str) -> String {
        match self.try_ingest_upload(data, logical_name).await {
            Ok(stored) => {
                debug!("Ingested {} from upload", stored.key);
                stored.url
            },
            Err(e) => {
                e.log(logical_name);
                String::new()
            },
        }
    }

    #[instrument(skip(self, reference), fields(reference = reference.unwrap_or_default()))]
    pub async fn try_ingest(
        &self,
        reference: Option<&str>,
        logical_name: &str,
    ) -> Result<StoredImage, IngestError> {
        let url = match self.resolver.resolve(reference) {
            Resolution::Direct { file_id, url } => {
                debug!("Resolved drive file {}", file_id);
                url
            },
            Resolution::NotAReference => return Err(IngestError::NotAReference),
        };

        let key = derive_key(logical_name)?;
        let data = self.fetcher.fetch(&url).await?;

        self.process_and_store(data, logical_name, key).await
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn try_ingest_upload(
        &self,
        data: Bytes,
        logical_name: &str,
    ) -> Result<StoredImage, IngestError> {
        let limit = self.fetcher.max_image_bytes();
        if data.len() > limit {
            return Err(IngestError::TooLarge { limit });
        }

        let key = derive_key(logical_name)?;
        self.process_and_store(data, logical_name, key).await
    }

    async fn process_and_store(
        &self,
        data: Bytes,
        logical_name: &str,
        key: StorageKey,
    ) -> Result<StoredImage, IngestError> {
        let start = Instant::now();

        let prepared = self.prepare(data, logical_name).await.into_bytes();
        let encoded = self
            .transcoder
            .sharpen_and_encode_webp(prepared, self.webp_quality)
            .await
            .map_err(IngestError::Encode)?;

        let url = self
            .storage
            .store(&key, encoded)
            .await
            .map_err(IngestError::Store)?;

        info!("Stored image for {} as {} in {:?}", logical_name, &key, start.elapsed());
        Ok(StoredImage { key, url })
    }

    /// Converts HEIC input to an intermediate format the encoder can read.
    ///
    /// A failed conversion falls back to the original bytes.
    async fn prepare(&self, data: Bytes, logical_name: &str) -> Transcoded {
        let named_heic = extension_of(logical_name).as_deref() == Some("heic");
        if !named_heic && !looks_like_heic(&data) {
            return Transcoded::Passthrough(data);
        }

        match self.transcoder.heic_to_intermediate(data.clone()).await {
            Ok(converted) => {
                debug!("Converted HEIC image for {}", logical_name);
                Transcoded::Converted(converted)
            },
            Err(e) => {
                warn!("HEIC conversion failed for {}, continuing with original bytes: {}", logical_name, e);
                Transcoded::Passthrough(data)
            },
        }
    }

    /// Removes the image behind a previously returned access URL.
    ///
    /// This never fails; anything that goes wrong is logged and the caller
    /// carries on with its own operation.
    pub async fn delete(&self, access_url: &str) {
        if access_url.trim().is_empty() {
            return;
        }

        let key = match self.storage.key_for_url(access_url) {
            Some(key) => key,
            None => {
                warn!("Not deleting {}, it was not produced by the configured storage", access_url);
                return;
            },
        };

        match self.storage.delete(&key).await {
            Ok(true) => info!("Deleted stored image {}", &key),
            Ok(false) => debug!("No stored image for {}", &key),
            Err(e) => warn!("Failed to delete stored image {}: {}", &key, e),
        }
    }

    /// Best-effort removal of every stored image.
    pub async fn purge(&self) -> usize {
        match self.storage.purge().await {
            Ok(removed) => {
                info!("Purged {} stored images", removed);
                removed
            },
            Err(e) => {
                warn!("Failed to purge stored images: {}", e);
                0
            },
        }
    }
}

fn derive_key(logical_name: &str) -> Result<StorageKey, IngestError> {
    StorageKey::derive(logical_name).ok_or_else(|| IngestError::InvalidName(logical_name.to_string()))
}

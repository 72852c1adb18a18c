use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// 10 MiB
const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout")]
    /// The outbound request timeout in seconds.
    ///
    /// Defaults to `30`.
    pub timeout: u64,

    #[serde(default = "default_max_image_bytes")]
    /// The largest image accepted, fetched or uploaded.
    ///
    /// Defaults to 10 MiB.
    pub max_image_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_max_image_bytes() -> usize {
    DEFAULT_MAX_IMAGE_BYTES
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("remote responded with status {0}")]
    Status(StatusCode),

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("image exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

/// Downloads images from their direct-fetch URL.
pub struct Fetcher {
    client: Client,
    max_image_bytes: usize,
}

impl Fetcher {
    pub fn new(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout))
            .build()?;

        Ok(Self {
            client,
            max_image_bytes: cfg.max_image_bytes,
        })
    }

    #[inline]
    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }

    /// Fetches the body of `url`, reading at most the configured limit.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        debug!("Fetching image @ {}", url);
        let mut resp = self.client.get(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let limit = self.max_image_bytes;
        if matches!(resp.content_length(), Some(len) if len > limit as u64) {
            return Err(FetchError::TooLarge { limit });
        }

        let mut buff = BytesMut::new();
        while let Some(chunk) = resp.chunk().await? {
            if buff.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            buff.extend_from_slice(&chunk);
        }

        Ok(buff.freeze())
    }
}

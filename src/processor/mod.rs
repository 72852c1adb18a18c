use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

pub mod encoder;
pub mod heic;

pub use heic::looks_like_heic;

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeConfig {
    #[serde(default = "default_webp_quality")]
    /// The lossy WebP quality from 0.0 to 100.0 inclusive.
    ///
    /// Defaults to `80`.
    pub webp_quality: f32,

    #[serde(default = "default_heic_program")]
    /// The HEIC to JPEG converter.
    ///
    /// Defaults to `heif-convert` on the `PATH`.
    pub heic_program: PathBuf,

    #[serde(default = "default_heic_timeout")]
    /// Seconds before a HEIC conversion is abandoned.
    pub heic_timeout: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            webp_quality: default_webp_quality(),
            heic_program: default_heic_program(),
            heic_timeout: default_heic_timeout(),
        }
    }
}

const fn default_webp_quality() -> f32 {
    80.0
}

fn default_heic_program() -> PathBuf {
    PathBuf::from("heif-convert")
}

const fn default_heic_timeout() -> u64 {
    60
}

#[async_trait]
pub trait Transcoder: Sync + Send + 'static {
    /// Converts a HEIC image into a JPEG at maximum quality.
    async fn heic_to_intermediate(&self, data: Bytes) -> anyhow::Result<Bytes>;

    /// Sharpens the image and encodes it as lossy WebP.
    async fn sharpen_and_encode_webp(&self, data: Bytes, quality: f32) -> anyhow::Result<Bytes>;
}

/// The production transcoder, HEIC conversion is delegated to an external
/// tool while WebP encoding runs on the rayon pool.
pub struct ImageTranscoder {
    heic: heic::HeicConverter,
}

impl ImageTranscoder {
    pub fn new(cfg: &TranscodeConfig) -> Self {
        Self {
            heic: heic::HeicConverter::new(
                cfg.heic_program.clone(),
                Duration::from_secs(cfg.heic_timeout),
            ),
        }
    }
}

#[async_trait]
impl Transcoder for ImageTranscoder {
    async fn heic_to_intermediate(&self, data: Bytes) -> anyhow::Result<Bytes> {
        self.heic.to_jpeg(&data).await
    }

    async fn sharpen_and_encode_webp(&self, data: Bytes, quality: f32) -> anyhow::Result<Bytes> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        rayon::spawn(move || {
            let result = encoder::sharpen_and_encode(&data, quality);
            let _ = tx.send(result);
        });

        rx.await?
    }
}

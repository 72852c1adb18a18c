use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use strum::{Display, EnumString};

use crate::controller::ImportConfig;
use crate::fetch::FetchConfig;
use crate::processor::TranscodeConfig;
use crate::resolver::DriveConfig;
use crate::storage::backends::BackendConfigs;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// The set storage backend configuration.
    pub backend: BackendConfigs,

    #[serde(default)]
    /// Where sharing links are resolved against.
    pub drive: DriveConfig,

    #[serde(default)]
    /// Outbound fetch limits.
    pub fetch: FetchConfig,

    #[serde(default)]
    /// Format conversion settings.
    ///
    /// See `processor::TranscodeConfig` for more.
    pub transcode: TranscodeConfig,

    #[serde(default)]
    pub import: ImportConfig,
}

impl RuntimeConfig {
    pub async fn from_file(file: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read config file {:?}", file))?;
        data.parse()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&self.transcode.webp_quality) {
            return Err(anyhow!(
                "transcode.webp_quality must be between 0 and 100, got {}",
                self.transcode.webp_quality,
            ));
        }

        if self.fetch.max_image_bytes == 0 {
            return Err(anyhow!("fetch.max_image_bytes must be greater than 0"));
        }

        Ok(())
    }
}

impl FromStr for RuntimeConfig {
    type Err = anyhow::Error;

    fn from_str(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    FileSystem,
    Cloudinary,
}

/// Builds an example config for the given backend.
pub fn template(backend: BackendKind) -> serde_json::Value {
    let backend = match backend {
        BackendKind::FileSystem => serde_json::json!({
            "type": "filesystem",
            "directory": "./data/uploads",
            "public_prefix": "/uploads",
        }),
        BackendKind::Cloudinary => serde_json::json!({
            "type": "cloudinary",
            "cloud_name": null,
            "api_key": null,
            "api_secret": null,
            "folder": "team",
            "request_timeout": 30,
        }),
    };

    serde_json::json!({
        "backend": backend,
        "drive": {
            "host": "https://drive.google.com",
            "sheets_host": "https://docs.google.com",
        },
        "fetch": {
            "timeout": 30,
            "max_image_bytes": 10 * 1024 * 1024,
        },
        "transcode": {
            "webp_quality": 80,
            "heic_program": "heif-convert",
            "heic_timeout": 60,
        },
        "import": {
            "throttle_ms": 200,
        },
    })
}

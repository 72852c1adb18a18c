use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;

use super::cloudinary::{CloudinaryBackend, Credentials};
use crate::StorageBackend;

const DEFAULT_API_BASE: &str = "https://api.cloudinary.com";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum BackendConfigs {
    FileSystem {
        /// The directory images are written to.
        directory: PathBuf,

        #[serde(default = "default_public_prefix")]
        /// The path the static file layer serves `directory` under.
        ///
        /// Defaults to `/uploads`.
        public_prefix: String,
    },
    Cloudinary {
        #[serde(default)]
        /// Falls back to the `CLOUD_NAME` env var.
        cloud_name: Option<String>,

        #[serde(default)]
        /// Falls back to the `CLOUD_API_KEY` env var.
        api_key: Option<String>,

        #[serde(default)]
        /// Falls back to the `CLOUD_API_SECRET` env var.
        api_secret: Option<String>,

        /// The folder every image is uploaded into.
        folder: String,

        #[serde(default = "default_api_base")]
        /// Defaults to `https://api.cloudinary.com`.
        api_base: String,

        #[serde(default)]
        /// The request timeout in seconds.
        request_timeout: Option<u64>,
    },
}

impl BackendConfigs {
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        match self {
            Self::FileSystem { directory, public_prefix } => {
                tokio::fs::create_dir_all(directory).await?;
                info!("Storing images on disk @ {:?}", directory);
                Ok(Arc::new(super::filesystem::FileSystemBackend::new(
                    directory.clone(),
                    public_prefix,
                )))
            },
            Self::Cloudinary {
                cloud_name,
                api_key,
                api_secret,
                folder,
                api_base,
                request_timeout,
            } => {
                let credentials = Credentials {
                    cloud_name: from_env_or(cloud_name, "CLOUD_NAME")?,
                    api_key: from_env_or(api_key, "CLOUD_API_KEY")?,
                    api_secret: from_env_or(api_secret, "CLOUD_API_SECRET")?,
                };

                info!("Storing images remotely in folder {:?} of {}", folder, &credentials.cloud_name);
                let backend = CloudinaryBackend::new(
                    api_base,
                    credentials,
                    folder,
                    request_timeout.map(Duration::from_secs),
                )?;

                Ok(Arc::new(backend))
            },
        }
    }
}

fn from_env_or(value: &Option<String>, var: &str) -> anyhow::Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("missing remote storage credential, set it in the config or via {}", var)),
    }
}

fn default_public_prefix() -> String {
    "/uploads".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

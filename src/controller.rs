use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing_futures::Instrument;

use crate::pipeline::IngestPipeline;

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_throttle")]
    /// Milliseconds waited between two imported entries.
    ///
    /// Defaults to `200`.
    pub throttle_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle(),
        }
    }
}

const fn default_throttle() -> u64 {
    200
}

/// A single roster row to import.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportEntry {
    pub name: String,

    #[serde(default)]
    /// A sharing link to the member's picture.
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportOutcome {
    pub name: String,

    /// The stored image URL, empty when no image could be ingested.
    pub image: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<ImportOutcome>,
    pub skipped: usize,
    pub count: usize,
}

/// The surface the roster layer talks to.
pub struct ImageController {
    pipeline: IngestPipeline,
    throttle: Duration,
}

impl ImageController {
    pub fn new(pipeline: IngestPipeline, cfg: &ImportConfig) -> Self {
        Self {
            pipeline,
            throttle: Duration::from_millis(cfg.throttle_ms),
        }
    }

    #[inline]
    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub async fn ingest(&self, reference: Option<&str>, name: &str) -> String {
        self.pipeline.ingest(reference, name).await
    }

    pub async fn upload(&self, data: Bytes, name: &str) -> String {
        self.pipeline.ingest_upload(data, name).await
    }

    /// Best-effort removal of a record's image, never fails the record
    /// deletion itself.
    pub async fn remove_image(&self, access_url: &str) {
        self.pipeline.delete(access_url).await
    }

    pub async fn purge(&self) -> usize {
        self.pipeline.purge().await
    }

    /// Imports roster rows one at a time, pausing between entries so the
    /// file host is not hammered.
    pub async fn import(&self, entries: Vec<ImportEntry>) -> ImportReport {
        let count = entries.len();
        let mut report = ImportReport {
            count,
            ..ImportReport::default()
        };

        for (index, entry) in entries.into_iter().enumerate() {
            let name = entry.name.trim();
            info!("[{}/{}] Importing: {}", index + 1, count, name);

            if name.is_empty() {
                warn!("Skipping row with missing name at index {}", index);
                report.skipped += 1;
                continue;
            }

            let reference = entry.image.as_deref().map(str::trim);
            let image = self
                .pipeline
                .ingest(reference, name)
                .instrument(info_span!("import", index, name))
                .await;

            report.imported.push(ImportOutcome {
                name: name.to_string(),
                image,
            });

            if index + 1 < count && !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }

        report
    }
}

/// Parses an import manifest, a YAML list of `{ name, image }` rows.
pub fn parse_manifest(data: &str) -> anyhow::Result<Vec<ImportEntry>> {
    Ok(serde_yaml::from_str(data)?)
}

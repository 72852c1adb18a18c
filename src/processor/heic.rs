use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use tokio::process::Command;

/// Converts HEIC images to JPEG through an external `heif-convert` style
/// tool, invoked as `<program> -q <quality> <input> <output>`.
#[derive(Debug, Clone)]
pub struct HeicConverter {
    program: PathBuf,
    timeout: Duration,
}

impl HeicConverter {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    /// Converts at maximum JPEG quality.
    pub async fn to_jpeg(&self, data: &[u8]) -> anyhow::Result<Bytes> {
        let workspace = tempfile::tempdir().context("failed to create conversion workspace")?;
        let input = workspace.path().join("input.heic");
        let output = workspace.path().join("output.jpg");

        tokio::fs::write(&input, data).await?;

        debug!("Running {:?} on {} bytes", &self.program, data.len());
        let child = Command::new(&self.program)
            .arg("-q")
            .arg("100")
            .arg(&input)
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", &self.program))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("{:?} timed out after {:?}", &self.program, self.timeout))??;

        if !result.status.success() {
            return Err(anyhow!(
                "{:?} exited with status {}: {}",
                &self.program,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim(),
            ));
        }

        let converted = tokio::fs::read(&output)
            .await
            .with_context(|| format!("{:?} produced no output", &self.program))?;

        Ok(Bytes::from(converted))
    }
}

/// Checks the ISO-BMFF `ftyp` brand for the HEIF family.
pub fn looks_like_heic(data: &[u8]) -> bool {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return false;
    }

    matches!(
        &data[8..12],
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" | b"mif1" | b"msf1"
    )
}

mod config;
mod controller;
mod fetch;
mod key;
mod pipeline;
mod processor;
mod resolver;
mod storage;

#[cfg(test)]
mod tests;

#[macro_use]
extern crate tracing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

use crate::config::{BackendKind, RuntimeConfig};
use crate::controller::{parse_manifest, ImageController};
use crate::fetch::Fetcher;
use crate::pipeline::IngestPipeline;
use crate::processor::ImageTranscoder;
use crate::resolver::{ReferenceResolver, Resolution};

pub use crate::storage::template::StorageBackend;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[clap(name = "teamshot", version, about = "Image ingestion for the team roster.")]
pub struct Args {
    #[clap(short, long, env = "TEAMSHOT_CONFIG", default_value = "config.yaml")]
    /// The file path to a given YAML config file.
    pub config: PathBuf,

    #[clap(long, env = "RUST_LOG", default_value = "teamshot=info")]
    /// The log filter directives.
    pub log_level: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Writes an example config file for the given backend.
    Init {
        #[clap(short, long, default_value = "filesystem")]
        backend: BackendKind,

        #[clap(short, long, default_value = "config.yaml")]
        out: PathBuf,
    },

    #[clap(flatten)]
    Run(Action),
}

/// Commands that run against a configured backend.
#[derive(Debug, Subcommand)]
pub enum Action {
    /// Fetches the image behind a sharing link and stores it.
    Ingest {
        #[clap(short, long)]
        reference: String,

        #[clap(short, long)]
        name: String,
    },

    /// Stores a local image file.
    Upload {
        #[clap(short, long)]
        file: PathBuf,

        /// Defaults to the file name.
        #[clap(short, long)]
        name: Option<String>,
    },

    /// Removes the image behind a previously returned URL.
    Delete {
        #[clap(short, long)]
        url: String,
    },

    /// Removes every stored image.
    Purge,

    /// Prints the URLs a sharing link resolves to.
    Resolve {
        #[clap(short, long)]
        reference: String,
    },

    /// Imports a YAML manifest of `{ name, image }` rows.
    Import {
        #[clap(short, long)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)?)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Init { backend, out } => run_init(backend, &out).await,
        Command::Run(action) => run_action(action, &args.config).await,
    }
}

async fn run_action(action: Action, config: &Path) -> Result<()> {
    let cfg = RuntimeConfig::from_file(config).await?;
    let controller = build_controller(&cfg).await?;

    match action {
        Action::Ingest { reference, name } => {
            println!("{}", controller.ingest(Some(&reference), &name).await);
        },
        Action::Upload { file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| anyhow!("cannot derive a name from {:?}", &file))?,
            };
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {:?}", &file))?;

            println!("{}", controller.upload(Bytes::from(data), &name).await);
        },
        Action::Delete { url } => {
            controller.remove_image(&url).await;
        },
        Action::Purge => {
            println!("{}", controller.purge().await);
        },
        Action::Resolve { reference } => {
            let resolver = controller.pipeline().resolver();
            let download = match resolver.resolve(Some(&reference)) {
                Resolution::Direct { url, .. } => Some(url),
                Resolution::NotAReference => None,
            };

            let resolved = serde_json::json!({
                "download": download,
                "view": resolver.view_url(&reference),
                "sheet_export": resolver.sheet_export_url(&reference),
            });
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        },
        Action::Import { manifest } => {
            let data = tokio::fs::read_to_string(&manifest)
                .await
                .with_context(|| format!("failed to read manifest {:?}", &manifest))?;
            let entries = parse_manifest(&data)?;

            let report = controller.import(entries).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
    }

    Ok(())
}

async fn run_init(backend: BackendKind, out: &Path) -> Result<()> {
    let example = config::template(backend);
    let out_data = serde_yaml::to_string(&example)?;
    tokio::fs::write(out, out_data).await?;

    info!("Wrote {} config template to {:?}", backend, out);
    Ok(())
}

async fn build_controller(cfg: &RuntimeConfig) -> Result<ImageController> {
    let storage: Arc<dyn StorageBackend> = cfg.backend.connect().await?;

    let pipeline = IngestPipeline::new(
        ReferenceResolver::new(&cfg.drive),
        Fetcher::new(&cfg.fetch)?,
        Arc::new(ImageTranscoder::new(&cfg.transcode)),
        storage,
        cfg.transcode.webp_quality,
    );

    Ok(ImageController::new(pipeline, &cfg.import))
}

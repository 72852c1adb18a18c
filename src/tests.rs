use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::controller::{ImageController, ImportConfig, ImportEntry};
use crate::fetch::{FetchConfig, Fetcher};
use crate::key::StorageKey;
use crate::pipeline::{IngestError, IngestPipeline};
use crate::processor::{ImageTranscoder, TranscodeConfig, Transcoder};
use crate::resolver::{DriveConfig, ReferenceResolver};
use crate::storage::backends::filesystem::FileSystemBackend;
use crate::StorageBackend;

const SHARE_LINK: &str = "https://drive.google.com/file/d/ABC123/view";

/// Tags its input instead of decoding anything, so tests can see which
/// bytes reached each stage.
#[derive(Default)]
struct StubTranscoder {
    fail_heic: bool,
    heic_calls: AtomicUsize,
    encoded: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl Transcoder for StubTranscoder {
    async fn heic_to_intermediate(&self, data: Bytes) -> anyhow::Result<Bytes> {
        self.heic_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_heic {
            return Err(anyhow!("heif-convert exited with status 1"));
        }
        Ok(Bytes::from([&b"jpeg:"[..], &data[..]].concat()))
    }

    async fn sharpen_and_encode_webp(&self, data: Bytes, quality: f32) -> anyhow::Result<Bytes> {
        assert_eq!(quality, 80.0);
        self.encoded.lock().unwrap().push(data.clone());
        if data.starts_with(b"corrupt") {
            return Err(anyhow!("failed to decode image"));
        }
        Ok(Bytes::from([&b"webp:"[..], &data[..]].concat()))
    }
}

/// Counts calls into the wrapped backend.
struct CountingStorage<S> {
    inner: S,
    stores: AtomicUsize,
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for CountingStorage<S> {
    async fn store(&self, key: &StorageKey, data: Bytes) -> anyhow::Result<String> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(key, data).await
    }

    async fn delete(&self, key: &StorageKey) -> anyhow::Result<bool> {
        self.inner.delete(key).await
    }

    async fn purge(&self) -> anyhow::Result<usize> {
        self.inner.purge().await
    }

    fn key_for_url(&self, access_url: &str) -> Option<StorageKey> {
        self.inner.key_for_url(access_url)
    }
}

/// A backend whose remote end is down.
struct UnavailableStorage;

#[async_trait]
impl StorageBackend for UnavailableStorage {
    async fn store(&self, _key: &StorageKey, _data: Bytes) -> anyhow::Result<String> {
        Err(anyhow!("connection reset by peer"))
    }

    async fn delete(&self, _key: &StorageKey) -> anyhow::Result<bool> {
        Err(anyhow!("connection reset by peer"))
    }

    async fn purge(&self) -> anyhow::Result<usize> {
        Err(anyhow!("connection reset by peer"))
    }

    fn key_for_url(&self, access_url: &str) -> Option<StorageKey> {
        access_url
            .strip_prefix("remote://")
            .and_then(StorageKey::from_file_name)
    }
}

struct Environment {
    pipeline: IngestPipeline,
    storage: Arc<CountingStorage<FileSystemBackend>>,
    dir: TempDir,
}

impl Environment {
    fn stored(&self, file_name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join(file_name)).ok()
    }

    fn stores(&self) -> usize {
        self.storage.stores.load(Ordering::SeqCst)
    }
}

fn build_pipeline(
    server: &MockServer,
    transcoder: Arc<dyn Transcoder>,
    storage: Arc<dyn StorageBackend>,
) -> anyhow::Result<IngestPipeline> {
    let drive = DriveConfig {
        host: server.uri(),
        ..DriveConfig::default()
    };

    Ok(IngestPipeline::new(
        ReferenceResolver::new(&drive),
        Fetcher::new(&FetchConfig::default())?,
        transcoder,
        storage,
        TranscodeConfig::default().webp_quality,
    ))
}

fn setup_environment(server: &MockServer, transcoder: Arc<dyn Transcoder>) -> anyhow::Result<Environment> {
    let dir = tempfile::tempdir()?;
    let storage = Arc::new(CountingStorage {
        inner: FileSystemBackend::new(dir.path().to_path_buf(), "/uploads"),
        stores: AtomicUsize::new(0),
    });

    let pipeline = build_pipeline(server, transcoder, storage.clone())?;
    Ok(Environment { pipeline, storage, dir })
}

async fn mount_image(server: &MockServer, id: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/uc"))
        .and(query_param("export", "download"))
        .and(query_param("id", id))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

fn sample_png() -> Vec<u8> {
    let img = image::RgbImage::from_fn(16, 16, |x, y| image::Rgb([(x * 16) as u8, (y * 16) as u8, 64]));
    let mut buff = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buff, image::ImageOutputFormat::Png)
        .unwrap();
    buff.into_inner()
}

#[tokio::test]
async fn test_drive_heic_end_to_end() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"heic-bytes").await;

    let transcoder = Arc::new(StubTranscoder::default());
    let env = setup_environment(&server, transcoder.clone())?;

    let url = env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe.heic").await;

    assert_eq!(url, "/uploads/Jane_Doe.webp");
    assert_eq!(transcoder.heic_calls.load(Ordering::SeqCst), 1);
    assert_eq!(env.stored("Jane_Doe.webp").as_deref(), Some(b"webp:jpeg:heic-bytes".as_ref()));
    Ok(())
}

#[tokio::test]
async fn test_not_a_reference_never_fetches() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    assert_eq!(env.pipeline.ingest(Some("not-a-drive-link"), "Jane Doe").await, "");
    assert_eq!(env.pipeline.ingest(Some(""), "Jane Doe").await, "");
    assert_eq!(env.pipeline.ingest(None, "Jane Doe").await, "");

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
    assert_eq!(env.stores(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_fetch_stores_nothing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/uc"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&server)
        .await;

    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    let result = env.pipeline.try_ingest(Some(SHARE_LINK), "Jane Doe.png").await;
    assert!(matches!(result, Err(IngestError::FetchStatus(status)) if status.as_u16() == 403));

    assert_eq!(env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe.png").await, "");
    assert_eq!(env.stores(), 0);
    Ok(())
}

#[tokio::test]
async fn test_heic_failure_falls_back_to_original_bytes() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"original").await;

    let transcoder = Arc::new(StubTranscoder {
        fail_heic: true,
        ..StubTranscoder::default()
    });
    let env = setup_environment(&server, transcoder.clone())?;

    let url = env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe.HEIC").await;

    assert_eq!(url, "/uploads/Jane_Doe.webp");
    assert_eq!(transcoder.heic_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transcoder.encoded.lock().unwrap().as_slice(), &[Bytes::from_static(b"original")]);
    assert_eq!(env.stored("Jane_Doe.webp").as_deref(), Some(b"webp:original".as_ref()));
    Ok(())
}

#[tokio::test]
async fn test_heic_detected_from_content() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"\0\0\0\x18ftypheic\0\0\0\0").await;

    let transcoder = Arc::new(StubTranscoder::default());
    let env = setup_environment(&server, transcoder.clone())?;

    let url = env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe").await;
    assert_eq!(url, "/uploads/Jane_Doe.webp");
    assert_eq!(transcoder.heic_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_non_heic_skips_conversion() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"png-bytes").await;

    let transcoder = Arc::new(StubTranscoder::default());
    let env = setup_environment(&server, transcoder.clone())?;

    let url = env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe.png").await;
    assert_eq!(url, "/uploads/Jane_Doe.webp");
    assert_eq!(transcoder.heic_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_encode_failure_is_terminal() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"corrupt-bytes").await;

    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    let result = env.pipeline.try_ingest(Some(SHARE_LINK), "Jane Doe.png").await;
    assert!(matches!(result, Err(IngestError::Encode(_))));
    assert_eq!(env.stores(), 0);
    assert!(env.stored("Jane_Doe.webp").is_none());
    Ok(())
}

#[tokio::test]
async fn test_store_failure_is_terminal() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"png-bytes").await;

    let pipeline = build_pipeline(
        &server,
        Arc::new(StubTranscoder::default()),
        Arc::new(UnavailableStorage),
    )?;

    let result = pipeline.try_ingest(Some(SHARE_LINK), "Jane Doe").await;
    assert!(matches!(result, Err(IngestError::Store(_))));
    assert_eq!(pipeline.ingest(Some(SHARE_LINK), "Jane Doe").await, "");

    // Cleanup failures are swallowed.
    pipeline.delete("remote://Jane_Doe.webp").await;
    assert_eq!(pipeline.purge().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_reingest_overwrites_same_key() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/uc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first".to_vec()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/uc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second".to_vec()))
        .mount(&server)
        .await;

    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    let first = env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe.png").await;
    let second = env.pipeline.ingest(Some(SHARE_LINK), "Jane  Doe.heic").await;

    assert_eq!(first, "/uploads/Jane_Doe.webp");
    assert_eq!(first, second);
    assert_eq!(env.stores(), 2);
    assert_eq!(env.stored("Jane_Doe.webp").as_deref(), Some(b"webp:jpeg:second".as_ref()));
    Ok(())
}

#[tokio::test]
async fn test_invalid_name_is_skipped_before_fetch() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    let result = env.pipeline.try_ingest(Some(SHARE_LINK), "   ").await;
    assert!(matches!(result, Err(IngestError::InvalidName(_))));

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_upload_and_limits() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    let url = env.pipeline.ingest_upload(Bytes::from_static(b"raw"), "John Roe.png").await;
    assert_eq!(url, "/uploads/John_Roe.webp");
    assert_eq!(env.stored("John_Roe.webp").as_deref(), Some(b"webp:raw".as_ref()));

    let oversized = Bytes::from(vec![0u8; FetchConfig::default().max_image_bytes + 1]);
    let result = env.pipeline.try_ingest_upload(oversized, "John Roe.png").await;
    assert!(matches!(result, Err(IngestError::TooLarge { .. })));
    assert_eq!(env.stores(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_side_channel() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;

    let url = env.pipeline.ingest_upload(Bytes::from_static(b"raw"), "Jane Doe").await;
    env.pipeline.ingest_upload(Bytes::from_static(b"raw"), "John Roe").await;

    // Foreign or malformed URLs are left alone.
    env.pipeline.delete("https://drive.google.com/uc?export=view&id=ABC123").await;
    env.pipeline.delete("").await;
    assert!(env.stored("Jane_Doe.webp").is_some());

    env.pipeline.delete(&url).await;
    assert!(env.stored("Jane_Doe.webp").is_none());

    // Deleting twice is harmless.
    env.pipeline.delete(&url).await;

    assert_eq!(env.pipeline.purge().await, 1);
    assert!(env.stored("John_Roe.webp").is_none());
    Ok(())
}

#[tokio::test]
async fn test_batch_import() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", b"png-bytes").await;

    let env = setup_environment(&server, Arc::new(StubTranscoder::default()))?;
    let controller = ImageController::new(env.pipeline, &ImportConfig { throttle_ms: 0 });

    let entries = vec![
        ImportEntry { name: "Jane Doe".to_string(), image: Some(format!(" {} ", SHARE_LINK)) },
        ImportEntry { name: "  ".to_string(), image: Some(SHARE_LINK.to_string()) },
        ImportEntry { name: "John Roe".to_string(), image: None },
        ImportEntry { name: "Bob Poe".to_string(), image: Some("not-a-drive-link".to_string()) },
    ];

    let report = controller.import(entries).await;

    assert_eq!(report.count, 4);
    assert_eq!(report.skipped, 1);

    let images: Vec<(&str, &str)> = report
        .imported
        .iter()
        .map(|o| (o.name.as_str(), o.image.as_str()))
        .collect();
    assert_eq!(
        images,
        vec![
            ("Jane Doe", "/uploads/Jane_Doe.webp"),
            ("John Roe", ""),
            ("Bob Poe", ""),
        ]
    );
    assert_eq!(env.storage.stores.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_real_transcoder_without_heic_tool() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_image(&server, "ABC123", &sample_png()).await;

    let transcoder = ImageTranscoder::new(&TranscodeConfig {
        heic_program: "/nonexistent/heif-convert".into(),
        ..TranscodeConfig::default()
    });
    let env = setup_environment(&server, Arc::new(transcoder))?;

    // The conversion tool is missing, the PNG bytes go straight to the encoder.
    let url = env.pipeline.ingest(Some(SHARE_LINK), "Jane Doe.heic").await;
    assert_eq!(url, "/uploads/Jane_Doe.webp");

    let stored = env.stored("Jane_Doe.webp").unwrap_or_default();
    assert_eq!(&stored[0..4], b"RIFF");
    assert_eq!(&stored[8..12], b"WEBP");
    Ok(())
}

#[test]
fn test_cli_routes_commands() -> anyhow::Result<()> {
    use clap::Parser;

    use crate::config::BackendKind;
    use crate::{Action, Args, Command};

    let args = Args::try_parse_from(["teamshot", "init", "--backend", "cloudinary"])?;
    assert!(matches!(args.command, Command::Init { backend: BackendKind::Cloudinary, .. }));

    let args = Args::try_parse_from(["teamshot", "ingest", "--reference", "https://drive.google.com/file/d/ABC/view", "--name", "Jane Doe"])?;
    assert!(matches!(args.command, Command::Run(Action::Ingest { ref name, .. }) if name == "Jane Doe"));

    let args = Args::try_parse_from(["teamshot", "purge"])?;
    assert!(matches!(args.command, Command::Run(Action::Purge)));
    Ok(())
}

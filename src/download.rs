//! Per-product download with token refresh and a size check.
use anyhow::Result;
use futures_util::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::client::DataStore;
use crate::config::Config;
use crate::error::DatastoreError;
use crate::token::{AccessToken, Clock, TokenManager};

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub id: String,
    pub url: Url,
    pub output: PathBuf,
}

impl DownloadTask {
    pub fn new(store: &DataStore, id: &str, output_dir: &Path) -> Result<Self, DatastoreError> {
        Ok(Self {
            id: id.to_string(),
            url: store.download_url(id)?,
            output: output_dir.join(local_file_name(id)?),
        })
    }
}

/// `<id>.zip`, provided it names one file directly inside the output directory.
fn local_file_name(id: &str) -> Result<String, DatastoreError> {
    let file_name = format!("{id}.zip");
    let mut components = Path::new(&file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(file_name),
        _ => Err(DatastoreError::UnsafeIdentifier { id: id.to_string() }),
    }
}

/// Lazily pairs each identifier with its download URL and local `<id>.zip` path.
pub fn tasks<'a>(
    store: &'a DataStore,
    ids: &'a [String],
    output_dir: &'a Path,
) -> impl Iterator<Item = Result<DownloadTask, DatastoreError>> + 'a {
    ids.iter()
        .map(move |id| DownloadTask::new(store, id, output_dir))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The local file already existed; nothing was requested.
    Skipped,
    Validated { bytes: u64 },
    /// Below the size threshold; the file has been removed.
    Rejected { bytes: u64 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub requested: usize,
    pub skipped: usize,
    pub downloaded: usize,
    pub rejected: usize,
}

impl DownloadSummary {
    fn record(self: &mut Self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Validated { .. } => self.downloaded += 1,
            ItemOutcome::Rejected { .. } => self.rejected += 1,
        }
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} files downloaded, {} already present, {} rejected",
            self.downloaded, self.requested, self.skipped, self.rejected
        )
    }
}

/// Deletes `path` when `size` is below `limit`.
pub async fn validate_size(path: &Path, size: u64, limit: u64) -> Result<ItemOutcome> {
    if size < limit {
        let err = DatastoreError::UndersizedFile {
            path: path.to_path_buf(),
            size,
            limit,
        };
        error!("{err}");
        fs::remove_file(path).await?;
        return Ok(ItemOutcome::Rejected { bytes: size });
    }
    Ok(ItemOutcome::Validated { bytes: size })
}

/// Writes the body in blocks of exactly `block_size` bytes; only the last one may be shorter.
async fn write_blocks<W, S, B, E>(writer: &mut W, chunks: S, block_size: usize) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    let block_size = block_size.max(1);
    futures_util::pin_mut!(chunks);
    let mut block: Vec<u8> = Vec::with_capacity(block_size);
    let mut byte_count = 0_u64;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let mut bytes = chunk.as_ref();
        byte_count += bytes.len() as u64;
        while !bytes.is_empty() {
            let take = (block_size - block.len()).min(bytes.len());
            block.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if block.len() == block_size {
                writer.write_all(&block).await?;
                block.clear();
            }
        }
    }
    if !block.is_empty() {
        writer.write_all(&block).await?;
    }
    Ok(byte_count)
}

/// Streams the product into `output`, returning the size on disk.
///
/// The file is flushed and closed whether or not the body arrives intact; a partial
/// file is removed before the error is returned.
#[instrument(skip_all, fields(url = %url))]
async fn fetch_to_file(
    store: &DataStore,
    url: &Url,
    token: &AccessToken,
    output: &Path,
    block_size: usize,
) -> Result<u64> {
    let response = store
        .http()
        .get(url.clone())
        .query(&token.query())
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        warn!(status = status.as_u16(), "Download endpoint returned an error status");
    }

    let mut file = File::create(output).await?;
    let streamed = write_blocks(&mut file, response.bytes_stream(), block_size).await;
    let flushed = file.shutdown().await;
    drop(file);

    let written = streamed.and_then(|bytes| {
        flushed?;
        Ok(bytes)
    });
    match written {
        Ok(bytes) => debug!(bytes, "Body written"),
        Err(e) => {
            debug!(path = %output.display(), "Removing partial file");
            if let Err(cleanup) = fs::remove_file(output).await {
                warn!(path = %output.display(), error = %cleanup, "Could not remove partial file");
            }
            return Err(e);
        }
    }

    Ok(fs::metadata(output).await?.len())
}

impl DownloadTask {
    pub async fn execute<C: Clock>(
        self: &Self,
        store: &DataStore,
        tokens: &mut TokenManager<C>,
        config: &Config,
    ) -> Result<ItemOutcome> {
        if self.output.exists() {
            info!(path = %self.output.display(), "File exists");
            return Ok(ItemOutcome::Skipped);
        }

        let token = tokens.fresh_token().await?;
        let size = fetch_to_file(store, &self.url, &token, &self.output, config.block_size).await?;
        validate_size(&self.output, size, config.file_check_limit).await
    }
}

fn item_progress(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Makes sure every identifier has a valid `<id>.zip` in `output_dir`.
///
/// Undersized files are removed and counted, and the batch carries on. Network and
/// token failures abort the run.
pub async fn download_files<C: Clock>(
    store: &DataStore,
    ids: &[String],
    output_dir: &Path,
    tokens: &mut TokenManager<C>,
    config: &Config,
) -> Result<DownloadSummary> {
    fs::create_dir_all(output_dir).await?;
    tokens.acquire().await?;

    let bar = item_progress(ids.len(), config.progress);
    let mut summary = DownloadSummary {
        requested: ids.len(),
        ..DownloadSummary::default()
    };

    for (index, task) in tasks(store, ids, output_dir).enumerate() {
        let task = task?;
        debug!("Downloading file {} of {}", index + 1, ids.len());
        bar.set_message(task.id.clone());
        let outcome = task.execute(store, tokens, config).await?;
        summary.record(outcome);
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tests::{mock_store, mount_token, ManualClock};
    use crate::token::AccessKey;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Moves forward by `step` every time it is read.
    #[derive(Clone)]
    struct SteppingClock {
        now: Arc<Mutex<Instant>>,
        step: Duration,
    }

    impl SteppingClock {
        fn new(step: Duration) -> Self {
            Self {
                now: Arc::new(Mutex::new(Instant::now())),
                step,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(self: &Self) -> Instant {
            let mut now = self.now.lock().unwrap();
            *now += self.step;
            *now
        }
    }

    fn test_config() -> Config {
        Config {
            progress: false,
            ..Config::default()
        }
    }

    async fn mount_product(server: &MockServer, id: &str, size: usize, expected: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/data/download/products/{id}")))
            .and(query_param("access_token", "tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; size]))
            .expect(expected)
            .mount(server)
            .await;
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    /// Records the length of every write it receives.
    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<usize>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.push(buf.len());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= end + 4 + body_len {
                break;
            }
        }
        String::from_utf8_lossy(&request).into_owned()
    }

    /// Answers token requests normally but closes download connections after
    /// 4096 of the 500000 announced body bytes.
    async fn serve_truncated_downloads(listener: TcpListener) {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let response = if request.starts_with("POST") {
                    let body = r#"{"access_token": "tok-123"}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    )
                    .into_bytes()
                } else {
                    let mut response =
                        b"HTTP/1.1 200 OK\r\nContent-Length: 500000\r\nConnection: close\r\n\r\n".to_vec();
                    response.extend(vec![7_u8; 4096]);
                    response
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    }

    #[test]
    fn test_tasks_pair_urls_and_paths() {
        let config = Config::default();
        let store = DataStore::new(&config).unwrap();
        let ids = ids(&["PRODUCT-1", "PRODUCT 2"]);
        let out = Path::new("/data/out");

        let tasks: Vec<DownloadTask> = tasks(&store, &ids, out).map(|t| t.unwrap()).collect();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].output, PathBuf::from("/data/out/PRODUCT-1.zip"));
        assert_eq!(
            tasks[1].url.as_str(),
            "http://api.eumetsat.int/data/download/products/PRODUCT%202"
        );
        assert_eq!(tasks[1].output, PathBuf::from("/data/out/PRODUCT 2.zip"));
    }

    #[test]
    fn test_identifiers_outside_output_dir_are_rejected() {
        let store = DataStore::new(&Config::default()).unwrap();
        let out = Path::new("/data/out");

        for id in ["/tmp/evil", "../../etc/evil", "a/b", "nested/../../x"] {
            let err = DownloadTask::new(&store, id, out).unwrap_err();
            assert!(
                matches!(&err, DatastoreError::UnsafeIdentifier { id: rejected } if rejected == id),
                "{id} gave {err:?}"
            );
        }

        let task = DownloadTask::new(&store, "W_XX-EUMETSAT..nc", out).unwrap();
        assert_eq!(task.output, PathBuf::from("/data/out/W_XX-EUMETSAT..nc.zip"));
    }

    #[tokio::test]
    async fn test_body_written_in_whole_blocks() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(vec![1_u8; 700]),
            Ok(vec![2_u8; 700]),
            Ok(vec![3_u8; 1100]),
        ]);
        let mut writer = RecordingWriter::default();

        let bytes = write_blocks(&mut writer, chunks, 1024).await.unwrap();
        assert_eq!(bytes, 2500);
        assert_eq!(writer.writes, vec![1024, 1024, 452]);
    }

    #[tokio::test]
    async fn test_zero_block_size_still_writes() {
        let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(vec![1_u8; 3])]);
        let mut writer = RecordingWriter::default();

        write_blocks(&mut writer, chunks, 0).await.unwrap();
        assert_eq!(writer.writes, vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_truncated_body_removes_partial_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_truncated_downloads(listener));
        let dir = TempDir::new().unwrap();
        let config = Config {
            api_endpoint: format!("http://{addr}"),
            file_check_limit: 1,
            ..test_config()
        };

        let store = DataStore::new(&config).unwrap();
        let mut tokens = TokenManager::new(
            store.clone(),
            AccessKey::new("secret-key"),
            config.token_lifetime(),
        );
        let result = download_files(&store, &ids(&["CUT"]), dir.path(), &mut tokens, &config).await;

        assert!(result.is_err());
        assert!(!dir.path().join("CUT.zip").exists());
        assert_eq!(tokens.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_validate_size_removes_small_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.zip");
        std::fs::write(&path, b"Unauthorized").unwrap();

        let outcome = validate_size(&path, 12, 100_000).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Rejected { bytes: 12 });
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_validate_size_keeps_large_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.zip");
        std::fs::write(&path, vec![0_u8; 2048]).unwrap();

        let outcome = validate_size(&path, 2048, 1024).await.unwrap();
        assert_eq!(outcome, ItemOutcome::Validated { bytes: 2048 });
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped_without_request() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        mount_product(&server, "PRODUCT-1", 200_000, 0).await;
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("PRODUCT-1.zip"), b"x").unwrap();

        let store = mock_store(&server);
        let mut tokens = TokenManager::new(
            store.clone(),
            AccessKey::new("secret-key"),
            Duration::from_secs(20 * 60),
        );
        let summary = download_files(&store, &ids(&["PRODUCT-1"]), dir.path(), &mut tokens, &test_config())
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.downloaded, 0);
        assert_eq!(std::fs::read(dir.path().join("PRODUCT-1.zip")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_undersized_download_is_removed_and_batch_continues() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        mount_product(&server, "TINY", 500, 1).await;
        mount_product(&server, "FULL", 150_000, 1).await;
        let dir = TempDir::new().unwrap();

        let store = mock_store(&server);
        let mut tokens = TokenManager::new(
            store.clone(),
            AccessKey::new("secret-key"),
            Duration::from_secs(20 * 60),
        );
        let summary = download_files(&store, &ids(&["TINY", "FULL"]), dir.path(), &mut tokens, &test_config())
            .await
            .unwrap();

        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.downloaded, 1);
        assert!(!dir.path().join("TINY.zip").exists());
        let full = std::fs::metadata(dir.path().join("FULL.zip")).unwrap();
        assert_eq!(full.len(), 150_000);
    }

    #[tokio::test]
    async fn test_error_status_body_is_rejected_by_size() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/data/download/products/DENIED"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        let store = mock_store(&server);
        let mut tokens = TokenManager::new(
            store.clone(),
            AccessKey::new("secret-key"),
            Duration::from_secs(20 * 60),
        );
        let summary = download_files(&store, &ids(&["DENIED"]), dir.path(), &mut tokens, &test_config())
            .await
            .unwrap();

        assert_eq!(summary.rejected, 1);
        assert!(!dir.path().join("DENIED.zip").exists());
    }

    #[tokio::test]
    async fn test_token_reused_between_quick_downloads() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        mount_product(&server, "A", 1024, 1).await;
        mount_product(&server, "B", 1024, 1).await;
        let dir = TempDir::new().unwrap();
        let config = Config {
            file_check_limit: 1,
            ..test_config()
        };

        let store = mock_store(&server);
        let mut tokens = TokenManager::with_clock(
            store.clone(),
            AccessKey::new("secret-key"),
            config.token_lifetime(),
            SteppingClock::new(Duration::from_secs(60)),
        );
        download_files(&store, &ids(&["A", "B"]), dir.path(), &mut tokens, &config)
            .await
            .unwrap();

        assert_eq!(tokens.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_token_refreshed_when_window_passes_between_downloads() {
        let server = MockServer::start().await;
        mount_token(&server, 3).await;
        mount_product(&server, "A", 1024, 1).await;
        mount_product(&server, "B", 1024, 1).await;
        let dir = TempDir::new().unwrap();
        let config = Config {
            file_check_limit: 1,
            ..test_config()
        };

        let store = mock_store(&server);
        let mut tokens = TokenManager::with_clock(
            store.clone(),
            AccessKey::new("secret-key"),
            config.token_lifetime(),
            SteppingClock::new(Duration::from_secs(21 * 60)),
        );
        download_files(&store, &ids(&["A", "B"]), dir.path(), &mut tokens, &config)
            .await
            .unwrap();

        // One initial exchange plus one per download.
        assert_eq!(tokens.exchanges(), 3);
    }

    #[tokio::test]
    async fn test_manual_refresh_between_two_downloads() {
        let server = MockServer::start().await;
        mount_token(&server, 2).await;
        mount_product(&server, "A", 1024, 1).await;
        mount_product(&server, "B", 1024, 1).await;
        let dir = TempDir::new().unwrap();
        let config = Config {
            file_check_limit: 1,
            ..test_config()
        };

        let store = mock_store(&server);
        let clock = ManualClock::new();
        let mut tokens = TokenManager::with_clock(
            store.clone(),
            AccessKey::new("secret-key"),
            config.token_lifetime(),
            clock.clone(),
        );
        tokens.acquire().await.unwrap();

        let first = DownloadTask::new(&store, "A", dir.path()).unwrap();
        first.execute(&store, &mut tokens, &config).await.unwrap();
        clock.advance(Duration::from_secs(25 * 60));
        let second = DownloadTask::new(&store, "B", dir.path()).unwrap();
        second.execute(&store, &mut tokens, &config).await.unwrap();

        assert_eq!(tokens.exchanges(), 2);
    }

    #[test]
    fn test_summary_display() {
        let summary = DownloadSummary {
            requested: 4,
            skipped: 1,
            downloaded: 2,
            rejected: 1,
        };
        assert_eq!(
            summary.to_string(),
            "2 of 4 files downloaded, 1 already present, 1 rejected"
        );
    }
}

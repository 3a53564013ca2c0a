//! One-shot, resumable job downloads.
//!
//! A download runs on its own task. It always requests `Range: bytes=N-`
//! where N is the number of bytes confirmed so far, so a dropped
//! connection resumes where it left off. A response carrying a
//! `Content-Encoding` can't be resumed by offset, so from then on every
//! retry starts over from zero.

use std::{
    io::{Read as _, Write as _},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use cloudapi::{codes, ErrorSink, Severity};
use futures::StreamExt;
use reqwest::{
    header::{CONTENT_ENCODING, CONTENT_RANGE, RANGE},
    StatusCode,
};
use tokio::{io::AsyncWriteExt, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{JobPayload, TemporaryFile};

/// Largest payload unpacked from a zip archive.
const MAX_EXTRACTED_SIZE: u64 = 1 << 30;

/// Where downloaded bytes are kept.
#[derive(Clone, Debug)]
pub enum Destination {
    /// In memory.
    Memory,
    /// In a temporary file inside this directory.
    Disk(PathBuf),
}

/// Reasons a download gives up.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Ran out of retries.
    #[error("download failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        last: String,
    },

    /// The server answered with a status that retrying won't fix.
    #[error("download failed with status {0}")]
    BadStatus(StatusCode),

    /// Writing or unpacking the payload failed.
    #[error("can not store download: {0}")]
    Store(String),

    /// More bytes arrived than the server announced.
    #[error("received {received} bytes of a {total} byte download")]
    Corrupted {
        /// Bytes received.
        received: u64,
        /// Bytes announced.
        total: u64,
    },
}

impl DownloadError {
    /// Error code reported for this failure.
    pub fn code(&self) -> u32 {
        match self {
            DownloadError::Exhausted { .. } => codes::DOWNLOAD_FAILED,
            DownloadError::BadStatus(_) => codes::DOWNLOAD_BAD_STATUS,
            DownloadError::Store(_) => codes::DOWNLOAD_STORE_FAILED,
            DownloadError::Corrupted { .. } => codes::DOWNLOAD_CORRUPTED,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Store(e.to_string())
    }
}

/// Byte counters of a running download.
#[derive(Debug, Default)]
pub struct Progress {
    requested: AtomicU64,
    received: AtomicU64,
    written: AtomicU64,
    percent: AtomicU8,
}

impl Progress {
    /// Total size announced by the server, 0 if unknown.
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    /// Bytes confirmed received.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Bytes written to the destination.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Progress, 0 to 100. Never decreases, even when a download restarts.
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }

    fn record(&self, received: u64) {
        self.received.store(received, Ordering::Relaxed);
        self.written.store(received, Ordering::Relaxed);
        let requested = self.requested();
        if requested > 0 {
            let percent = (received.min(requested) * 100 / requested) as u8;
            self.percent.fetch_max(percent, Ordering::Relaxed);
        }
    }
}

/// Handle to a running download. Dropping it cancels the download.
pub struct DownloadJob {
    progress: Arc<Progress>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DownloadJob {
    /// Whether the download task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Byte counters.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Request cancellation. The partial destination is discarded and the
    /// cancel hook runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DownloadJob {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts downloads. Cheap to clone.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    retries: u32,
    retry_pause: Duration,
    sink: Arc<dyn ErrorSink>,
}

impl Downloader {
    /// A downloader reporting failures to `sink`, giving up after
    /// `retries` failed attempts.
    pub fn new(sink: Arc<dyn ErrorSink>, retries: u32) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(6))
            .build()
            .unwrap_or_default();
        Self {
            client,
            retries,
            retry_pause: Duration::from_secs(1),
            sink,
        }
    }

    /// Pause between attempts.
    pub fn with_retry_pause(mut self, retry_pause: Duration) -> Self {
        self.retry_pause = retry_pause;
        self
    }

    /// Start downloading `url`. `on_done` gets the payload, unpacked from
    /// its zip archive when `unzip` is set. `on_cancel` runs if the job is
    /// cancelled. Failures are reported to the sink and run neither.
    pub fn start<D, C>(&self, url: &str, destination: Destination, unzip: bool, on_done: D, on_cancel: C) -> DownloadJob
    where
        D: FnOnce(JobPayload) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let progress = Arc::new(Progress::default());
        let cancel = CancellationToken::new();
        let fetch = Fetch {
            client: self.client.clone(),
            url: url.to_owned(),
            retries: self.retries,
            retry_pause: self.retry_pause,
            progress: progress.clone(),
            cancel: cancel.clone(),
        };
        let sink = self.sink.clone();

        let task = tokio::spawn(async move {
            tracing::info!(url = fetch.url, "starting download");
            match fetch.run(destination, unzip).await {
                Ok(Some(payload)) => {
                    tracing::info!(url = fetch.url, bytes = fetch.progress.received(), "download finished");
                    on_done(payload);
                }
                Ok(None) => {
                    tracing::info!(url = fetch.url, "download cancelled");
                    on_cancel();
                }
                Err(e) => {
                    tracing::warn!(url = fetch.url, error = e.to_string(), "download failed");
                    sink.report(e.code(), e.to_string(), Severity::Info);
                }
            }
        });

        DownloadJob { progress, cancel, task }
    }
}

enum Buffer {
    Memory(BytesMut),
    Disk(TemporaryFile),
}

impl Buffer {
    async fn new(destination: &Destination) -> Result<Self, DownloadError> {
        match destination {
            Destination::Memory => Ok(Buffer::Memory(BytesMut::new())),
            Destination::Disk(dir) => Ok(Buffer::Disk(
                TemporaryFile::create(dir)
                    .await
                    .map_err(|e| DownloadError::Store(e.to_string()))?,
            )),
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        match self {
            Buffer::Memory(bytes) => bytes.extend_from_slice(chunk),
            Buffer::Disk(file) => file.as_mut().write_all(chunk).await?,
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), DownloadError> {
        match self {
            Buffer::Memory(bytes) => bytes.clear(),
            Buffer::Disk(file) => file.reset().await.map_err(|e| DownloadError::Store(e.to_string()))?,
        }
        Ok(())
    }

    async fn finish(self, unzip: bool) -> Result<JobPayload, DownloadError> {
        match (self, unzip) {
            (Buffer::Memory(bytes), false) => Ok(JobPayload::Inline(bytes.freeze())),
            (Buffer::Disk(mut file), false) => {
                file.as_mut().flush().await?;
                Ok(JobPayload::File(file))
            }
            (Buffer::Memory(bytes), true) => {
                let bytes = bytes.freeze();
                let extracted =
                    tokio::task::spawn_blocking(move || extract_first(std::io::Cursor::new(bytes), MAX_EXTRACTED_SIZE))
                        .await
                        .map_err(|e| DownloadError::Store(e.to_string()))??;
                Ok(JobPayload::Inline(Bytes::from(extracted)))
            }
            (Buffer::Disk(mut archive), true) => {
                archive.as_mut().flush().await?;
                let dir = archive.path().parent().map(|p| p.to_owned()).unwrap_or_default();
                let target = TemporaryFile::create(&dir)
                    .await
                    .map_err(|e| DownloadError::Store(e.to_string()))?;
                let archive_path = archive.path().to_owned();
                let target_path = target.path().to_owned();
                tokio::task::spawn_blocking(move || -> Result<(), DownloadError> {
                    let extracted = extract_first(std::fs::File::open(archive_path)?, MAX_EXTRACTED_SIZE)?;
                    let mut out = std::fs::OpenOptions::new().write(true).open(target_path)?;
                    out.write_all(&extracted)?;
                    out.flush()?;
                    Ok(())
                })
                .await
                .map_err(|e| DownloadError::Store(e.to_string()))??;
                Ok(JobPayload::File(target))
            }
        }
    }
}

/// Contents of the first entry of a zip archive, refusing entries that
/// unpack to more than `limit` bytes.
fn extract_first<R: std::io::Read + std::io::Seek>(reader: R, limit: u64) -> Result<Vec<u8>, DownloadError> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| DownloadError::Store(e.to_string()))?;
    let entry = archive.by_index(0).map_err(|e| DownloadError::Store(e.to_string()))?;
    let mut contents = Vec::new();
    entry.take(limit + 1).read_to_end(&mut contents)?;
    if contents.len() as u64 > limit {
        return Err(DownloadError::Store(format!("archive entry unpacks to more than {} bytes", limit)));
    }
    Ok(contents)
}

enum Step {
    Retry(String),
    Fatal(DownloadError),
}

impl From<DownloadError> for Step {
    fn from(e: DownloadError) -> Self {
        Step::Fatal(e)
    }
}

enum Attempt {
    Done,
    Cancelled,
}

struct Fetch {
    client: reqwest::Client,
    url: String,
    retries: u32,
    retry_pause: Duration,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

struct Cursor {
    offset: u64,
    restart_only: bool,
}

impl Fetch {
    /// `Ok(None)` means the download was cancelled.
    async fn run(&self, destination: Destination, unzip: bool) -> Result<Option<JobPayload>, DownloadError> {
        let mut buffer = Buffer::new(&destination).await?;
        let mut cursor = Cursor {
            offset: 0,
            restart_only: false,
        };
        let mut failures = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            match self.attempt(&mut buffer, &mut cursor).await {
                Ok(Attempt::Done) => break,
                Ok(Attempt::Cancelled) => return Ok(None),
                Err(Step::Fatal(e)) => return Err(e),
                Err(Step::Retry(reason)) => {
                    failures += 1;
                    if failures > self.retries {
                        return Err(DownloadError::Exhausted {
                            attempts: failures,
                            last: reason,
                        });
                    }
                    if cursor.restart_only && cursor.offset > 0 {
                        buffer.reset().await?;
                        cursor.offset = 0;
                    }
                    tracing::warn!(
                        url = self.url,
                        offset = cursor.offset,
                        attempt = failures,
                        reason = reason,
                        "download interrupted, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.retry_pause) => {}
                    }
                }
            }
        }

        buffer.finish(unzip).await.map(Some)
    }

    async fn attempt(&self, buffer: &mut Buffer, cursor: &mut Cursor) -> Result<Attempt, Step> {
        let request = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-", cursor.offset));
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Attempt::Cancelled),
            r = request.send() => r.map_err(|e| Step::Retry(e.to_string()))?,
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(Step::Retry(format!("server answered {}", status)));
        }
        if !status.is_success() {
            return Err(Step::Fatal(DownloadError::BadStatus(status)));
        }

        if response
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|v| v.as_bytes() != b"identity")
        {
            cursor.restart_only = true;
        }

        let total = if status == StatusCode::PARTIAL_CONTENT {
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match range {
                Some((start, total)) if start == cursor.offset && (start == 0 || !cursor.restart_only) => total,
                _ => {
                    buffer.reset().await?;
                    cursor.offset = 0;
                    return Err(Step::Retry("partial response does not continue the download".to_owned()));
                }
            }
        } else {
            if cursor.offset > 0 {
                tracing::debug!(url = self.url, "server ignored range, restarting download");
                buffer.reset().await?;
                cursor.offset = 0;
            }
            response.content_length()
        };
        if let Some(total) = total {
            self.progress.requested.store(total, Ordering::Relaxed);
        }

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Attempt::Cancelled),
                c = stream.next() => c,
            };
            let chunk = match next {
                None => break,
                Some(Err(e)) => return Err(Step::Retry(e.to_string())),
                Some(Ok(chunk)) => chunk,
            };

            let received = cursor.offset + chunk.len() as u64;
            if let Some(total) = total {
                if received > total {
                    return Err(Step::Fatal(DownloadError::Corrupted { received, total }));
                }
            }
            buffer.write(&chunk).await?;
            cursor.offset = received;
            self.progress.record(received);
        }

        match total {
            Some(total) if cursor.offset < total => Err(Step::Retry(format!(
                "connection closed after {} of {} bytes",
                cursor.offset, total
            ))),
            _ => Ok(Attempt::Done),
        }
    }
}

/// Parse `bytes START-END/TOTAL`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let (start, _) = range.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, total))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        body::Body,
        extract::State,
        http::{header, HeaderMap, Response, StatusCode as AxumStatus},
        routing::get,
        Router,
    };
    use pretty_assertions::assert_eq;
    use testresult::TestResult;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<u32>>);

    impl ErrorSink for RecordingSink {
        fn report(&self, code: u32, _message: String, _severity: Severity) {
            self.0.lock().unwrap().push(code);
        }
    }

    enum Outcome {
        Done(JobPayload),
        Cancelled,
    }

    #[derive(Clone)]
    struct Mock {
        body: Bytes,
        ranges: Arc<Mutex<Vec<String>>>,
        /// Drop the connection after this many bytes on the first request.
        cut_at: usize,
        compressed: bool,
    }

    fn body(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    /// Stream `first`, then fail the connection after a short pause.
    fn cut_stream(first: Bytes) -> Body {
        let stream = futures::stream::unfold(0, move |state| {
            let first = first.clone();
            async move {
                match state {
                    0 => Some((Ok(first), 1)),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Some((Err(std::io::Error::other("connection dropped")), 2))
                    }
                    _ => None,
                }
            }
        });
        Body::from_stream(stream)
    }

    async fn serve_file(State(mock): State<Mock>, headers: HeaderMap) -> Response<Body> {
        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let first = {
            let mut ranges = mock.ranges.lock().unwrap();
            ranges.push(range.clone());
            ranges.len() == 1
        };
        let total = mock.body.len();
        let start: usize = range
            .strip_prefix("bytes=")
            .and_then(|r| r.trim_end_matches('-').parse().ok())
            .unwrap_or(0);

        let mut response = Response::builder();
        if mock.compressed {
            response = response.header(CONTENT_ENCODING, "gzip");
        }

        if first {
            return response
                .status(AxumStatus::OK)
                .header(header::CONTENT_LENGTH, total)
                .body(cut_stream(mock.body.slice(..mock.cut_at)))
                .unwrap();
        }

        if start == 0 {
            return response.status(AxumStatus::OK).body(Body::from(mock.body.clone())).unwrap();
        }
        response
            .status(AxumStatus::PARTIAL_CONTENT)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, total - 1, total))
            .body(Body::from(mock.body.slice(start..)))
            .unwrap()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}/job.gcode", addr)
    }

    fn downloader(sink: Arc<RecordingSink>) -> Downloader {
        Downloader::new(sink, 3).with_retry_pause(Duration::from_millis(10))
    }

    fn start(
        downloader: &Downloader,
        url: &str,
        destination: Destination,
        unzip: bool,
    ) -> (DownloadJob, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = tx.clone();
        let job = downloader.start(
            url,
            destination,
            unzip,
            move |payload| {
                let _ = tx.send(Outcome::Done(payload));
            },
            move || {
                let _ = cancelled.send(Outcome::Cancelled);
            },
        );
        (job, rx)
    }

    async fn wait(job: &DownloadJob) {
        for _ in 0..500 {
            if !job.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download did not finish");
    }

    #[tokio::test]
    async fn test_resume_requests_remaining_range() -> TestResult {
        let mock = Mock {
            body: body(1000),
            ranges: Arc::default(),
            cut_at: 400,
            compressed: false,
        };
        let url = serve(Router::new().route("/job.gcode", get(serve_file)).with_state(mock.clone())).await;
        let sink = Arc::new(RecordingSink::default());
        let (job, mut rx) = start(&downloader(sink.clone()), &url, Destination::Memory, false);

        let Some(Outcome::Done(payload)) = rx.recv().await else {
            panic!("download did not complete");
        };
        assert_eq!(payload.into_bytes().await?, mock.body);
        assert_eq!(*mock.ranges.lock().unwrap(), vec!["bytes=0-", "bytes=400-"]);
        assert_eq!(job.progress().percent(), 100);
        assert!(sink.0.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_compressed_download_restarts_from_zero() -> TestResult {
        let mock = Mock {
            body: body(1000),
            ranges: Arc::default(),
            cut_at: 400,
            compressed: true,
        };
        let url = serve(Router::new().route("/job.gcode", get(serve_file)).with_state(mock.clone())).await;
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(RecordingSink::default());
        let (_job, mut rx) = start(
            &downloader(sink.clone()),
            &url,
            Destination::Disk(dir.path().to_owned()),
            false,
        );

        let Some(Outcome::Done(payload)) = rx.recv().await else {
            panic!("download did not complete");
        };
        assert!(matches!(payload, JobPayload::File(_)));
        assert_eq!(payload.into_bytes().await?, mock.body);
        assert_eq!(*mock.ranges.lock().unwrap(), vec!["bytes=0-", "bytes=0-"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_more_bytes_than_announced_is_corruption() {
        async fn oversized() -> Response<Body> {
            Response::builder()
                .status(AxumStatus::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, "bytes 0-9/10")
                .body(Body::from(vec![7u8; 20]))
                .unwrap()
        }
        let url = serve(Router::new().route("/job.gcode", get(oversized))).await;
        let sink = Arc::new(RecordingSink::default());
        let (job, mut rx) = start(&downloader(sink.clone()), &url, Destination::Memory, false);

        wait(&job).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(*sink.0.lock().unwrap(), vec![codes::DOWNLOAD_CORRUPTED]);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let router = Router::new().route("/job.gcode", get(|| async { AxumStatus::NOT_FOUND }));
        let url = serve(router).await;
        let sink = Arc::new(RecordingSink::default());
        let (job, _rx) = start(&downloader(sink.clone()), &url, Destination::Memory, false);

        wait(&job).await;
        assert_eq!(*sink.0.lock().unwrap(), vec![codes::DOWNLOAD_BAD_STATUS]);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let router = Router::new().route("/job.gcode", get(|| async { AxumStatus::SERVICE_UNAVAILABLE }));
        let url = serve(router).await;
        let sink = Arc::new(RecordingSink::default());
        let (job, _rx) = start(&downloader(sink.clone()), &url, Destination::Memory, false);

        wait(&job).await;
        assert_eq!(*sink.0.lock().unwrap(), vec![codes::DOWNLOAD_FAILED]);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_file() -> TestResult {
        async fn slow() -> Response<Body> {
            let stream = futures::stream::unfold(0, |state| async move {
                if state > 0 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Some((Ok::<_, std::io::Error>(Bytes::from_static(b"G28\n")), state + 1))
            });
            Response::builder()
                .status(AxumStatus::OK)
                .header(header::CONTENT_LENGTH, 1000)
                .body(Body::from_stream(stream))
                .unwrap()
        }
        let url = serve(Router::new().route("/job.gcode", get(slow))).await;
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(RecordingSink::default());
        let (job, mut rx) = start(
            &downloader(sink.clone()),
            &url,
            Destination::Disk(dir.path().to_owned()),
            false,
        );

        while job.progress().received() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        job.cancel();
        assert!(matches!(rx.recv().await, Some(Outcome::Cancelled)));

        for _ in 0..50 {
            if std::fs::read_dir(dir.path())?.next().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(std::fs::read_dir(dir.path())?.next().is_none());
        assert!(sink.0.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_zip_payload_is_extracted() -> TestResult {
        let mut archive = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        archive.start_file("job.gcode", zip::write::SimpleFileOptions::default())?;
        archive.write_all(b"G28\nG1 X10\n")?;
        let zipped = Bytes::from(archive.finish()?.into_inner());

        let router = Router::new().route(
            "/job.gcode",
            get(move || {
                let zipped = zipped.clone();
                async move { zipped }
            }),
        );
        let url = serve(router).await;
        let sink = Arc::new(RecordingSink::default());
        let (_job, mut rx) = start(&downloader(sink.clone()), &url, Destination::Memory, true);

        let Some(Outcome::Done(payload)) = rx.recv().await else {
            panic!("download did not complete");
        };
        assert_eq!(payload.into_bytes().await?, Bytes::from_static(b"G28\nG1 X10\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_compressed_partial_response_from_zero_completes() -> TestResult {
        async fn gzip_range() -> Response<Body> {
            Response::builder()
                .status(AxumStatus::PARTIAL_CONTENT)
                .header(CONTENT_ENCODING, "gzip")
                .header(CONTENT_RANGE, "bytes 0-9/10")
                .body(Body::from(vec![7u8; 10]))
                .unwrap()
        }
        let url = serve(Router::new().route("/job.gcode", get(gzip_range))).await;
        let sink = Arc::new(RecordingSink::default());
        let (job, mut rx) = start(&downloader(sink.clone()), &url, Destination::Memory, false);

        let Some(Outcome::Done(payload)) = rx.recv().await else {
            panic!("download did not complete");
        };
        assert_eq!(payload.into_bytes().await?, Bytes::from(vec![7u8; 10]));
        assert_eq!(job.progress().percent(), 100);
        assert!(sink.0.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_oversized_archive_entry_is_refused() -> TestResult {
        let mut archive = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        archive.start_file("job.gcode", zip::write::SimpleFileOptions::default())?;
        archive.write_all(b"G28\nG1 X10\n")?;
        let zipped = archive.finish()?.into_inner();

        let refused = extract_first(std::io::Cursor::new(zipped.clone()), 4);
        assert!(matches!(refused, Err(DownloadError::Store(_))));
        assert_eq!(extract_first(std::io::Cursor::new(zipped), 11)?, b"G28\nG1 X10\n".to_vec());
        Ok(())
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 400-999/1000"), Some((400, Some(1000))));
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((0, None)));
        assert_eq!(parse_content_range("items 0-9/10"), None);
    }
}

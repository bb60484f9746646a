//! Sequential byte-range fetching for progressive streams.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::trace;
use web_time::Instant;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::framing::Framer;

/// A remote (or local) resource that can serve byte ranges.
#[allow(async_fn_in_trait)]
pub trait RangeSource {
    fn location(&self) -> &str;

    /// Total length of the resource, from a metadata-only request.
    async fn probe_size(&self) -> Result<u64, StreamError>;

    /// Fetch `length` bytes starting at `offset`. May return fewer bytes than
    /// requested; the reader turns that into [`StreamError::ShortRead`].
    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StreamError>;
}

/// HTTP range reader backed by `reqwest`.
pub struct HttpRangeSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRangeSource {
    pub fn new(url: &str) -> Result<Self, StreamError> {
        Self::with_config(url, &StreamConfig::default())
    }

    pub fn with_config(url: &str, config: &StreamConfig) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl RangeSource for HttpRangeSource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn probe_size(&self) -> Result<u64, StreamError> {
        let response = self.client.head(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(StreamError::Transport(format!(
                "HEAD {} failed with status: {}",
                self.url,
                response.status()
            )));
        }

        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                StreamError::Transport(format!("HEAD {} has no Content-Length header", self.url))
            })
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StreamError> {
        let range_header = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range_header)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Transport(format!(
                "range request {offset}+{length} on {} failed with status: {status}",
                self.url
            )));
        }

        let bytes = response.bytes().await?;
        Ok(clip_response(
            &bytes,
            offset,
            length,
            status == reqwest::StatusCode::OK,
        ))
    }
}

/// Cut a range response down to the requested window. A `200 OK` carrying
/// the whole resource means the server ignored the `Range` header; a body
/// that ends before the window comes back short and becomes a short read.
fn clip_response(body: &[u8], offset: u64, length: u64, full_body: bool) -> Vec<u8> {
    let (start, end) = if full_body {
        (offset, offset.saturating_add(length))
    } else {
        (0, length)
    };
    let len = body.len() as u64;
    let (start, end) = (start.min(len) as usize, end.min(len) as usize);
    body[start..end].to_vec()
}

/// Serves the range contract from a local file.
pub struct FileRangeSource {
    path: PathBuf,
    location: String,
}

impl FileRangeSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            location: path.display().to_string(),
            path,
        }
    }
}

impl RangeSource for FileRangeSource {
    fn location(&self) -> &str {
        &self.location
    }

    async fn probe_size(&self) -> Result<u64, StreamError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StreamError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = Vec::with_capacity(length as usize);
        file.take(length).read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

/// An in-memory resource. The probed size can be overridden to model a
/// transport that promises more bytes than it delivers.
#[derive(Clone)]
pub struct MemoryRangeSource {
    data: Arc<Vec<u8>>,
    reported_size: u64,
    requests: Arc<AtomicU64>,
}

impl MemoryRangeSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            reported_size: data.len() as u64,
            data: Arc::new(data),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_reported_size(mut self, size: u64) -> Self {
        self.reported_size = size;
        self
    }

    /// Range requests served so far, shared between clones.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl RangeSource for MemoryRangeSource {
    fn location(&self) -> &str {
        "memory"
    }

    async fn probe_size(&self) -> Result<u64, StreamError> {
        Ok(self.reported_size)
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StreamError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let start = (offset as usize).min(self.data.len());
        let end = (offset.saturating_add(length) as usize).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

/// HTTP(S) URL or local path, chosen by scheme.
pub enum RemoteSource {
    Http(HttpRangeSource),
    File(FileRangeSource),
}

impl RemoteSource {
    pub fn open(location: &str, config: &StreamConfig) -> Result<Self, StreamError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(RemoteSource::Http(HttpRangeSource::with_config(
                location, config,
            )?))
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            Ok(RemoteSource::File(FileRangeSource::new(path)))
        }
    }
}

impl RangeSource for RemoteSource {
    fn location(&self) -> &str {
        match self {
            RemoteSource::Http(source) => source.location(),
            RemoteSource::File(source) => source.location(),
        }
    }

    async fn probe_size(&self) -> Result<u64, StreamError> {
        match self {
            RemoteSource::Http(source) => source.probe_size().await,
            RemoteSource::File(source) => source.probe_size().await,
        }
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, StreamError> {
        match self {
            RemoteSource::Http(source) => source.fetch_range(offset, length).await,
            RemoteSource::File(source) => source.fetch_range(offset, length).await,
        }
    }
}

/// Shared flag that stops a load from issuing further requests.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-stream position. `file_offset <= total_size` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamCursor {
    pub file_offset: u64,
    pub total_size: u64,
}

impl StreamCursor {
    pub fn remaining(&self) -> u64 {
        self.total_size - self.file_offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.file_offset == self.total_size
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FetchStats {
    pub requests: u64,
    pub bytes_fetched: u64,
    pub total_latency: Duration,
}

impl FetchStats {
    pub fn avg_latency(&self) -> Duration {
        if self.requests == 0 {
            Duration::ZERO
        } else {
            self.total_latency / self.requests as u32
        }
    }
}

/// Issues one range request at a time against a source, advancing a cursor.
///
/// The next request is only computed once the previous chunk has been handed
/// back to the caller, so bytes are delivered strictly in file order.
pub struct RangeStreamReader<S> {
    source: S,
    cursor: StreamCursor,
    cancel: CancelToken,
    stats: FetchStats,
}

impl<S: RangeSource> RangeStreamReader<S> {
    pub async fn open(source: S, cancel: CancelToken) -> Result<Self, StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let total_size = source.probe_size().await?;
        trace!("probed {}: {total_size} bytes", source.location());
        Ok(Self {
            source,
            cursor: StreamCursor {
                file_offset: 0,
                total_size,
            },
            cancel,
            stats: FetchStats::default(),
        })
    }

    pub fn cursor(&self) -> StreamCursor {
        self.cursor
    }

    pub fn total_size(&self) -> u64 {
        self.cursor.total_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_exhausted()
    }

    pub fn stats(&self) -> FetchStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch the next `length` bytes at the cursor.
    pub async fn read_exact(&mut self, length: u64) -> Result<Vec<u8>, StreamError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let offset = self.cursor.file_offset;
        if length > self.cursor.remaining() {
            return Err(StreamError::Framing(format!(
                "range {offset}+{length} runs past the end of {} ({} bytes)",
                self.source.location(),
                self.cursor.total_size
            )));
        }

        trace!("GET {} bytes={offset}-{}", self.source.location(), offset + length - 1);
        let start = Instant::now();
        let bytes = self.source.fetch_range(offset, length).await?;
        self.stats.requests += 1;
        self.stats.bytes_fetched += bytes.len() as u64;
        self.stats.total_latency += start.elapsed();

        if (bytes.len() as u64) < length {
            return Err(StreamError::ShortRead {
                offset,
                requested: length,
                received: bytes.len() as u64,
            });
        }

        self.cursor.file_offset += length;
        Ok(bytes)
    }

    /// Pull bytes through `framer` until it yields a frame or is exhausted.
    pub async fn next_frame<F: Framer>(
        &mut self,
        framer: &mut F,
    ) -> Result<Option<F::Frame>, StreamError> {
        loop {
            let Some(length) = framer.next_read()? else {
                return Ok(None);
            };
            let chunk = self.read_exact(length).await?;
            if let Some(frame) = framer.push(chunk)? {
                return Ok(Some(frame));
            }
        }
    }
}

//! Splits a byte source into parts and drives them through a [`MultipartApi`]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::MultipartApi;
use crate::storage::{
  BlobObject, CreateOptions, MultipartSession, StorageError, UploadedPart, MAX_PART_NUMBER,
};

/// Default part size (10 MiB)
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Tuning for [`ChunkUploader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
  /// Bytes per part; the last part may be shorter
  pub part_size: u64,
  /// Parts in flight at once
  pub concurrency: usize,
  /// Failed part attempts tolerated across the whole upload
  pub max_retry: u32,
}

impl Default for UploadOptions {
  fn default() -> Self {
    Self {
      part_size: DEFAULT_PART_SIZE,
      concurrency: 1,
      max_retry: 3,
    }
  }
}

/// Failure of a whole upload. The session has been aborted by the time this is returned.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
  #[error("Upload aborted after {failures} failed part attempts: {source}")]
  RetriesExhausted {
    failures: u32,
    #[source]
    source: StorageError,
  },

  #[error("Part {part_number} was rejected: {source}")]
  Rejected {
    part_number: u32,
    #[source]
    source: StorageError,
  },

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error("Failed to read upload source: {0}")]
  Source(#[from] std::io::Error),
}

/// Random-access byte source of known length
#[async_trait]
pub trait PartSource: Send + Sync {
  fn len(&self) -> u64;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Read bytes `start..end`
  async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes>;
}

#[async_trait]
impl PartSource for Bytes {
  fn len(&self) -> u64 {
    Bytes::len(self) as u64
  }

  async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
    if start > end || end > PartSource::len(self) {
      return Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("Range {}..{} outside of source", start, end),
      ));
    }
    Ok(self.slice(start as usize..end as usize))
  }
}

/// A file read one part at a time with seek + exact read
pub struct FileSource {
  file: tokio::sync::Mutex<File>,
  len: u64,
}

impl FileSource {
  pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok(Self {
      file: tokio::sync::Mutex::new(file),
      len,
    })
  }
}

#[async_trait]
impl PartSource for FileSource {
  fn len(&self) -> u64 {
    self.len
  }

  async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
    let mut buf = vec![0u8; end.saturating_sub(start) as usize];
    let mut file = self.file.lock().await;
    file.seek(SeekFrom::Start(start)).await?;
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
  }
}

/// Number of parts for `total` bytes. An empty source still gets one (empty) part.
pub fn part_count(total: u64, part_size: u64) -> u64 {
  if total == 0 {
    return 1;
  }
  total.div_ceil(part_size.max(1))
}

/// Byte range `start..end` covered by `part_number`
pub fn part_range(part_number: u32, part_size: u64, total: u64) -> (u64, u64) {
  let part_size = part_size.max(1);
  let start = (part_number as u64 - 1) * part_size;
  let end = (start + part_size).min(total);
  (start.min(end), end)
}

/// Uploads a [`PartSource`] as a multipart upload with bounded concurrency and a
/// retry budget shared by every part.
pub struct ChunkUploader {
  api: Arc<dyn MultipartApi>,
  options: UploadOptions,
}

struct UploadState {
  queue: Mutex<VecDeque<u32>>,
  parts: Mutex<BTreeMap<u32, UploadedPart>>,
  failures: AtomicU32,
  cancelled: AtomicBool,
  fatal: Mutex<Option<UploadError>>,
}

impl UploadState {
  /// Stop further dequeues; the first failure wins
  fn fail(&self, error: UploadError) {
    self.cancelled.store(true, Ordering::SeqCst);
    let mut fatal = self.fatal.lock();
    if fatal.is_none() {
      *fatal = Some(error);
    }
  }
}

/// Per-upload values shared by every worker
struct Job<'a, S: ?Sized, F> {
  state: &'a UploadState,
  source: &'a S,
  session: &'a MultipartSession,
  chunks: u64,
  on_progress: &'a F,
}

impl ChunkUploader {
  pub fn new(api: Arc<dyn MultipartApi>, options: UploadOptions) -> Self {
    Self { api, options }
  }

  pub fn options(&self) -> &UploadOptions {
    &self.options
  }

  /// Upload `source` to `pathname`.
  ///
  /// `on_progress` receives the completed fraction: non-decreasing, below 1 while parts
  /// are in flight, and exactly 1 once the object has been assembled.
  pub async fn upload<S, F>(
    &self,
    source: &S,
    pathname: &str,
    options: CreateOptions,
    on_progress: F,
  ) -> Result<BlobObject, UploadError>
  where
    S: PartSource + ?Sized,
    F: Fn(f64) + Send + Sync,
  {
    if self.options.part_size == 0 {
      return Err(StorageError::invalid_argument("Part size must be at least 1 byte").into());
    }

    let chunks = part_count(source.len(), self.options.part_size);
    if chunks > MAX_PART_NUMBER as u64 {
      return Err(
        StorageError::invalid_argument(format!(
          "{} bytes need {} parts of {} bytes, more than the {} allowed",
          source.len(),
          chunks,
          self.options.part_size,
          MAX_PART_NUMBER
        ))
        .into(),
      );
    }

    let session = self.api.create(pathname, options).await?;
    tracing::info!(
      "Uploading {} bytes to {} in {} parts (upload {})",
      source.len(),
      session.pathname,
      chunks,
      session.upload_id
    );

    let state = UploadState {
      queue: Mutex::new((1..=chunks as u32).collect()),
      parts: Mutex::new(BTreeMap::new()),
      failures: AtomicU32::new(0),
      cancelled: AtomicBool::new(false),
      fatal: Mutex::new(None),
    };
    let job = Job {
      state: &state,
      source,
      session: &session,
      chunks,
      on_progress: &on_progress,
    };

    join_all((0..self.options.concurrency.max(1)).map(|_| self.worker(&job))).await;

    let fatal = state.fatal.lock().take();
    if let Some(error) = fatal {
      self.abort_quietly(&session).await;
      return Err(error);
    }

    let parts: Vec<UploadedPart> = state.parts.into_inner().into_values().collect();
    if parts.len() as u64 != chunks {
      self.abort_quietly(&session).await;
      return Err(
        StorageError::internal_error(format!(
          "Only {} of {} parts were uploaded",
          parts.len(),
          chunks
        ))
        .into(),
      );
    }

    match self
      .api
      .complete(&session.pathname, &session.upload_id, parts)
      .await
    {
      Ok(object) => {
        on_progress(1.0);
        tracing::info!("Uploaded {} ({} bytes)", object.pathname, object.size);
        Ok(object)
      }
      Err(e) => {
        self.abort_quietly(&session).await;
        Err(e.into())
      }
    }
  }

  async fn worker<S, F>(&self, job: &Job<'_, S, F>)
  where
    S: PartSource + ?Sized,
    F: Fn(f64) + Send + Sync,
  {
    let state = job.state;
    let max_retry = self.options.max_retry.max(1);

    while !state.cancelled.load(Ordering::SeqCst) {
      let Some(part_number) = state.queue.lock().pop_front() else {
        break;
      };

      let (start, end) = part_range(part_number, self.options.part_size, job.source.len());
      let data = match job.source.read_range(start, end).await {
        Ok(data) => data,
        Err(e) => {
          state.fail(UploadError::Source(e));
          break;
        }
      };

      let result = self
        .api
        .upload_part(
          &job.session.pathname,
          &job.session.upload_id,
          part_number,
          data,
        )
        .await;

      match result {
        Ok(part) => {
          let mut parts = state.parts.lock();
          parts.insert(part_number, part);
          let completed = parts.len() as u64;
          if completed < job.chunks {
            (job.on_progress)(completed as f64 / job.chunks as f64);
          }
          tracing::debug!("Part {} of {} uploaded", part_number, job.chunks);
        }
        Err(e) if e.is_retryable() => {
          let failures = state.failures.fetch_add(1, Ordering::SeqCst) + 1;
          if failures >= max_retry {
            state.fail(UploadError::RetriesExhausted {
              failures,
              source: e,
            });
            break;
          }
          tracing::warn!(
            "Part {} failed ({} of {} attempts used), retrying: {}",
            part_number,
            failures,
            max_retry,
            e
          );
          state.queue.lock().push_back(part_number);
        }
        Err(e) => {
          state.fail(UploadError::Rejected {
            part_number,
            source: e,
          });
          break;
        }
      }
    }
  }

  async fn abort_quietly(&self, session: &MultipartSession) {
    if let Err(e) = self
      .api
      .abort(&session.pathname, &session.upload_id)
      .await
    {
      tracing::warn!("Failed to abort upload {}: {}", session.upload_id, e);
    }
  }
}

//! Selective fetch pipeline.
//!
//! One [`FetchTask`] per selected entry:
//!
//! 1. skip if the final file already has the expected length
//! 2. probe the local header to find where the data starts
//! 3. read the compressed data in `block_size` chunks, each with retries
//! 4. write the entry content to a task-private `.part` file, then rename
//!
//! Stored entries are copied, deflated entries are inflated on the fly, and
//! both are checked against the directory's size and CRC-32. Entries that
//! cannot be decoded (encrypted, other methods) or all compressed entries
//! with [`FetchOptions::keep_compressed`] end up in a single-entry ZIP next to
//! the entry's path.
//!
//! A failed or cancelled task never leaves anything at the final path.

mod progress;
mod retry;

pub use progress::{
    ArchiveTag, EntryOutcome, ProgressEvent, ProgressReporter, ProgressSink, ProgressTotals, channel,
};
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryDecision, RetryPolicy, retry};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::Crc;
use flate2::write::DeflateDecoder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::zip::{CompressionMethod, DirectoryEntry, SingleEntryContainer, ZipParser};

/// Default chunk size of data reads.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

const PART_SUFFIX: &str = "part";

static PART_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Tunables of the fetch pipeline.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub block_size: usize,
    pub retry: RetryPolicy,
    /// Write compressed entries as `<entry>.zip` containers instead of
    /// inflating them.
    pub keep_compressed: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            retry: RetryPolicy::default(),
            keep_compressed: false,
        }
    }
}

/// How an entry ends up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Stored entry, data written as-is.
    Raw,
    /// Deflated entry, inflated while it is fetched.
    Inflated,
    /// Compressed bytes inside a single-entry ZIP, `.zip` appended.
    Container,
}

/// One entry to retrieve from an open archive.
pub struct FetchTask {
    /// Archive the entry belongs to, for logs and progress.
    pub archive: ArchiveTag,
    pub reader: Arc<dyn ReadAt>,
    pub entry: DirectoryEntry,
    /// Path the entry maps to in the output tree.
    pub destination: PathBuf,
}

impl FetchTask {
    pub fn format(&self, options: &FetchOptions) -> OutputFormat {
        if self.entry.is_encrypted() {
            return OutputFormat::Container;
        }
        match self.entry.compression_method {
            CompressionMethod::Stored => OutputFormat::Raw,
            CompressionMethod::Deflate if !options.keep_compressed => OutputFormat::Inflated,
            _ => OutputFormat::Container,
        }
    }

    /// Path of the finished file.
    pub fn output_path(&self, options: &FetchOptions) -> PathBuf {
        match self.format(options) {
            OutputFormat::Raw | OutputFormat::Inflated => self.destination.clone(),
            OutputFormat::Container => with_suffix(&self.destination, "zip"),
        }
    }

    /// Size of the finished file.
    pub fn expected_len(&self, options: &FetchOptions) -> u64 {
        match self.format(options) {
            OutputFormat::Raw | OutputFormat::Inflated => self.entry.uncompressed_size,
            OutputFormat::Container => SingleEntryContainer::new(&self.entry).total_len(),
        }
    }
}

/// Outcome of one [`FetchTask`].
#[derive(Debug)]
pub enum DownloadResult {
    Fetched {
        entry: String,
        path: PathBuf,
        bytes: u64,
    },
    /// The output already existed with the expected size; nothing was read.
    AlreadyPresent { entry: String, path: PathBuf },
    Failed { entry: String, error: Error },
    /// Not attempted, or abandoned, because the run was cancelled.
    Skipped { entry: String },
}

impl DownloadResult {
    pub fn entry(&self) -> &str {
        match self {
            DownloadResult::Fetched { entry, .. }
            | DownloadResult::AlreadyPresent { entry, .. }
            | DownloadResult::Failed { entry, .. }
            | DownloadResult::Skipped { entry } => entry,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            DownloadResult::Fetched { path, .. } | DownloadResult::AlreadyPresent { path, .. } => {
                Some(path.as_path())
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            DownloadResult::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DownloadResult::Failed { .. })
    }

    pub fn outcome(&self) -> EntryOutcome {
        match self {
            DownloadResult::Fetched { .. } => EntryOutcome::Fetched,
            DownloadResult::AlreadyPresent { .. } => EntryOutcome::AlreadyPresent,
            DownloadResult::Failed { .. } => EntryOutcome::Failed,
            DownloadResult::Skipped { .. } => EntryOutcome::Skipped,
        }
    }
}

/// Run one task to completion and report it on `progress`.
#[instrument(level = "debug", skip_all, fields(archive = %task.archive, entry = %task.entry.name))]
pub async fn fetch_entry(
    task: &FetchTask,
    options: &FetchOptions,
    cancel: &CancellationToken,
    progress: &ProgressSink,
) -> DownloadResult {
    let mut fetched = 0u64;
    let result = run_task(task, options, cancel, progress, &mut fetched).await;

    progress.send(ProgressEvent::EntryFinished {
        archive: task.archive.clone(),
        outcome: result.outcome(),
        unfetched: task.entry.compressed_size.saturating_sub(fetched),
    });
    result
}

async fn run_task(
    task: &FetchTask,
    options: &FetchOptions,
    cancel: &CancellationToken,
    progress: &ProgressSink,
    fetched: &mut u64,
) -> DownloadResult {
    let entry = task.entry.name.clone();
    if cancel.is_cancelled() {
        return DownloadResult::Skipped { entry };
    }

    let path = task.output_path(options);
    let expected = task.expected_len(options);
    if let Ok(meta) = fs::metadata(&path).await {
        if meta.is_file() && meta.len() == expected {
            debug!(path = %path.display(), "already present");
            return DownloadResult::AlreadyPresent { entry, path };
        }
        debug!(path = %path.display(), found = meta.len(), expected, "replacing existing file");
    }

    let part = part_path(&path);
    match write_part(task, options, cancel, progress, &part, fetched).await {
        Ok(bytes) => match fs::rename(&part, &path).await {
            Ok(()) => {
                debug!(path = %path.display(), bytes, "entry written");
                DownloadResult::Fetched { entry, path, bytes }
            }
            Err(e) => {
                discard(&part).await;
                DownloadResult::Failed {
                    entry,
                    error: Error::io(&path, e),
                }
            }
        },
        Err(error) => {
            discard(&part).await;
            match error {
                Error::Cancelled => DownloadResult::Skipped { entry },
                error => {
                    warn!(error = %error, "entry failed");
                    DownloadResult::Failed { entry, error }
                }
            }
        }
    }
}

/// Fetch the entry into `part`; returns the bytes written.
async fn write_part(
    task: &FetchTask,
    options: &FetchOptions,
    cancel: &CancellationToken,
    progress: &ProgressSink,
    part: &Path,
    fetched: &mut u64,
) -> Result<u64> {
    let entry = &task.entry;
    let format = task.format(options);
    let corrupt = |reason: String| {
        Error::corrupt(task.reader.location(), format!("{}: {reason}", entry.name))
    };
    if format == OutputFormat::Raw && entry.compressed_size != entry.uncompressed_size {
        return Err(corrupt("stored entry with differing sizes".to_string()));
    }

    let parser = ZipParser::new(Arc::clone(&task.reader))
        .with_retry(options.retry.clone(), cancel.clone());
    let data_offset = parser.data_offset(entry).await?;

    if let Some(parent) = part.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
    }
    let mut file = fs::File::create(part)
        .await
        .map_err(|e| Error::io(part, e))?;

    let container = SingleEntryContainer::new(entry);
    let mut written = 0u64;
    if format == OutputFormat::Container {
        let header = container.local_header().map_err(|e| Error::io(part, e))?;
        file.write_all(&header)
            .await
            .map_err(|e| Error::io(part, e))?;
        written += header.len() as u64;
    }

    let mut content = Content::new(format == OutputFormat::Inflated, entry.uncompressed_size);
    let block_size = options.block_size.max(1) as u64;
    let end = data_offset + entry.compressed_size;
    let mut pos = data_offset;
    while pos < end {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let len = block_size.min(end - pos) as usize;
        let reader = &task.reader;
        let chunk = retry(&options.retry, cancel, &entry.name, || {
            reader.read_range(pos, len)
        })
        .await?;

        let data = content.push(chunk).map_err(|e| corrupt(e.to_string()))?;
        file.write_all(&data)
            .await
            .map_err(|e| Error::io(part, e))?;
        pos += len as u64;
        written += data.len() as u64;
        *fetched += len as u64;
        progress.bytes(&task.archive, len as u64);
    }

    let tail = content.finish().map_err(|e| corrupt(e.to_string()))?;
    file.write_all(&tail)
        .await
        .map_err(|e| Error::io(part, e))?;
    written += tail.len() as u64;

    if format == OutputFormat::Container {
        let trailer = container.trailer().map_err(|e| Error::io(part, e))?;
        file.write_all(&trailer)
            .await
            .map_err(|e| Error::io(part, e))?;
        written += trailer.len() as u64;
    } else {
        content.verify(entry).map_err(corrupt)?;
    }

    file.flush().await.map_err(|e| Error::io(part, e))?;
    Ok(written)
}

/// Entry content as it is fetched, with its running length and CRC-32.
struct Content {
    inflater: Option<DeflateDecoder<Vec<u8>>>,
    crc: Crc,
    len: u64,
    declared: u64,
}

impl Content {
    fn new(inflate: bool, declared: u64) -> Self {
        Self {
            inflater: inflate.then(|| DeflateDecoder::new(Vec::new())),
            crc: Crc::new(),
            len: 0,
            declared,
        }
    }

    /// Feed the next compressed bytes; returns the content they decode to.
    fn push(&mut self, chunk: Vec<u8>) -> std::io::Result<Vec<u8>> {
        let data = match self.inflater.as_mut() {
            Some(inflater) => {
                inflater.write_all(&chunk)?;
                inflater.flush()?;
                std::mem::take(inflater.get_mut())
            }
            None => chunk,
        };
        self.account(&data)?;
        Ok(data)
    }

    /// Content still buffered in the inflater.
    fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        let Some(inflater) = self.inflater.take() else {
            return Ok(Vec::new());
        };
        let data = inflater.finish()?;
        self.account(&data)?;
        Ok(data)
    }

    fn account(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.len += data.len() as u64;
        if self.inflater.is_some() && self.len > self.declared {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("inflates past its declared size of {} bytes", self.declared),
            ));
        }
        self.crc.update(data);
        Ok(())
    }

    fn verify(&self, entry: &DirectoryEntry) -> std::result::Result<(), String> {
        if self.len != entry.uncompressed_size {
            return Err(format!(
                "content is {} bytes, directory says {}",
                self.len, entry.uncompressed_size
            ));
        }
        if self.crc.sum() != entry.crc32 {
            return Err(format!(
                "CRC-32 mismatch (expected {:08x}, got {:08x})",
                entry.crc32,
                self.crc.sum()
            ));
        }
        Ok(())
    }
}

async fn discard(part: &Path) {
    if let Err(e) = fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %part.display(), error = %e, "could not remove partial file");
        }
    }
}

/// Temporary path of one task; unique within the process so that two tasks
/// never share it.
fn part_path(path: &Path) -> PathBuf {
    let seq = PART_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    with_suffix(path, &format!("{}-{seq}.{PART_SUFFIX}", std::process::id()))
}

/// `path` with `.suffix` appended to the file name.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

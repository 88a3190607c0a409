//! Run orchestration: archives and entries processed concurrently under one
//! limit on in-flight range operations.
//!
//! Archives are independent of each other. Within an archive the directory
//! is always read before any entry is fetched. Opening plus indexing an
//! archive holds one permit, and so does every fetch task; the archive's
//! permit is released before its entries start.
//!
//! A job listed twice is processed once, and no two archives of a run write
//! the same output path.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::catalog::Resolver;
use crate::error::{Error, Result};
use crate::fetch::{
    self, ArchiveTag, DownloadResult, EntryOutcome, FetchOptions, FetchTask, ProgressEvent,
    ProgressSink, ProgressTotals,
};
use crate::input::{ProductTree, normalize_product_name};
use crate::io::{Backend, ReadAt};
use crate::output::OutputLayout;
use crate::select::{ProductKind, RuleSet, SelectionCriteria};
use crate::zip::{DirectoryEntry, ZipParser};

/// Default number of concurrent range operations.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// One archive to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveJob {
    /// URL or path handed to the backend.
    pub location: String,
    /// Output sub-directory; empty for the output root.
    pub key: String,
    /// Product kind; inferred from the archive name when `None`.
    pub kind: Option<ProductKind>,
}

impl ArchiveJob {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            key: String::new(),
            kind: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_kind(mut self, kind: Option<ProductKind>) -> Self {
        self.kind = kind;
        self
    }

    /// Product name: last path segment of the location, without suffixes.
    pub fn name(&self) -> String {
        let path = self.location.split(['?', '#']).next().unwrap_or_default();
        let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
        normalize_product_name(last)
    }
}

#[derive(Debug)]
pub enum ArchiveStatus {
    /// All selected entries were attempted.
    Completed,
    /// Nothing in the archive matched the criteria.
    NoMatch,
    /// Opening or indexing failed.
    Failed(Error),
    /// The run was cancelled before every entry was attempted.
    Cancelled,
}

#[derive(Debug)]
pub struct ArchiveReport {
    pub location: String,
    pub key: String,
    pub status: ArchiveStatus,
    /// Results in archive order.
    pub entries: Vec<DownloadResult>,
}

impl ArchiveReport {
    fn new(job: &ArchiveJob, status: ArchiveStatus) -> Self {
        Self {
            location: job.location.clone(),
            key: job.key.clone(),
            status,
            entries: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        matches!(self.status, ArchiveStatus::Failed(_))
            || self.entries.iter().any(DownloadResult::is_failure)
    }
}

/// A product the catalog could not resolve.
#[derive(Debug)]
pub struct Unresolved {
    pub product: String,
    pub key: String,
    pub error: Error,
}

/// Everything a run did.
#[derive(Debug, Default)]
pub struct RunReport {
    pub archives: Vec<ArchiveReport>,
    pub unresolved: Vec<Unresolved>,
    pub totals: ProgressTotals,
}

/// One failed item of a run.
#[derive(Debug)]
pub struct Failure<'a> {
    /// Product, archive location or `location!entry`.
    pub item: String,
    pub error: &'a Error,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.unresolved.is_empty() || self.archives.iter().any(ArchiveReport::has_failures)
    }

    /// Every failed product, archive and entry, in report order.
    pub fn failures(&self) -> Vec<Failure<'_>> {
        let mut out: Vec<_> = self
            .unresolved
            .iter()
            .map(|u| Failure {
                item: u.product.clone(),
                error: &u.error,
            })
            .collect();
        for archive in &self.archives {
            if let ArchiveStatus::Failed(error) = &archive.status {
                out.push(Failure {
                    item: archive.location.clone(),
                    error,
                });
            }
            for result in &archive.entries {
                if let Some(error) = result.error() {
                    out.push(Failure {
                        item: format!("{}!{}", archive.location, result.entry()),
                        error,
                    });
                }
            }
        }
        out
    }

    pub fn was_cancelled(&self) -> bool {
        self.archives
            .iter()
            .any(|a| matches!(a.status, ArchiveStatus::Cancelled))
    }
}

/// Downloads the selected entries of many archives.
pub struct Downloader {
    backend: Arc<dyn Backend>,
    criteria: SelectionCriteria,
    layout: OutputLayout,
    options: FetchOptions,
    product_kind: Option<ProductKind>,
    limiter: Semaphore,
    cancel: CancellationToken,
    show_progress: bool,
}

impl Downloader {
    pub fn new(backend: Arc<dyn Backend>, criteria: SelectionCriteria, layout: OutputLayout) -> Self {
        Self {
            backend,
            criteria,
            layout,
            options: FetchOptions::default(),
            product_kind: None,
            limiter: Semaphore::new(DEFAULT_CONCURRENCY),
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Maximum number of concurrent range operations, at least 1.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.limiter = Semaphore::new(limit.max(1));
        self
    }

    /// Use this product kind for every archive instead of inferring it.
    pub fn with_product_kind(mut self, kind: Option<ProductKind>) -> Self {
        self.product_kind = kind;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve every product through `resolver`, then download them.
    pub async fn download_products(&self, resolver: &dyn Resolver, tree: &ProductTree) -> RunReport {
        let mut jobs = Vec::new();
        let mut unresolved = Vec::new();
        for (key, products) in tree {
            for (product, resolved) in resolver.resolve_all(products).await {
                match resolved {
                    Ok(url) => jobs.push(
                        ArchiveJob::new(url)
                            .with_key(key.clone())
                            .with_kind(self.product_kind.or_else(|| ProductKind::infer(&product))),
                    ),
                    Err(error) => {
                        warn!(product = %product, error = %error, "product not resolved");
                        unresolved.push(Unresolved {
                            product,
                            key: key.clone(),
                            error,
                        });
                    }
                }
            }
        }

        let mut report = self.download(jobs).await;
        report.unresolved = unresolved;
        report
    }

    /// Process every job; returns once all of them finished. Repeated
    /// `(location, key)` jobs are dropped.
    pub async fn download(&self, jobs: Vec<ArchiveJob>) -> RunReport {
        let jobs = dedup_jobs(jobs);
        let (sink, reporter) = fetch::channel(self.show_progress);

        let work = async move {
            let sink = &sink;
            let claims = &OutputClaims::default();
            let mut pending: FuturesUnordered<_> = jobs
                .iter()
                .enumerate()
                .map(|(index, job)| async move {
                    (index, self.process_archive(index, job, sink, claims).await)
                })
                .collect();

            let mut archives = Vec::with_capacity(jobs.len());
            while let Some(done) = pending.next().await {
                archives.push(done);
            }
            archives.sort_by_key(|(index, _)| *index);
            archives.into_iter().map(|(_, report)| report).collect::<Vec<_>>()
        };

        let (archives, totals) = tokio::join!(work, reporter.run());
        RunReport {
            archives,
            unresolved: Vec::new(),
            totals,
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            permit = self.limiter.acquire() => permit.map_err(|_| Error::Cancelled),
        }
    }

    async fn open_and_index(
        &self,
        job: &ArchiveJob,
    ) -> Result<(Arc<dyn ReadAt>, Vec<DirectoryEntry>)> {
        let _permit = self.permit().await?;
        let reader = fetch::retry(&self.options.retry, &self.cancel, &job.location, || {
            self.backend.open(&job.location)
        })
        .await?;
        let entries = ZipParser::new(Arc::clone(&reader))
            .with_retry(self.options.retry.clone(), self.cancel.clone())
            .list_entries()
            .await?;
        Ok((reader, entries))
    }

    #[instrument(level = "info", skip_all, fields(archive = %job.name()))]
    async fn process_archive(
        &self,
        job_index: usize,
        job: &ArchiveJob,
        progress: &ProgressSink,
        claims: &OutputClaims,
    ) -> ArchiveReport {
        if self.cancel.is_cancelled() {
            return ArchiveReport::new(job, ArchiveStatus::Cancelled);
        }

        let (reader, entries) = match self.open_and_index(job).await {
            Ok(indexed) => indexed,
            Err(Error::Cancelled) => return ArchiveReport::new(job, ArchiveStatus::Cancelled),
            Err(error) => {
                warn!(location = %job.location, error = %error, "archive failed");
                return ArchiveReport::new(job, ArchiveStatus::Failed(error));
            }
        };

        let name = job.name();
        let kind = job
            .kind
            .or(self.product_kind)
            .unwrap_or_else(|| ProductKind::infer_or_default(&name));
        let rules = RuleSet::new(&self.criteria, kind);
        let selected = rules.select(&entries);
        info!(
            entries = entries.len(),
            selected = selected.len(),
            kind = %kind,
            transferred = reader.transferred_bytes(),
            "archive indexed"
        );
        if selected.is_empty() {
            return ArchiveReport::new(job, ArchiveStatus::NoMatch);
        }

        let dir = match self.layout.archive_dir(&job.key) {
            Ok(dir) => dir,
            Err(error) => return ArchiveReport::new(job, ArchiveStatus::Failed(error)),
        };

        let archive = ArchiveTag::new(job_index, name.as_str());
        progress.send(ProgressEvent::ArchiveIndexed {
            archive: archive.clone(),
            entries: selected.len(),
            bytes: selected.iter().map(|e| e.compressed_size).sum(),
        });

        let mut pending = FuturesUnordered::new();
        let mut results = Vec::with_capacity(selected.len());
        for (index, entry) in selected.into_iter().enumerate() {
            let claimed = self
                .layout
                .entry_path(&dir, &entry.name)
                .and_then(|path| claims.claim(&entry.name, path));
            let destination = match claimed {
                Ok(path) => path,
                Err(error) => {
                    warn!(entry = %entry.name, error = %error, "refusing entry");
                    progress.send(ProgressEvent::EntryFinished {
                        archive: archive.clone(),
                        outcome: EntryOutcome::Failed,
                        unfetched: entry.compressed_size,
                    });
                    results.push((
                        index,
                        DownloadResult::Failed {
                            entry: entry.name.clone(),
                            error,
                        },
                    ));
                    continue;
                }
            };
            let task = FetchTask {
                archive: archive.clone(),
                reader: Arc::clone(&reader),
                entry: entry.clone(),
                destination,
            };
            pending.push(async move {
                let result = match self.permit().await {
                    Ok(_permit) => {
                        fetch::fetch_entry(&task, &self.options, &self.cancel, progress).await
                    }
                    Err(_) => DownloadResult::Skipped {
                        entry: task.entry.name.clone(),
                    },
                };
                (index, result)
            });
        }
        while let Some(done) = pending.next().await {
            results.push(done);
        }
        results.sort_by_key(|(index, _)| *index);

        progress.send(ProgressEvent::ArchiveFinished { archive });
        let entries: Vec<_> = results.into_iter().map(|(_, r)| r).collect();
        let cancelled = entries
            .iter()
            .any(|r| matches!(r, DownloadResult::Skipped { .. }));
        let failed = entries.iter().filter(|r| r.is_failure()).count();
        info!(succeeded = entries.len() - failed, failed, "archive finished");

        ArchiveReport {
            location: job.location.clone(),
            key: job.key.clone(),
            status: if cancelled {
                ArchiveStatus::Cancelled
            } else {
                ArchiveStatus::Completed
            },
            entries,
        }
    }
}

/// Drop repeated `(location, key)` jobs, keeping the first of each.
fn dedup_jobs(jobs: Vec<ArchiveJob>) -> Vec<ArchiveJob> {
    let mut seen = HashSet::new();
    jobs.into_iter()
        .filter(|job| {
            let first = seen.insert((job.location.clone(), job.key.clone()));
            if !first {
                warn!(location = %job.location, key = %job.key, "archive listed twice, processing it once");
            }
            first
        })
        .collect()
}

/// Output paths taken by the archives of one run.
#[derive(Debug, Default)]
struct OutputClaims(Mutex<HashSet<PathBuf>>);

impl OutputClaims {
    /// Take `path` for entry `name`; fails when another archive of the run
    /// already writes it.
    fn claim(&self, name: &str, path: PathBuf) -> Result<PathBuf> {
        if self.0.lock().insert(path.clone()) {
            Ok(path)
        } else {
            Err(Error::path_conflict(
                name,
                format!("{} is written by another archive of this run", path.display()),
            ))
        }
    }
}

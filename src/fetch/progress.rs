//! Progress aggregation.
//!
//! Fetch tasks never share counters. They send [`ProgressEvent`]s to one
//! [`ProgressReporter`], which owns the bars and the running totals.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;

/// Outcome of one entry, as far as progress is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Fetched,
    AlreadyPresent,
    Failed,
    Skipped,
}

/// One archive of a run: its job position and its display name. Two jobs
/// may share a name (the same product under two keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveTag {
    pub job: usize,
    pub name: Arc<str>,
}

impl ArchiveTag {
    pub fn new(job: usize, name: impl Into<Arc<str>>) -> Self {
        Self {
            job,
            name: name.into(),
        }
    }
}

impl fmt::Display for ArchiveTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Directory read; `bytes` is the compressed size of the selected entries.
    ArchiveIndexed {
        archive: ArchiveTag,
        entries: usize,
        bytes: u64,
    },
    /// Compressed bytes received for an entry of `archive`.
    Bytes { archive: ArchiveTag, n: u64 },
    /// An entry finished; `unfetched` is the part of its size that was never
    /// transferred.
    EntryFinished {
        archive: ArchiveTag,
        outcome: EntryOutcome,
        unfetched: u64,
    },
    ArchiveFinished { archive: ArchiveTag },
}

/// Totals over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTotals {
    pub archives: usize,
    pub fetched: usize,
    pub already_present: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Sending half handed to archive and fetch tasks. Sends never block and
/// never fail; events after the reporter is gone are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    pub fn send(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn bytes(&self, archive: &ArchiveTag, n: u64) {
        self.send(ProgressEvent::Bytes {
            archive: archive.clone(),
            n,
        });
    }
}

/// Receiving half; drives the bars until every [`ProgressSink`] is dropped.
pub struct ProgressReporter {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    multi: MultiProgress,
}

/// Create a connected sink and reporter. Bars are drawn only when `visible`.
pub fn channel(visible: bool) -> (ProgressSink, ProgressReporter) {
    let (tx, rx) = mpsc::unbounded_channel();
    let target = if visible {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let multi = MultiProgress::with_draw_target(target);
    (ProgressSink { tx }, ProgressReporter { rx, multi })
}

fn bytes_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:40!} {bar:30} {bytes}/{total_bytes} {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl ProgressReporter {
    /// Consume events until all senders are gone and return the totals.
    pub async fn run(mut self) -> ProgressTotals {
        let mut bars = Bars::new(&self.multi);
        while let Some(event) = self.rx.recv().await {
            bars.apply(event);
        }
        bars.finish()
    }
}

/// The overall bar, one bar per archive in flight (keyed by job) and the
/// totals.
struct Bars {
    multi: MultiProgress,
    overall: ProgressBar,
    archives: HashMap<usize, ProgressBar>,
    totals: ProgressTotals,
}

impl Bars {
    fn new(multi: &MultiProgress) -> Self {
        let overall = multi.add(ProgressBar::new(0));
        overall.set_style(bytes_style());
        overall.set_message("total");
        Self {
            multi: multi.clone(),
            overall,
            archives: HashMap::new(),
            totals: ProgressTotals::default(),
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::ArchiveIndexed {
                archive,
                entries,
                bytes,
            } => {
                self.overall.inc_length(bytes);
                let bar = self
                    .multi
                    .insert_before(&self.overall, ProgressBar::new(bytes));
                bar.set_style(bytes_style());
                bar.set_message(format!("{archive} ({entries} files)"));
                if let Some(stale) = self.archives.insert(archive.job, bar) {
                    stale.finish_and_clear();
                }
            }
            ProgressEvent::Bytes { archive, n } => {
                self.totals.bytes += n;
                self.overall.inc(n);
                if let Some(bar) = self.archives.get(&archive.job) {
                    bar.inc(n);
                }
            }
            ProgressEvent::EntryFinished {
                archive,
                outcome,
                unfetched,
            } => {
                match outcome {
                    EntryOutcome::Fetched => self.totals.fetched += 1,
                    EntryOutcome::AlreadyPresent => self.totals.already_present += 1,
                    EntryOutcome::Failed => self.totals.failed += 1,
                    EntryOutcome::Skipped => self.totals.skipped += 1,
                }
                // Bars only track what is left to transfer.
                shrink(&self.overall, unfetched);
                if let Some(bar) = self.archives.get(&archive.job) {
                    shrink(bar, unfetched);
                }
            }
            ProgressEvent::ArchiveFinished { archive } => {
                self.totals.archives += 1;
                if let Some(bar) = self.archives.remove(&archive.job) {
                    bar.finish_and_clear();
                }
            }
        }
    }

    fn finish(self) -> ProgressTotals {
        for bar in self.archives.values() {
            bar.finish_and_clear();
        }
        self.overall.finish_and_clear();
        self.totals
    }
}

fn shrink(bar: &ProgressBar, n: u64) {
    bar.set_length(bar.length().unwrap_or(0).saturating_sub(n));
}

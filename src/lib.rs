//! # s1meta
//!
//! Download the metadata of Sentinel-1 products without downloading the
//! products.
//!
//! Sentinel-1 products are distributed as multi-gigabyte ZIP archives of a
//! `.SAFE` directory. The metadata (manifest, annotations, calibration and
//! noise tables) is a few megabytes of that. This library reads the ZIP
//! central directory of a remote archive with HTTP Range requests, selects
//! the entries that are wanted and fetches only their bytes.
//!
//! ## Features
//!
//! - Product name resolution through the ASF search API
//! - Range backends for HTTP(S), block-buffered HTTP and local files
//! - ZIP64 archives
//! - Selection by category, beam and polarization
//! - Stored entries written as-is, compressed entries wrapped into
//!   single-entry ZIP files without inflating them
//! - Bounded retries, shared concurrency limit, cancellation, progress bars
//!
//! ## Example
//!
//! ```no_run
//! use s1meta::{ArchiveJob, BackendKind, Downloader, OutputLayout, SelectionCriteria};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = BackendKind::Buffered.build(None, 256 * 1024)?;
//!     let criteria = SelectionCriteria {
//!         calibration: true,
//!         ..SelectionCriteria::default()
//!     };
//!     let downloader = Downloader::new(backend, criteria, OutputLayout::new("out"));
//!
//!     let report = downloader
//!         .download(vec![ArchiveJob::new("https://example.com/S1A_IW_SLC__1SDV_X.zip")])
//!         .await;
//!     for failure in report.failures() {
//!         eprintln!("{}: {}", failure.item, failure.error);
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod catalog;
pub mod cli;
pub mod error;
pub mod fetch;
pub mod input;
pub mod io;
pub mod output;
pub mod run;
pub mod select;
pub mod zip;

pub use auth::{Credentials, resolve_credentials};
pub use catalog::{AsfCatalog, Resolver};
pub use cli::Cli;
pub use error::{Error, ErrorKind, Result};
pub use fetch::{DownloadResult, FetchOptions, FetchTask, RetryPolicy};
pub use input::{ProductTree, load_product_lists, products_from_args};
pub use io::{Backend, BackendKind, HttpRangeReader, LocalFileReader, ReadAt};
pub use output::OutputLayout;
pub use run::{ArchiveJob, ArchiveReport, ArchiveStatus, Downloader, RunReport};
pub use select::{Beam, Category, Polarization, ProductKind, RuleSet, SelectionCriteria};
pub use zip::{DirectoryEntry, ZipParser};

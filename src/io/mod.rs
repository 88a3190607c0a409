//! Range-readable remote resources.
//!
//! Everything above this module talks to archives through [`ReadAt`] handles
//! obtained from a [`Backend`]. Which backend is used is a configuration
//! choice ([`BackendKind`]); callers never depend on a concrete variant.

mod buffered;
mod http;
mod local;

pub use buffered::{BlockCacheReader, BufferedBackend};
pub use http::{HttpBackend, HttpRangeReader};
pub use local::{LocalBackend, LocalFileReader};

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::Credentials;
use crate::error::{Error, Result};

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// Either the whole buffer is filled or an error is returned.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Where the data comes from, used in errors and logs.
    fn location(&self) -> &str;

    /// Bytes pulled from the underlying source so far.
    fn transferred_bytes(&self) -> u64;

    /// Read `len` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_bounds(self.location(), self.size(), offset, len as u64)?;
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf).await?;
        Ok(buf)
    }
}

/// Opens locations as [`ReadAt`] handles.
///
/// A backend holds whatever session state is shared between handles (HTTP
/// connection pool, cookies, credentials).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn open(&self, location: &str) -> Result<Arc<dyn ReadAt>>;
}

/// Available backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendKind {
    /// One ranged GET per read.
    Http,
    /// Ranged GETs of whole blocks, recent blocks cached.
    #[default]
    Buffered,
    /// Local paths and `file://` URLs.
    Local,
}

impl BackendKind {
    /// Build the backend. `block_size` only matters for [`BackendKind::Buffered`].
    pub fn build(
        self,
        credentials: Option<Credentials>,
        block_size: usize,
    ) -> Result<Arc<dyn Backend>> {
        Ok(match self {
            BackendKind::Http => Arc::new(HttpBackend::new(credentials)?),
            BackendKind::Buffered => Arc::new(BufferedBackend::new(
                HttpBackend::new(credentials)?,
                block_size,
            )),
            BackendKind::Local => Arc::new(LocalBackend),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Http => "http",
            BackendKind::Buffered => "buffered",
            BackendKind::Local => "local",
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(BackendKind::Http),
            "buffered" => Ok(BackendKind::Buffered),
            "local" => Ok(BackendKind::Local),
            other => Err(Error::InvalidInput(format!("unknown backend {other:?}"))),
        }
    }
}

pub(crate) fn check_bounds(location: &str, size: u64, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::corrupt(
            location,
            format!("read of {len} bytes at offset {offset} runs past end of {size} bytes"),
        )),
    }
}

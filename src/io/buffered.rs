use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{Backend, HttpBackend, ReadAt, check_bounds};
use crate::error::Result;

/// Number of recently used blocks kept per handle.
const CACHED_BLOCKS: usize = 4;

/// HTTP backend whose handles read whole aligned blocks and cache them.
pub struct BufferedBackend {
    http: HttpBackend,
    block_size: usize,
}

impl BufferedBackend {
    pub fn new(http: HttpBackend, block_size: usize) -> Self {
        Self {
            http,
            block_size: block_size.max(1),
        }
    }
}

#[async_trait]
impl Backend for BufferedBackend {
    async fn open(&self, location: &str) -> Result<Arc<dyn ReadAt>> {
        let reader = self.http.open_reader(location).await?;
        Ok(Arc::new(BlockCacheReader::new(reader, self.block_size)))
    }
}

/// Serves reads from block-aligned fetches of the inner reader.
///
/// Small neighbouring reads (EOCD, then the central directory right before it;
/// a local header, then the first data chunk) usually hit the same block.
pub struct BlockCacheReader<R: ReadAt> {
    inner: R,
    block_size: u64,
    blocks: Mutex<VecDeque<(u64, Arc<Vec<u8>>)>>,
}

impl<R: ReadAt> BlockCacheReader<R> {
    pub fn new(inner: R, block_size: usize) -> Self {
        Self {
            inner,
            block_size: block_size.max(1) as u64,
            blocks: Mutex::new(VecDeque::with_capacity(CACHED_BLOCKS)),
        }
    }

    fn cached(&self, index: u64) -> Option<Arc<Vec<u8>>> {
        self.blocks
            .lock()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, block)| Arc::clone(block))
    }

    async fn block(&self, index: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(block) = self.cached(index) {
            return Ok(block);
        }

        let start = index * self.block_size;
        let len = self.block_size.min(self.inner.size() - start) as usize;
        trace!(index, start, len, "fetching block");
        let block = Arc::new(self.inner.read_range(start, len).await?);

        let mut blocks = self.blocks.lock();
        if blocks.len() == CACHED_BLOCKS {
            blocks.pop_front();
        }
        blocks.push_back((index, Arc::clone(&block)));
        Ok(block)
    }
}

#[async_trait]
impl<R: ReadAt> ReadAt for BlockCacheReader<R> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_bounds(self.location(), self.size(), offset, buf.len() as u64)?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let index = pos / self.block_size;
            let block = self.block(index).await?;

            let within = (pos - index * self.block_size) as usize;
            let n = (block.len() - within).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&block[within..within + n]);
            filled += n;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn location(&self) -> &str {
        self.inner.location()
    }

    fn transferred_bytes(&self) -> u64 {
        self.inner.transferred_bytes()
    }
}

use super::{Backend, ReadAt, check_bounds};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Opens local paths and `file://` URLs.
pub struct LocalBackend;

#[async_trait]
impl Backend for LocalBackend {
    async fn open(&self, location: &str) -> Result<Arc<dyn ReadAt>> {
        let path = local_path(location)?;
        Ok(Arc::new(LocalFileReader::new(&path)?))
    }
}

/// Local file reader with random access support
pub struct LocalFileReader {
    file: std::fs::File,
    location: String,
    size: u64,
    transferred_bytes: AtomicU64,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(path.display().to_string()),
            _ => Error::io(path, e),
        })?;
        let size = file.metadata().map_err(|e| Error::io(path, e))?.len();
        Ok(Self {
            file,
            location: path.display().to_string(),
            size,
            transferred_bytes: AtomicU64::new(0),
        })
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            self.file.seek_read(buf, offset)
        }

        #[cfg(not(any(unix, windows)))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            file.read(buf)
        }
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(&self.location, self.size, offset, buf.len() as u64)?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .pread(offset + filled as u64, &mut buf[filled..])
                .map_err(|e| Error::io(&self.location, e))?;
            if n == 0 {
                return Err(Error::corrupt(&self.location, "unexpected end of file"));
            }
            filled += n;
        }

        self.transferred_bytes
            .fetch_add(filled as u64, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }
}

/// `file://` URLs become paths, anything else is taken as a path already.
fn local_path(location: &str) -> Result<PathBuf> {
    if location.starts_with("file://") {
        let url = Url::parse(location)
            .map_err(|e| Error::InvalidInput(format!("invalid URL {location:?}: {e}")))?;
        return url
            .to_file_path()
            .map_err(|()| Error::InvalidInput(format!("not a local file URL: {location}")));
    }
    Ok(PathBuf::from(location))
}

//! Archive indexer.
//!
//! Reads the directory of a ZIP archive through any [`ReadAt`] source
//! without touching member data.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the locator and the ZIP64 EOCD
//! 3. Read the whole Central Directory in one request
//!
//! That is two reads for a plain archive and at most five in total, whatever
//! the archive size.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::structures::*;
use crate::error::{Error, Result};
use crate::fetch::{RetryPolicy, retry};
use crate::io::ReadAt;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Reads the directory of one archive.
///
/// ## Example
///
/// ```ignore
/// let parser = ZipParser::new(reader);
/// for entry in parser.list_entries().await? {
///     let offset = parser.data_offset(&entry).await?;
///     // Read compressed data from offset...
/// }
/// ```
pub struct ZipParser<R: ReadAt + ?Sized> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<R: ReadAt + ?Sized> ZipParser<R> {
    /// Create a parser that makes a single attempt per read.
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self {
            reader,
            size,
            retry: RetryPolicy::none(),
            cancel: CancellationToken::new(),
        }
    }

    /// Retry transient read failures under `policy`, giving up on `cancel`.
    pub fn with_retry(mut self, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        self.retry = policy;
        self.cancel = cancel;
        self
    }

    fn corrupt(&self, reason: impl std::fmt::Display) -> Error {
        Error::corrupt(self.reader.location(), reason)
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let reader = &self.reader;
        retry(&self.retry, &self.cancel, reader.location(), || {
            reader.read_range(offset, len)
        })
        .await
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Handles both the simple case (no comment) and archives with comments
    /// by searching backwards for the signature.
    ///
    /// # Returns
    ///
    /// A tuple of (EOCD record, offset of EOCD in file).
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        let eocd_size = EndOfCentralDirectory::SIZE as u64;
        if self.size < eocd_size {
            return Err(self.corrupt("too small to be a ZIP archive"));
        }

        // Common case: no archive comment, the record ends the file.
        let offset = self.size - eocd_size;
        let buf = self.read(offset, EndOfCentralDirectory::SIZE).await?;
        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && buf[20..22] == [0, 0] {
            let eocd = EndOfCentralDirectory::from_bytes(&buf).map_err(|e| self.corrupt(e))?;
            return Ok((eocd, offset));
        }

        let search_size = (MAX_COMMENT_SIZE + eocd_size).min(self.size);
        let search_start = self.size - search_size;
        let buf = self.read(search_start, search_size as usize).await?;

        // The comment length field must account for every remaining byte.
        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
                continue;
            }
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
            if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                let eocd = EndOfCentralDirectory::from_bytes(&buf[i..])
                    .map_err(|e| self.corrupt(e))?;
                return Ok((eocd, search_start + i as u64));
            }
        }

        Err(self.corrupt("end of central directory record not found"))
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD has saturated fields. Returns the record
    /// and its offset.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<(Zip64EOCD, u64)> {
        // The locator sits immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| self.corrupt("missing ZIP64 end of central directory locator"))?;
        let locator_buf = self.read(locator_offset, Zip64EOCDLocator::SIZE).await?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_buf).map_err(|e| self.corrupt(e))?;

        if locator.eocd64_offset + Zip64EOCD::MIN_SIZE as u64 > locator_offset {
            return Err(self.corrupt("ZIP64 end of central directory offset out of range"));
        }
        let eocd64_buf = self.read(locator.eocd64_offset, Zip64EOCD::MIN_SIZE).await?;
        let eocd64 = Zip64EOCD::from_bytes(&eocd64_buf).map_err(|e| self.corrupt(e))?;
        Ok((eocd64, locator.eocd64_offset))
    }

    /// List every entry of the archive, in directory order.
    #[instrument(level = "debug", skip(self), fields(location = %self.reader.location(), size = self.size))]
    pub async fn list_entries(&self) -> Result<Vec<DirectoryEntry>> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        // `directory_end` is where the directory must stop: the first
        // trailing record after it.
        let (cd_offset, cd_size, total_entries, directory_end) = if eocd.is_zip64() {
            let (eocd64, eocd64_offset) = self.read_zip64_eocd(eocd_offset).await?;
            (
                eocd64.cd_offset,
                eocd64.cd_size,
                eocd64.total_entries,
                eocd64_offset,
            )
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
                eocd_offset,
            )
        };

        match cd_offset.checked_add(cd_size) {
            Some(end) if end <= directory_end => {}
            _ => return Err(self.corrupt("central directory overlaps its trailing records")),
        }
        if total_entries.saturating_mul(CDFH_MIN_SIZE as u64) > cd_size {
            return Err(self.corrupt(format!(
                "{total_entries} entries cannot fit in a {cd_size} byte central directory"
            )));
        }
        if total_entries == 0 {
            return Ok(Vec::new());
        }

        let cd_len = usize::try_from(cd_size)
            .map_err(|_| self.corrupt("central directory too large"))?;
        let cd_data = self.read(cd_offset, cd_len).await?;

        let mut entries = Vec::with_capacity(total_entries as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for index in 0..total_entries {
            let entry = parse_cdfh(&mut cursor)
                .map_err(|e| self.corrupt(format!("central directory entry {index}: {e}")))?;
            match entry.local_header_offset.checked_add(entry.compressed_size) {
                Some(end) if end <= cd_offset => {}
                _ => {
                    return Err(self.corrupt(format!(
                        "entry {:?} extends past the start of the central directory",
                        entry.name
                    )));
                }
            }
            entries.push(entry);
        }

        debug!(entries = entries.len(), cd_offset, cd_size, "indexed archive");
        Ok(entries)
    }

    /// Read the fixed part of an entry's local header.
    pub async fn probe_local_header(&self, entry: &DirectoryEntry) -> Result<LocalHeaderProbe> {
        let buf = self.read(entry.local_header_offset, LFH_SIZE).await?;
        LocalHeaderProbe::from_bytes(&buf)
            .map_err(|e| self.corrupt(format!("{}: {e}", entry.name)))
    }

    /// Offset of the first byte of the entry's compressed data.
    ///
    /// The local header's name and extra field can differ in length from the
    /// central directory copy, so it has to be read.
    pub async fn data_offset(&self, entry: &DirectoryEntry) -> Result<u64> {
        let probe = self.probe_local_header(entry).await?;
        let data_offset = entry.local_header_offset + probe.header_len();
        if data_offset + entry.compressed_size > self.size {
            return Err(self.corrupt(format!("{}: data runs past end of archive", entry.name)));
        }
        Ok(data_offset)
    }

    /// Get a reference to the underlying reader.
    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }
}

/// Parse a Central Directory File Header from a cursor.
///
/// ZIP64 extra fields replace the saturated 32-bit sizes and offset.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> std::io::Result<DirectoryEntry> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if sig != CDFH_SIGNATURE {
        return Err(invalid("bad central directory header signature"));
    }

    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut local_header_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut name_bytes)?;
    // Non-UTF8 names are kept lossily
    let name = String::from_utf8_lossy(&name_bytes).into_owned();
    let is_directory = name.ends_with('/');

    let mut extra = vec![0u8; extra_field_length as usize];
    cursor.read_exact(&mut extra)?;
    let mut extra = Cursor::new(extra.as_slice());
    while extra.position() + 4 <= extra_field_length as u64 {
        let header_id = extra.read_u16::<LittleEndian>()?;
        let field_size = extra.read_u16::<LittleEndian>()? as u64;
        let field_end = extra.position() + field_size;
        if field_end > extra_field_length as u64 {
            return Err(invalid("extra field overruns its header"));
        }

        if header_id == ZIP64_EXTRA_ID {
            // Values are present only for the saturated header fields, in order
            if uncompressed_size == 0xFFFFFFFF && extra.position() + 8 <= field_end {
                uncompressed_size = extra.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && extra.position() + 8 <= field_end {
                compressed_size = extra.read_u64::<LittleEndian>()?;
            }
            if local_header_offset == 0xFFFFFFFF && extra.position() + 8 <= field_end {
                local_header_offset = extra.read_u64::<LittleEndian>()?;
            }
        }
        extra.set_position(field_end);
    }

    // Skip over the file comment
    let comment_end = cursor.position() + file_comment_length as u64;
    if comment_end > cursor.get_ref().len() as u64 {
        return Err(invalid("file comment runs past the central directory"));
    }
    cursor.set_position(comment_end);

    Ok(DirectoryEntry {
        name,
        compressed_size,
        uncompressed_size,
        local_header_offset,
        compression_method: CompressionMethod::from_u16(compression_method),
        crc32,
        flags,
        last_mod_time,
        last_mod_date,
        is_directory,
    })
}

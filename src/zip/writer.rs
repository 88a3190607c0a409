//! Single-entry ZIP containers around untouched compressed data.
//!
//! A fetched entry keeps its compressed bytes as they were in the source
//! archive. This module produces the framing around them:
//!
//! ```text
//! [local header][compressed data][central directory record]
//! [ZIP64 EOCD + locator, only when needed][EOCD]
//! ```
//!
//! The local header is rebuilt from the central directory values, so the
//! container never needs a data descriptor even when the source used one.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

use super::structures::*;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const ZIP64_EXTRA_LEN: u16 = 20;
const ZIP64_EOCD_RECORD_LEN: u64 = 44;

/// Framing of a container holding exactly one entry.
#[derive(Debug, Clone)]
pub struct SingleEntryContainer {
    name: String,
    entry: DirectoryEntry,
    zip64: bool,
}

impl SingleEntryContainer {
    /// The entry is stored under the last component of its archive name.
    pub fn new(entry: &DirectoryEntry) -> Self {
        let name = entry
            .name
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(&entry.name)
            .to_string();
        Self {
            name,
            zip64: entry.compressed_size >= 0xFFFFFFFF || entry.uncompressed_size >= 0xFFFFFFFF,
            entry: entry.clone(),
        }
    }

    /// Name of the single member.
    pub fn member_name(&self) -> &str {
        &self.name
    }

    fn version_needed(&self) -> u16 {
        if self.zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT }
    }

    fn flags(&self) -> u16 {
        self.entry.flags & !FLAG_DATA_DESCRIPTOR
    }

    fn saturated_sizes(&self) -> (u32, u32) {
        if self.zip64 {
            (0xFFFFFFFF, 0xFFFFFFFF)
        } else {
            (
                self.entry.compressed_size as u32,
                self.entry.uncompressed_size as u32,
            )
        }
    }

    fn extra_len(&self) -> u16 {
        if self.zip64 { ZIP64_EXTRA_LEN } else { 0 }
    }

    fn cd_offset(&self) -> u64 {
        self.local_header_len() + self.entry.compressed_size
    }

    fn cd_size(&self) -> u64 {
        CDFH_MIN_SIZE as u64 + self.name.len() as u64 + self.extra_len() as u64
    }

    fn needs_zip64_eocd(&self) -> bool {
        self.zip64 || self.cd_offset() >= 0xFFFFFFFF
    }

    /// Fields shared by the local header and the directory record, from
    /// flags to the name and extra lengths.
    fn write_common<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let (compressed, uncompressed) = self.saturated_sizes();
        out.write_u16::<LittleEndian>(self.flags())?;
        out.write_u16::<LittleEndian>(self.entry.compression_method.as_u16())?;
        out.write_u16::<LittleEndian>(self.entry.last_mod_time)?;
        out.write_u16::<LittleEndian>(self.entry.last_mod_date)?;
        out.write_u32::<LittleEndian>(self.entry.crc32)?;
        out.write_u32::<LittleEndian>(compressed)?;
        out.write_u32::<LittleEndian>(uncompressed)?;
        out.write_u16::<LittleEndian>(self.name.len() as u16)?;
        out.write_u16::<LittleEndian>(self.extra_len())
    }

    fn write_name_and_extra<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.name.as_bytes())?;
        if self.zip64 {
            out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            out.write_u16::<LittleEndian>(16)?;
            out.write_u64::<LittleEndian>(self.entry.uncompressed_size)?;
            out.write_u64::<LittleEndian>(self.entry.compressed_size)?;
        }
        Ok(())
    }

    /// Local file header, written at offset 0.
    pub fn local_header(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.local_header_len() as usize);
        buf.write_all(LFH_SIGNATURE)?;
        buf.write_u16::<LittleEndian>(self.version_needed())?;
        self.write_common(&mut buf)?;
        self.write_name_and_extra(&mut buf)?;
        Ok(buf)
    }

    pub fn local_header_len(&self) -> u64 {
        LFH_SIZE as u64 + self.name.len() as u64 + self.extra_len() as u64
    }

    /// Everything after the compressed data.
    pub fn trailer(&self) -> io::Result<Vec<u8>> {
        let cd_offset = self.cd_offset();
        let cd_size = self.cd_size();

        let mut buf = Vec::with_capacity(self.trailer_len() as usize);
        buf.write_all(CDFH_SIGNATURE)?;
        buf.write_u16::<LittleEndian>(self.version_needed())?; // made by
        buf.write_u16::<LittleEndian>(self.version_needed())?;
        self.write_common(&mut buf)?;
        buf.write_u16::<LittleEndian>(0)?; // comment length
        buf.write_u16::<LittleEndian>(0)?; // disk number start
        buf.write_u16::<LittleEndian>(0)?; // internal attributes
        buf.write_u32::<LittleEndian>(0)?; // external attributes
        buf.write_u32::<LittleEndian>(0)?; // local header offset
        self.write_name_and_extra(&mut buf)?;

        let zip64_eocd = self.needs_zip64_eocd();
        if zip64_eocd {
            buf.write_all(Zip64EOCD::SIGNATURE)?;
            buf.write_u64::<LittleEndian>(ZIP64_EOCD_RECORD_LEN)?;
            buf.write_u16::<LittleEndian>(VERSION_ZIP64)?;
            buf.write_u16::<LittleEndian>(VERSION_ZIP64)?;
            buf.write_u32::<LittleEndian>(0)?;
            buf.write_u32::<LittleEndian>(0)?;
            buf.write_u64::<LittleEndian>(1)?;
            buf.write_u64::<LittleEndian>(1)?;
            buf.write_u64::<LittleEndian>(cd_size)?;
            buf.write_u64::<LittleEndian>(cd_offset)?;

            buf.write_all(Zip64EOCDLocator::SIGNATURE)?;
            buf.write_u32::<LittleEndian>(0)?;
            buf.write_u64::<LittleEndian>(cd_offset + cd_size)?;
            buf.write_u32::<LittleEndian>(1)?;
        }

        buf.write_all(EndOfCentralDirectory::SIGNATURE)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(1)?;
        buf.write_u16::<LittleEndian>(1)?;
        buf.write_u32::<LittleEndian>(cd_size as u32)?;
        buf.write_u32::<LittleEndian>(if zip64_eocd { 0xFFFFFFFF } else { cd_offset as u32 })?;
        buf.write_u16::<LittleEndian>(0)?;
        Ok(buf)
    }

    fn trailer_len(&self) -> u64 {
        let zip64 = if self.needs_zip64_eocd() {
            (Zip64EOCD::MIN_SIZE + Zip64EOCDLocator::SIZE) as u64
        } else {
            0
        };
        self.cd_size() + zip64 + EndOfCentralDirectory::SIZE as u64
    }

    /// Size of the complete container.
    pub fn total_len(&self) -> u64 {
        self.cd_offset() + self.trailer_len()
    }
}

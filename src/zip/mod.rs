//! ZIP directory indexing and single-entry container framing.
//!
//! ## Architecture
//!
//! - [`structures`]: on-disk records (EOCD, ZIP64 records, directory entries)
//! - [`parser`]: reads the central directory through a [`ReadAt`](crate::io::ReadAt)
//!   handle with a handful of range reads
//! - [`writer`]: rebuilds a standalone archive around one entry's compressed bytes
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The EOCD is read first, then the Central Directory, so an archive can be
//! listed without reading its data. Local headers are only probed for the
//! entries that are fetched.
//!
//! ## Limitations
//!
//! - No multi-disk archive support
//! - Entry data is never decompressed or decrypted

mod parser;
mod structures;
mod writer;

pub use parser::ZipParser;
pub use structures::*;
pub use writer::SingleEntryContainer;

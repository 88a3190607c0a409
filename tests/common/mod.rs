//! Shared fixtures: Sentinel-1 shaped archives and in-memory range readers.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io::{Cursor, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use s1meta::fetch::RetryPolicy;
use s1meta::{Backend, Error, ReadAt, Result};
use wiremock::{Request, Respond, ResponseTemplate};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

pub const SLC_PRODUCT: &str =
    "S1A_IW_SLC__1SDV_20230222T051014_20230222T051042_047344_05AECF_FDD1";

/// One file of a fixture archive.
#[derive(Debug, Clone)]
pub struct FixtureEntry {
    pub name: String,
    pub content: Vec<u8>,
    pub stored: bool,
}

/// An archive built in memory.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub product: String,
    pub bytes: Vec<u8>,
    pub entries: Vec<FixtureEntry>,
}

impl Fixture {
    pub fn entry(&self, name: &str) -> &FixtureEntry {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("no fixture entry {name}"))
    }

    /// Write the archive as `<product>.zip` into `dir`.
    pub fn write_to(&self, dir: &Path) -> std::path::PathBuf {
        let path = dir.join(format!("{}.zip", self.product));
        std::fs::write(&path, &self.bytes).unwrap();
        path
    }
}

fn component(beam: &str, pol: &str, index: usize) -> String {
    format!(
        "s1a-{beam}-slc-{pol}-20230222t051015-20230222t051040-047344-05aecf-{index:03}"
    )
}

fn annotation_xml(kind: &str, beam: &str, pol: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{kind}><adsHeader><swath>{}</swath>\
         <polarisation>{}</polarisation></adsHeader>{}</{kind}>\n",
        beam.to_uppercase(),
        pol.to_uppercase(),
        "<vector>0.0 1.5 3.0</vector>".repeat(40),
    )
    .into_bytes()
}

/// Deterministic incompressible-looking bytes.
pub fn noise_bytes(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// An IW SLC product: manifest, annotation, calibration, noise and
/// measurement files for three swaths and two polarizations, plus a preview.
pub fn slc_fixture() -> Fixture {
    slc_fixture_with_measurement(4096)
}

pub fn slc_fixture_with_measurement(measurement_len: usize) -> Fixture {
    let root = format!("{SLC_PRODUCT}.SAFE");
    let mut entries = vec![FixtureEntry {
        name: format!("{root}/manifest.safe"),
        content: b"<?xml version=\"1.0\"?><xfdu:XFDU/>\n".repeat(20),
        stored: true,
    }];

    let mut index = 1;
    for beam in ["iw1", "iw2", "iw3"] {
        for pol in ["vh", "vv"] {
            let c = component(beam, pol, index);
            entries.push(FixtureEntry {
                name: format!("{root}/annotation/{c}.xml"),
                content: annotation_xml("product", beam, pol),
                stored: false,
            });
            entries.push(FixtureEntry {
                name: format!("{root}/annotation/calibration/calibration-{c}.xml"),
                content: annotation_xml("calibration", beam, pol),
                stored: false,
            });
            entries.push(FixtureEntry {
                name: format!("{root}/annotation/calibration/noise-{c}.xml"),
                content: annotation_xml("noise", beam, pol),
                stored: false,
            });
            entries.push(FixtureEntry {
                name: format!("{root}/measurement/{c}.tiff"),
                content: noise_bytes(measurement_len, index as u32),
                stored: true,
            });
            index += 1;
        }
    }
    entries.push(FixtureEntry {
        name: format!("{root}/preview/quick-look.png"),
        content: noise_bytes(512, 99),
        stored: true,
    });

    Fixture {
        product: SLC_PRODUCT.to_string(),
        bytes: build_zip(&root, &entries),
        entries,
    }
}

/// Write `entries` into a ZIP, with directory records for the usual SAFE
/// sub-directories.
pub fn build_zip(root: &str, entries: &[FixtureEntry]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for dir in ["", "/annotation", "/annotation/calibration", "/measurement", "/preview"] {
        writer.add_directory(format!("{root}{dir}/"), stored).unwrap();
    }
    for entry in entries {
        let options = if entry.stored { stored } else { deflated };
        writer.start_file(entry.name.as_str(), options).unwrap();
        writer.write_all(&entry.content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Relative paths of every file below `root`, '/'-separated.
pub fn list_files(root: &Path) -> BTreeSet<String> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeSet<String>) {
        let Ok(read) = std::fs::read_dir(dir) else {
            return;
        };
        for item in read {
            let path = item.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap();
                let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
                out.insert(parts.join("/"));
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(root, root, &mut out);
    out
}

/// Retries without waiting, so tests do not sleep.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO, 1.0)
}

/// In-memory [`ReadAt`] that counts reads and can inject transient failures.
pub struct MemoryReader {
    data: Vec<u8>,
    location: String,
    reads: AtomicUsize,
    transferred: AtomicU64,
    /// Number of upcoming reads that fail.
    fail_next: AtomicUsize,
    /// Reads starting inside this range always fail.
    fail_range: Mutex<Option<Range<u64>>>,
}

impl MemoryReader {
    pub fn new(location: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            data,
            location: location.into(),
            reads: AtomicUsize::new(0),
            transferred: AtomicU64::new(0),
            fail_next: AtomicUsize::new(0),
            fail_range: Mutex::new(None),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_reads_in(&self, range: Range<u64>) {
        *self.fail_range.lock() = Some(range);
    }
}

#[async_trait]
impl ReadAt for MemoryReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let in_range = self
            .fail_range
            .lock()
            .as_ref()
            .is_some_and(|r| r.contains(&offset));
        if failing || in_range {
            return Err(Error::transient(&self.location, "connection reset by peer"));
        }

        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::corrupt(&self.location, "read past end"));
        }
        buf.copy_from_slice(&self.data[start..end]);
        self.transferred
            .fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }
}

/// Backend serving one [`MemoryReader`] per location.
#[derive(Default)]
pub struct MemoryBackend {
    readers: Mutex<Vec<(String, Arc<MemoryReader>)>>,
}

impl MemoryBackend {
    pub fn insert(&self, location: &str, data: Vec<u8>) -> Arc<MemoryReader> {
        let reader = Arc::new(MemoryReader::new(location, data));
        self.readers
            .lock()
            .push((location.to_string(), Arc::clone(&reader)));
        reader
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self, location: &str) -> Result<Arc<dyn ReadAt>> {
        let readers = self.readers.lock();
        let reader = readers
            .iter()
            .find(|(l, _)| l == location)
            .map(|(_, r)| Arc::clone(r))
            .ok_or_else(|| Error::not_found(location))?;
        Ok(reader)
    }
}

/// Serves a byte buffer with `Range` semantics; the first `fail_first`
/// requests get `503`.
pub struct RangeResponder {
    body: Vec<u8>,
    fail_first: usize,
    requests: AtomicUsize,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self::flaky(body, 0)
    }

    pub fn flaky(body: Vec<u8>, fail_first: usize) -> Self {
        Self {
            body,
            fail_first,
            requests: AtomicUsize::new(0),
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return ResponseTemplate::new(503).set_body_string("service unavailable");
        }

        let Some((start, end)) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };
        let len = self.body.len() as u64;
        if start >= len {
            return ResponseTemplate::new(416);
        }
        let end = end.min(len - 1);
        ResponseTemplate::new(206)
            .insert_header("Content-Range", format!("bytes {start}-{end}/{len}").as_str())
            .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

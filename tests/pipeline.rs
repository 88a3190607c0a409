mod common;

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use s1meta::fetch::{FetchOptions, RetryPolicy};
use s1meta::{
    ArchiveJob, ArchiveStatus, Beam, DownloadResult, Downloader, Error, ErrorKind, OutputLayout,
    Polarization, ProductTree, ReadAt, Resolver, RunReport, SelectionCriteria, ZipParser,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn location(product: &str) -> String {
    format!("mem://archives/{product}.zip")
}

struct Setup {
    out: TempDir,
    reader: Arc<MemoryReader>,
    downloader: Downloader,
}

fn setup(fixture: &Fixture, criteria: SelectionCriteria, retry: RetryPolicy) -> Setup {
    setup_with(
        fixture,
        criteria,
        FetchOptions {
            block_size: 1024,
            retry,
            ..FetchOptions::default()
        },
    )
}

fn setup_with(fixture: &Fixture, criteria: SelectionCriteria, options: FetchOptions) -> Setup {
    let backend = MemoryBackend::default();
    let reader = backend.insert(&location(&fixture.product), fixture.bytes.clone());
    let out = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(Arc::new(backend), criteria, OutputLayout::new(out.path()))
        .with_options(options);
    Setup {
        out,
        reader,
        downloader,
    }
}

async fn run(setup: &Setup, product: &str) -> RunReport {
    setup
        .downloader
        .download(vec![ArchiveJob::new(location(product))])
        .await
}

fn file_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn root(fixture: &Fixture) -> String {
    format!("{}.SAFE", fixture.product)
}

fn annotation(fixture: &Fixture, beam: &str, pol: &str, index: usize) -> String {
    format!(
        "{}/annotation/s1a-{beam}-slc-{pol}-20230222t051015-20230222t051040-047344-05aecf-{index:03}.xml",
        root(fixture)
    )
}

#[tokio::test]
async fn test_default_selection_is_manifest_and_annotations() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));

    let report = run(&setup, &fixture.product).await;
    assert!(!report.has_failures(), "{:?}", report.failures());
    assert!(matches!(report.archives[0].status, ArchiveStatus::Completed));

    let manifest = format!("{}/manifest.safe", root(&fixture));
    let mut wanted = vec![manifest.clone()];
    let mut index = 1;
    for beam in ["iw1", "iw2", "iw3"] {
        for pol in ["vh", "vv"] {
            wanted.push(annotation(&fixture, beam, pol, index));
            index += 1;
        }
    }
    let wanted: Vec<&str> = wanted.iter().map(String::as_str).collect();
    assert_eq!(list_files(setup.out.path()), file_set(&wanted));

    // Results follow archive order, manifest first.
    let names: Vec<_> = report.archives[0]
        .entries
        .iter()
        .map(DownloadResult::entry)
        .collect();
    assert_eq!(names, wanted);
    assert_eq!(report.totals.fetched, 7);
    assert_eq!(report.totals.archives, 1);

    // Stored entries are written as-is, deflated ones decompressed.
    for name in &wanted {
        let written = std::fs::read(setup.out.path().join(name)).unwrap();
        assert_eq!(written, fixture.entry(name).content, "{name}");
    }
    assert!(fixture.entry(&manifest).stored);
    assert!(!fixture.entry(wanted[1]).stored);
}

#[tokio::test]
async fn test_beam_and_polarization_filters() {
    let fixture = slc_fixture();
    let criteria = SelectionCriteria {
        calibration: true,
        noise: true,
        beam: Some(Beam::Iw2),
        polarization: Some(Polarization::Vv),
        ..SelectionCriteria::default()
    };
    let setup = setup(&fixture, criteria, fast_retry(3));

    let report = run(&setup, &fixture.product).await;
    assert!(!report.has_failures());

    let root = root(&fixture);
    let c = "s1a-iw2-slc-vv-20230222t051015-20230222t051040-047344-05aecf-004";
    let wanted = [
        format!("{root}/manifest.safe"),
        format!("{root}/annotation/{c}.xml"),
        format!("{root}/annotation/calibration/calibration-{c}.xml"),
        format!("{root}/annotation/calibration/noise-{c}.xml"),
    ];
    let wanted: Vec<&str> = wanted.iter().map(String::as_str).collect();
    assert_eq!(list_files(setup.out.path()), file_set(&wanted));
}

#[tokio::test]
async fn test_measurement_files_are_copied_verbatim() {
    let fixture = slc_fixture_with_measurement(10_000);
    let criteria = SelectionCriteria {
        annotation: false,
        measurement: true,
        beam: Some(Beam::Iw1),
        polarization: Some(Polarization::Vh),
        ..SelectionCriteria::default()
    };
    let setup = setup(&fixture, criteria, fast_retry(3));

    let report = run(&setup, &fixture.product).await;
    assert!(!report.has_failures());

    let tiff = format!(
        "{}/measurement/s1a-iw1-slc-vh-20230222t051015-20230222t051040-047344-05aecf-001.tiff",
        root(&fixture)
    );
    let written = std::fs::read(setup.out.path().join(&tiff)).unwrap();
    assert_eq!(written, fixture.entry(&tiff).content);
    assert_eq!(list_files(setup.out.path()).len(), 2);
}

#[tokio::test]
async fn test_container_matches_direct_extraction() {
    let fixture = slc_fixture();
    let options = FetchOptions {
        block_size: 1024,
        retry: fast_retry(3),
        keep_compressed: true,
    };
    let setup = setup_with(&fixture, SelectionCriteria::default(), options);
    let report = run(&setup, &fixture.product).await;
    assert!(!report.has_failures(), "{:?}", report.failures());

    // The stored manifest is still a plain file.
    let manifest = format!("{}/manifest.safe", root(&fixture));
    assert!(list_files(setup.out.path()).contains(&manifest));

    let name = annotation(&fixture, "iw3", "vh", 5);
    let container = std::fs::read(setup.out.path().join(format!("{name}.zip"))).unwrap();

    let mut source = zip::ZipArchive::new(Cursor::new(fixture.bytes.clone())).unwrap();
    let mut rebuilt = zip::ZipArchive::new(Cursor::new(container)).unwrap();
    assert_eq!(rebuilt.len(), 1);

    {
        let original = source.by_name(&name).unwrap();
        let member = rebuilt.by_index_raw(0).unwrap();
        assert_eq!(member.name(), name.rsplit('/').next().unwrap());
        assert_eq!(member.compressed_size(), original.compressed_size());
        assert_eq!(member.size(), original.size());
        assert_eq!(member.crc32(), original.crc32());
        assert_eq!(member.compression(), original.compression());
    }

    let mut expected = Vec::new();
    source
        .by_name(&name)
        .unwrap()
        .read_to_end(&mut expected)
        .unwrap();
    let mut content = Vec::new();
    rebuilt.by_index(0).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, expected);
    assert_eq!(content, fixture.entry(&name).content);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));

    let first = run(&setup, &fixture.product).await;
    assert_eq!(first.totals.fetched, 7);
    let files = list_files(setup.out.path());
    let reads_before = setup.reader.reads();

    let second = run(&setup, &fixture.product).await;
    assert!(!second.has_failures());
    assert_eq!(second.totals.already_present, 7);
    assert_eq!(second.totals.fetched, 0);
    assert_eq!(second.totals.bytes, 0);
    assert!(
        second.archives[0]
            .entries
            .iter()
            .all(|r| matches!(r, DownloadResult::AlreadyPresent { .. }))
    );
    assert_eq!(list_files(setup.out.path()), files);
    // Only the directory is read again.
    assert!(setup.reader.reads() - reads_before <= 5);
}

#[tokio::test]
async fn test_truncated_output_is_replaced() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));
    run(&setup, &fixture.product).await;

    let manifest = format!("{}/manifest.safe", root(&fixture));
    let path = setup.out.path().join(&manifest);
    std::fs::write(&path, b"partial").unwrap();

    let report = run(&setup, &fixture.product).await;
    assert_eq!(report.totals.fetched, 1);
    assert_eq!(report.totals.already_present, 6);
    assert_eq!(std::fs::read(&path).unwrap(), fixture.entry(&manifest).content);
}

#[tokio::test]
async fn test_indexing_large_archive_reads_little() {
    let fixture = slc_fixture_with_measurement(1 << 20);
    let size = fixture.bytes.len() as u64;
    let reader = Arc::new(MemoryReader::new("mem://large.zip", fixture.bytes.clone()));

    let entries = ZipParser::new(Arc::clone(&reader)).list_entries().await.unwrap();
    let files: Vec<_> = entries.iter().filter(|e| !e.is_directory).collect();
    assert_eq!(files.len(), fixture.entries.len());
    assert!(reader.reads() <= 5, "{} reads", reader.reads());
    assert!(reader.transferred_bytes() < 70 * 1024);
    assert!(reader.transferred_bytes() * 50 < size);
}

#[tokio::test]
async fn test_transient_failures_within_budget() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));
    setup.reader.fail_next(2);

    let report = run(&setup, &fixture.product).await;
    assert!(!report.has_failures(), "{:?}", report.failures());
    assert_eq!(report.totals.fetched, 7);
}

fn manifest_header_offset(fixture: &Fixture) -> u64 {
    let mut archive = zip::ZipArchive::new(Cursor::new(fixture.bytes.clone())).unwrap();
    let name = format!("{}/manifest.safe", root(fixture));
    archive.by_name(&name).unwrap().header_start()
}

#[tokio::test]
async fn test_failure_beyond_budget_leaves_no_file() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(2));
    let header = manifest_header_offset(&fixture);
    setup.reader.fail_reads_in(header..header + 1);

    let report = run(&setup, &fixture.product).await;
    assert!(report.has_failures());
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].item.ends_with("manifest.safe"));
    assert_eq!(failures[0].error.kind(), ErrorKind::TransientIo);

    let files = list_files(setup.out.path());
    assert_eq!(files.len(), 6);
    assert!(files.iter().all(|f| !f.ends_with("manifest.safe")));
    assert!(files.iter().all(|f| !f.ends_with(".part")));
    assert_eq!(report.totals.failed, 1);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));
    setup.downloader.cancel_token().cancel();

    let report = run(&setup, &fixture.product).await;
    assert!(report.was_cancelled());
    assert!(report.archives[0].entries.is_empty());
    assert!(list_files(setup.out.path()).is_empty());
    assert_eq!(setup.reader.reads(), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_backoff_and_discards_part() {
    let fixture = slc_fixture();
    let slow = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30), 1.0);
    let setup = setup(&fixture, SelectionCriteria::default(), slow);
    let header = manifest_header_offset(&fixture);
    setup.reader.fail_reads_in(header..header + 1);

    let cancel = setup.downloader.cancel_token();
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    };
    let (report, ()) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(run(&setup, &fixture.product), canceller) },
    )
    .await
    .expect("cancellation must end the backoff sleep");

    assert!(matches!(report.archives[0].status, ArchiveStatus::Cancelled));
    let manifest = &report.archives[0].entries[0];
    assert!(matches!(manifest, DownloadResult::Skipped { .. }));
    let files = list_files(setup.out.path());
    assert!(files.iter().all(|f| !f.ends_with("manifest.safe")));
    assert!(files.iter().all(|f| !f.ends_with(".part")));
}

#[tokio::test]
async fn test_corrupt_archive_fails_only_that_archive() {
    let fixture = slc_fixture();
    let backend = MemoryBackend::default();
    backend.insert(&location(&fixture.product), fixture.bytes.clone());
    backend.insert(&location("S1B_IW_SLC__BROKEN"), b"definitely not a zip archive".to_vec());
    let out = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(
        Arc::new(backend),
        SelectionCriteria::default(),
        OutputLayout::new(out.path()),
    );

    let report = downloader
        .download(vec![
            ArchiveJob::new(location("S1B_IW_SLC__BROKEN")),
            ArchiveJob::new(location(&fixture.product)),
            ArchiveJob::new(location("S1A_IW_SLC__MISSING")),
        ])
        .await;

    assert!(report.has_failures());
    match &report.archives[0].status {
        ArchiveStatus::Failed(e) => assert_eq!(e.kind(), ErrorKind::CorruptArchive),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(matches!(report.archives[1].status, ArchiveStatus::Completed));
    match &report.archives[2].status {
        ArchiveStatus::Failed(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(list_files(out.path()).len(), 7);
}

#[tokio::test]
async fn test_archive_without_matches() {
    let root = "S1A_IW_SLC__1SDV_NOMATCH.SAFE";
    let bytes = build_zip(
        root,
        &[FixtureEntry {
            name: format!("{root}/preview/quick-look.png"),
            content: noise_bytes(64, 1),
            stored: true,
        }],
    );
    let backend = MemoryBackend::default();
    backend.insert(&location("S1A_IW_SLC__1SDV_NOMATCH"), bytes);
    let out = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(
        Arc::new(backend),
        SelectionCriteria::default(),
        OutputLayout::new(out.path()),
    );

    let report = downloader
        .download(vec![ArchiveJob::new(location("S1A_IW_SLC__1SDV_NOMATCH"))])
        .await;
    assert!(matches!(report.archives[0].status, ArchiveStatus::NoMatch));
    assert!(!report.has_failures());
    assert!(list_files(out.path()).is_empty());
}

struct StaticResolver(HashMap<String, String>);

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, product: &str) -> s1meta::Result<String> {
        self.0
            .get(product)
            .cloned()
            .ok_or_else(|| Error::not_found(product))
    }
}

#[tokio::test]
async fn test_products_resolved_per_key() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));
    let resolver = StaticResolver(HashMap::from([(
        fixture.product.clone(),
        location(&fixture.product),
    )]));
    let tree = ProductTree::from([(
        "track/22".to_string(),
        vec![fixture.product.clone(), "S1B_IW_SLC__1SDV_GONE".to_string()],
    )]);

    let report = setup.downloader.download_products(&resolver, &tree).await;
    assert!(report.has_failures());
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(report.unresolved[0].product, "S1B_IW_SLC__1SDV_GONE");
    assert_eq!(report.unresolved[0].error.kind(), ErrorKind::NotFound);

    let files = list_files(setup.out.path());
    assert_eq!(files.len(), 7);
    let prefix = format!("track/22/{}/", root(&fixture));
    assert!(files.iter().all(|f| f.starts_with(&prefix)), "{files:?}");
}

/// Archive without a product root directory, every member deflated.
fn rootless_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn test_deflated_entries_are_written_at_their_own_path() {
    let manifest = b"<?xml version=\"1.0\"?><xfdu:XFDU/>\n".repeat(30);
    let iw1 = b"<product><swath>IW1</swath></product>\n".repeat(30);
    let iw2 = b"<product><swath>IW2</swath></product>\n".repeat(30);
    let bytes = rootless_archive(&[
        ("manifest.safe", manifest.as_slice()),
        ("annotation/iw1-vv.xml", iw1.as_slice()),
        ("annotation/iw2-vv.xml", iw2.as_slice()),
    ]);
    let backend = MemoryBackend::default();
    backend.insert(&location("S1A_IW_SLC"), bytes);
    let out = tempfile::tempdir().unwrap();
    let criteria = SelectionCriteria {
        beam: Some(Beam::Iw1),
        ..SelectionCriteria::default()
    };
    let downloader = Downloader::new(Arc::new(backend), criteria, OutputLayout::new(out.path()));

    let report = downloader
        .download(vec![ArchiveJob::new(location("S1A_IW_SLC"))])
        .await;
    assert!(!report.has_failures(), "{:?}", report.failures());
    assert_eq!(
        list_files(out.path()),
        file_set(&["annotation/iw1-vv.xml", "manifest.safe"])
    );
    assert_eq!(std::fs::read(out.path().join("manifest.safe")).unwrap(), manifest);
    assert_eq!(
        std::fs::read(out.path().join("annotation/iw1-vv.xml")).unwrap(),
        iw1
    );
}

#[tokio::test]
async fn test_repeated_archive_is_processed_once() {
    let fixture = slc_fixture_with_measurement(10_000);
    let criteria = SelectionCriteria {
        measurement: true,
        ..SelectionCriteria::default()
    };
    let setup = setup(&fixture, criteria, fast_retry(3));
    let downloader = setup.downloader.with_concurrency(8);
    let loc = location(&fixture.product);

    let report = downloader
        .download(vec![ArchiveJob::new(loc.clone()), ArchiveJob::new(loc)])
        .await;
    assert!(!report.has_failures(), "{:?}", report.failures());
    assert_eq!(report.archives.len(), 1);
    assert_eq!(report.totals.fetched, 13);

    let files = list_files(setup.out.path());
    assert_eq!(files.len(), 13);
    for name in &files {
        let written = std::fs::read(setup.out.path().join(name)).unwrap();
        assert_eq!(written, fixture.entry(name).content, "{name}");
    }
}

#[tokio::test]
async fn test_same_archive_under_two_keys() {
    let fixture = slc_fixture();
    let setup = setup(&fixture, SelectionCriteria::default(), fast_retry(3));
    let loc = location(&fixture.product);

    let report = setup
        .downloader
        .download(vec![
            ArchiveJob::new(loc.clone()).with_key("a"),
            ArchiveJob::new(loc).with_key("b"),
        ])
        .await;
    assert!(!report.has_failures(), "{:?}", report.failures());
    assert_eq!(report.archives.len(), 2);
    assert_eq!(report.totals.fetched, 14);
    assert_eq!(report.totals.archives, 2);

    let files = list_files(setup.out.path());
    assert_eq!(files.iter().filter(|f| f.starts_with("a/")).count(), 7);
    assert_eq!(files.iter().filter(|f| f.starts_with("b/")).count(), 7);
}

#[tokio::test]
async fn test_archives_sharing_an_output_path() {
    let backend = MemoryBackend::default();
    backend.insert(
        &location("S1A_IW_SLC__A"),
        rootless_archive(&[
            ("manifest.safe", b"<xfdu:XFDU>a</xfdu:XFDU>".as_slice()),
            ("annotation/iw1-vv.xml", b"<product/>".as_slice()),
        ]),
    );
    backend.insert(
        &location("S1A_IW_SLC__B"),
        rootless_archive(&[("manifest.safe", b"<xfdu:XFDU>b</xfdu:XFDU>".as_slice())]),
    );
    let out = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(
        Arc::new(backend),
        SelectionCriteria::default(),
        OutputLayout::new(out.path()),
    )
    .with_concurrency(8);

    let report = downloader
        .download(vec![
            ArchiveJob::new(location("S1A_IW_SLC__A")),
            ArchiveJob::new(location("S1A_IW_SLC__B")),
        ])
        .await;

    let failures = report.failures();
    assert_eq!(failures.len(), 1, "{failures:?}");
    assert!(failures[0].item.ends_with("!manifest.safe"));
    assert_eq!(failures[0].error.kind(), ErrorKind::PathConflict);
    assert_eq!(report.totals.fetched, 2);
    assert_eq!(report.totals.failed, 1);

    assert_eq!(
        list_files(out.path()),
        file_set(&["annotation/iw1-vv.xml", "manifest.safe"])
    );
    let manifest = std::fs::read(out.path().join("manifest.safe")).unwrap();
    assert!(
        manifest == b"<xfdu:XFDU>a</xfdu:XFDU>" || manifest == b"<xfdu:XFDU>b</xfdu:XFDU>"
    );
}

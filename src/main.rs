//! Main entry point for the s1meta CLI application.
//!
//! Resolves products (or takes archive locations directly with `--urls`),
//! downloads the selected metadata entries and reports what failed.

use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use s1meta::input::{load_product_lists, merge_trees, products_from_args};
use s1meta::{
    ArchiveJob, AsfCatalog, Cli, Downloader, OutputLayout, RunReport, resolve_credentials,
};

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse before tracing so --help works without logs
    let cli = Cli::parse();

    // RUST_LOG wins over the command line
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(backend = cli.backend.as_str(), urls = cli.urls, "arguments parsed");

    if cli.inputs.is_empty() && cli.file_list.is_empty() {
        bail!("no products given, pass product names or --file-list");
    }

    let credentials = resolve_credentials(
        cli.username.clone(),
        cli.password.clone(),
        cli.netrc.clone(),
    )?;
    let backend = cli.backend.build(credentials, cli.block_size_bytes())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, finishing in-flight reads");
            on_interrupt.cancel();
        }
    });

    let downloader = Downloader::new(backend, cli.criteria(), OutputLayout::new(&cli.outdir))
        .with_options(cli.fetch_options())
        .with_concurrency(cli.concurrency)
        .with_product_kind(cli.product_kind)
        .with_cancel_token(cancel.clone())
        .with_progress(cli.show_progress());

    let report = if cli.urls {
        let jobs = cli.inputs.iter().map(ArchiveJob::new).collect();
        downloader.download(jobs).await
    } else {
        let mut products = products_from_args(&cli.inputs);
        merge_trees(&mut products, load_product_lists(&cli.file_list)?);
        products.retain(|_, names| !names.is_empty());
        let catalog = AsfCatalog::new()?.with_retry(cli.fetch_options().retry, cancel.clone());
        downloader.download_products(&catalog, &products).await
    };

    print_summary(&report);

    if cancel.is_cancelled() || report.was_cancelled() {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if report.has_failures() {
        return Ok(ExitCode::from(EXIT_FAILURE));
    }
    Ok(ExitCode::SUCCESS)
}

/// Log the totals and every failure.
fn print_summary(report: &RunReport) {
    let totals = &report.totals;
    info!(
        archives = totals.archives,
        fetched = totals.fetched,
        already_present = totals.already_present,
        failed = totals.failed,
        skipped = totals.skipped,
        bytes = totals.bytes,
        "run finished"
    );

    let failures = report.failures();
    if failures.is_empty() {
        return;
    }
    error!(count = failures.len(), "run finished with failures");
    eprintln!("{} item(s) failed:", failures.len());
    for failure in failures {
        eprintln!("  {}: {}", failure.item, failure.error);
    }
}

use std::path::PathBuf;

use clap::Parser;
use clap::builder::TypedValueParser;

use crate::fetch::{FetchOptions, RetryPolicy};
use crate::io::BackendKind;
use crate::run::DEFAULT_CONCURRENCY;
use crate::select::{Beam, Polarization, ProductKind, SelectionCriteria};

#[derive(Parser, Debug)]
#[command(name = "s1meta")]
#[command(version)]
#[command(about = "Download Sentinel-1 metadata from remote product archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  s1meta S1A_IW_SLC__1SDV_20230222T051014_20230222T051042_047344_05AECF_FDD1\n  \
  s1meta -f products.json -o out --cal --noise -b iw1 --pol vv\n  \
  s1meta --urls https://datapool.asf.alaska.edu/SLC/SA/S1A_IW_SLC__1SDV_...zip")]
pub struct Cli {
    /// Product names, or archive URLs/paths with --urls
    #[arg(value_name = "INPUT")]
    pub inputs: Vec<String>,

    /// Read product names from FILE (text, one per line, or JSON)
    #[arg(short = 'f', long = "file-list", value_name = "FILE", conflicts_with = "urls")]
    pub file_list: Vec<PathBuf>,

    /// Treat inputs as archive URLs or local paths instead of product names
    #[arg(long)]
    pub urls: bool,

    /// Output directory
    #[arg(short = 'o', long = "outdir", value_name = "DIR", default_value = ".")]
    pub outdir: PathBuf,

    /// Username for the data server
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password for the data server
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// netrc file used when no username/password is given
    #[arg(long, value_name = "FILE")]
    pub netrc: Option<PathBuf>,

    /// Size of range reads in KiB
    #[arg(long = "block-size", value_name = "KiB", default_value_t = 256,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub block_size: u64,

    /// Only fetch files of this beam
    #[arg(short = 'b', long, ignore_case = true)]
    pub beam: Option<Beam>,

    /// Only fetch files of this polarization
    #[arg(long = "pol", ignore_case = true)]
    pub polarization: Option<Polarization>,

    /// Also fetch calibration annotations
    #[arg(short = 'c', long = "cal")]
    pub calibration: bool,

    /// Also fetch noise annotations
    #[arg(short = 'n', long)]
    pub noise: bool,

    /// Also fetch RFI annotations
    #[arg(short = 'r', long)]
    pub rfi: bool,

    /// Also fetch measurement data files
    #[arg(long = "data")]
    pub measurement: bool,

    /// Write compressed files as single-file .zip archives instead of
    /// decompressing them
    #[arg(long = "keep-compressed")]
    pub keep_compressed: bool,

    /// Do not fetch product annotations
    #[arg(long = "no-annotation")]
    pub no_annotation: bool,

    /// Product kind of every input instead of inferring it from the name
    #[arg(long = "product-kind", ignore_case = true)]
    pub product_kind: Option<ProductKind>,

    /// Range backend
    #[arg(long, env = "S1META_BACKEND", default_value = "buffered")]
    pub backend: BackendKind,

    /// Maximum concurrent range operations
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY,
          value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    pub concurrency: usize,

    /// Attempts per read, including the first one
    #[arg(long, default_value_t = crate::fetch::DEFAULT_MAX_ATTEMPTS,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    /// Disable progress bars
    #[arg(long)]
    pub noprogress: bool,

    /// Log level
    #[arg(long, value_name = "LEVEL", ignore_case = true,
          value_parser = ["error", "warn", "info", "debug", "trace"])]
    pub loglevel: Option<String>,

    /// Only report errors
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "debug"])]
    pub quiet: bool,

    /// Report progress of each archive
    #[arg(short = 'v', long, conflicts_with = "debug")]
    pub verbose: bool,

    /// Debug output
    #[arg(short = 'd', long)]
    pub debug: bool,
}

impl Cli {
    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            annotation: !self.no_annotation,
            calibration: self.calibration,
            noise: self.noise,
            rfi: self.rfi,
            measurement: self.measurement,
            beam: self.beam,
            polarization: self.polarization,
        }
    }

    pub fn block_size_bytes(&self) -> usize {
        (self.block_size as usize).saturating_mul(1024)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            block_size: self.block_size_bytes(),
            retry: RetryPolicy::with_max_attempts(self.retries),
            keep_compressed: self.keep_compressed,
        }
    }

    /// Level directive for the log filter; `--loglevel` wins over the flags.
    pub fn log_level(&self) -> &str {
        if let Some(level) = &self.loglevel {
            return level;
        }
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else if self.quiet {
            "error"
        } else {
            "warn"
        }
    }

    pub fn show_progress(&self) -> bool {
        !self.noprogress && !self.quiet
    }
}

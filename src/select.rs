//! Entry selection rules.
//!
//! Entry names are decomposed structurally instead of being glob-matched:
//!
//! ```text
//! [S1*.SAFE/] <dirs...> / <file>
//! ```
//!
//! and product component files are split on `-`:
//!
//! ```text
//! SAFE layout  s1a-iw1-slc-vv-20230222t051015-...-004.xml
//!              mission-beam-type-pol-rest...
//! RAW layout   s1a-iw-raw-s-vv-20230222t051014-...-index.dat
//!              mission-beam-type-class-pol-rest...
//! ```
//!
//! Beam and polarization are only ever compared in those positions. Archives
//! repackaged without the `.SAFE` root and the abbreviated `<beam>-<pol>`
//! component form (`iw1-vv.xml`) are accepted too.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};
use crate::zip::DirectoryEntry;

/// Families of files inside a product archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Manifest,
    Annotation,
    Calibration,
    Noise,
    Rfi,
    Measurement,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Manifest => "manifest",
            Category::Annotation => "annotation",
            Category::Calibration => "calibration",
            Category::Noise => "noise",
            Category::Rfi => "rfi",
            Category::Measurement => "measurement",
        }
    }

    /// Whether beam and polarization filters apply to this family.
    fn is_component(&self) -> bool {
        !matches!(self, Category::Manifest)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Radar beam (swath) identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Beam {
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    Iw1,
    Iw2,
    Iw3,
    Ew1,
    Ew2,
    Ew3,
    Ew4,
    Ew5,
    Wv1,
    Wv2,
}

impl Beam {
    pub const ALL: [Beam; 16] = [
        Beam::S1,
        Beam::S2,
        Beam::S3,
        Beam::S4,
        Beam::S5,
        Beam::S6,
        Beam::Iw1,
        Beam::Iw2,
        Beam::Iw3,
        Beam::Ew1,
        Beam::Ew2,
        Beam::Ew3,
        Beam::Ew4,
        Beam::Ew5,
        Beam::Wv1,
        Beam::Wv2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Beam::S1 => "s1",
            Beam::S2 => "s2",
            Beam::S3 => "s3",
            Beam::S4 => "s4",
            Beam::S5 => "s5",
            Beam::S6 => "s6",
            Beam::Iw1 => "iw1",
            Beam::Iw2 => "iw2",
            Beam::Iw3 => "iw3",
            Beam::Ew1 => "ew1",
            Beam::Ew2 => "ew2",
            Beam::Ew3 => "ew3",
            Beam::Ew4 => "ew4",
            Beam::Ew5 => "ew5",
            Beam::Wv1 => "wv1",
            Beam::Wv2 => "wv2",
        }
    }
}

impl fmt::Display for Beam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Beam {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Beam::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown beam {s:?}")))
    }
}

/// Polarization channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Polarization {
    Vv,
    Vh,
    Hv,
    Hh,
}

impl Polarization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarization::Vv => "vv",
            Polarization::Vh => "vh",
            Polarization::Hv => "hv",
            Polarization::Hh => "hh",
        }
    }
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Polarization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vv" => Ok(Polarization::Vv),
            "vh" => Ok(Polarization::Vh),
            "hv" => Ok(Polarization::Hv),
            "hh" => Ok(Polarization::Hh),
            _ => Err(Error::InvalidInput(format!("unknown polarization {s:?}"))),
        }
    }
}

/// Product level; decides where measurement files live and how they are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ProductKind {
    #[default]
    Slc,
    Grd,
    Raw,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Slc => "slc",
            ProductKind::Grd => "grd",
            ProductKind::Raw => "raw",
        }
    }

    /// Read the kind from the product type field of a product name
    /// (`S1A_IW_SLC__1SDV_...`, `S1B_EW_GRDM_1SDH_...`, `S1A_S3_RAW__0SSV_...`).
    ///
    /// Accepts archive file names and URLs as well.
    pub fn infer(name: &str) -> Option<Self> {
        let stem = name.rsplit('/').next().unwrap_or(name);
        let field = stem.split('_').nth(2)?;
        if field == "SLC" {
            Some(ProductKind::Slc)
        } else if field.starts_with("GRD") {
            Some(ProductKind::Grd)
        } else if field == "RAW" {
            Some(ProductKind::Raw)
        } else {
            None
        }
    }

    /// [`ProductKind::infer`], falling back to SLC with a warning.
    pub fn infer_or_default(name: &str) -> Self {
        Self::infer(name).unwrap_or_else(|| {
            warn!(product = name, "cannot infer product kind from name, assuming SLC");
            ProductKind::default()
        })
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to fetch. The manifest is always included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub annotation: bool,
    pub calibration: bool,
    pub noise: bool,
    pub rfi: bool,
    pub measurement: bool,
    pub beam: Option<Beam>,
    pub polarization: Option<Polarization>,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self {
            annotation: true,
            calibration: false,
            noise: false,
            rfi: false,
            measurement: false,
            beam: None,
            polarization: None,
        }
    }
}

impl SelectionCriteria {
    /// Enabled categories, manifest first.
    pub fn categories(&self) -> Vec<Category> {
        let flags = [
            (true, Category::Manifest),
            (self.annotation, Category::Annotation),
            (self.calibration, Category::Calibration),
            (self.noise, Category::Noise),
            (self.rfi, Category::Rfi),
            (self.measurement, Category::Measurement),
        ];
        flags
            .into_iter()
            .filter_map(|(on, category)| on.then_some(category))
            .collect()
    }
}

/// Entry name split into its directories and file name, product root removed.
struct EntryPath<'a> {
    dirs: Vec<&'a str>,
    file: &'a str,
}

impl<'a> EntryPath<'a> {
    fn parse(name: &'a str) -> Option<Self> {
        let mut parts: Vec<&str> = name.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        if parts.len() > 1 && is_product_root(parts[0]) {
            parts.remove(0);
        }
        let file = parts.pop()?;
        Some(Self { dirs: parts, file })
    }

    fn in_dir(&self, dirs: &[&str]) -> bool {
        self.dirs == dirs
    }
}

fn is_product_root(dir: &str) -> bool {
    dir.starts_with("S1") && dir.ends_with(".SAFE")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Layout {
    Safe,
    Raw,
}

/// Beam and polarization fields of a component file stem.
struct Component<'a> {
    beam: &'a str,
    pol: &'a str,
}

impl<'a> Component<'a> {
    fn parse(stem: &'a str, layout: Layout) -> Option<Self> {
        let fields: Vec<&str> = stem.split('-').collect();
        let is_mission = |f: &str| f.len() == 3 && f.starts_with("s1");

        let (beam, pol) = match layout {
            Layout::Safe if fields.len() >= 5 && is_mission(fields[0]) && fields[2].len() == 3 => {
                (fields[1], fields[3])
            }
            Layout::Safe if fields.len() == 2 => (fields[0], fields[1]),
            Layout::Raw
                if fields.len() >= 6
                    && is_mission(fields[0])
                    && fields[2].len() == 3
                    && fields[3].len() == 1 =>
            {
                (fields[1], fields[4])
            }
            _ => return None,
        };
        (!beam.is_empty() && pol.len() == 2).then_some(Self { beam, pol })
    }
}

/// One category's name shape, optionally narrowed to a beam and polarization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    category: Category,
    kind: ProductKind,
    beam: Option<Beam>,
    polarization: Option<Polarization>,
}

impl MatchRule {
    pub fn new(
        category: Category,
        kind: ProductKind,
        beam: Option<Beam>,
        polarization: Option<Polarization>,
    ) -> Self {
        let (beam, polarization) = if category.is_component() {
            (beam, polarization)
        } else {
            (None, None)
        };
        Self {
            category,
            kind,
            beam,
            polarization,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Test an entry name against the rule.
    pub fn matches(&self, name: &str) -> bool {
        let Some(path) = EntryPath::parse(name) else {
            return false;
        };

        let (dirs, prefix, ext, layout): (&[&str], &str, &str, Layout) = match self.category {
            Category::Manifest => return path.dirs.is_empty() && path.file == "manifest.safe",
            Category::Annotation => (&["annotation"][..], "", ".xml", Layout::Safe),
            Category::Calibration => (
                &["annotation", "calibration"][..],
                "calibration-",
                ".xml",
                Layout::Safe,
            ),
            Category::Noise => (&["annotation", "calibration"][..], "noise-", ".xml", Layout::Safe),
            Category::Rfi => (&["annotation", "rfi"][..], "rfi-", ".xml", Layout::Safe),
            Category::Measurement => match self.kind {
                ProductKind::Slc | ProductKind::Grd => {
                    (&["measurement"][..], "", ".tiff", Layout::Safe)
                }
                ProductKind::Raw => (&[][..], "", ".dat", Layout::Raw),
            },
        };

        if !path.in_dir(dirs) {
            return false;
        }
        let Some(stem) = path
            .file
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(ext))
        else {
            return false;
        };
        let Some(component) = Component::parse(stem, layout) else {
            return false;
        };

        self.beam
            .is_none_or(|b| component.beam.eq_ignore_ascii_case(b.as_str()))
            && self
                .polarization
                .is_none_or(|p| component.pol.eq_ignore_ascii_case(p.as_str()))
    }
}

/// Union of the rules derived from one [`SelectionCriteria`].
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<MatchRule>,
}

impl RuleSet {
    pub fn new(criteria: &SelectionCriteria, kind: ProductKind) -> Self {
        let rules = criteria
            .categories()
            .into_iter()
            .map(|c| MatchRule::new(c, kind, criteria.beam, criteria.polarization))
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    /// First rule matching `name`.
    pub fn matching_rule(&self, name: &str) -> Option<&MatchRule> {
        self.rules.iter().find(|r| r.matches(name))
    }

    pub fn matches(&self, name: &str) -> bool {
        self.matching_rule(name).is_some()
    }

    /// Entries matched by at least one rule, in archive order.
    ///
    /// Directory entries are skipped and a name listed twice is selected once.
    pub fn select<'a>(&self, entries: &'a [DirectoryEntry]) -> Vec<&'a DirectoryEntry> {
        let mut seen = HashSet::new();
        entries
            .iter()
            .filter(|e| !e.is_directory && self.matches(&e.name))
            .filter(|e| seen.insert(e.name.as_str()))
            .collect()
    }
}

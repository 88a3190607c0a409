//! Destination paths under the output root.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Maps archives and entries to paths below one output root.
///
/// ```text
/// <root>/[<key>/]<entry name>
/// ```
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>` for the empty key, `<root>/<key>` otherwise.
    pub fn archive_dir(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Ok(self.root.clone());
        }
        let relative = self.checked_relative(key)?;
        Ok(self.root.join(relative))
    }

    /// Path of an archive entry inside `dir`, which must come from
    /// [`OutputLayout::archive_dir`].
    pub fn entry_path(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let relative = self.checked_relative(name)?;
        if relative.as_os_str().is_empty() {
            return Err(Error::path_conflict(name, "empty entry name"));
        }
        Ok(dir.join(relative))
    }

    /// Rebuild `name` from its normal components, rejecting anything that
    /// could leave the directory it is joined to.
    fn checked_relative(&self, name: &str) -> Result<PathBuf> {
        let conflict =
            || Error::path_conflict(name, format!("outside of {}", self.root.display()));
        // ZIP names use '/'; '\' would be a separator on Windows only.
        if name.contains('\\') {
            return Err(conflict());
        }

        let mut relative = PathBuf::new();
        for component in Path::new(name).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(conflict());
                }
            }
        }
        Ok(relative)
    }
}

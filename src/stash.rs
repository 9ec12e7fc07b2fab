//! Temporarily move configuration files out of the way, putting them back
//! when the guard is dropped.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::LabResult;

const STASH_SUFFIX: &str = "quest-nodes.bak";

/// Guard holding files renamed aside. Restores them on [`ConfigStash::restore`] or drop.
#[derive(Debug, Default)]
pub struct ConfigStash {
    moved: Vec<(PathBuf, PathBuf)>,
}

impl ConfigStash {
    /// Rename every existing file in `paths` to `<path>.quest-nodes.bak`. Missing files are skipped.
    ///
    /// If a rename fails, files already moved are put back before the error is returned.
    pub fn stash<P: AsRef<Path>>(paths: &[P]) -> LabResult<Self> {
        let mut stash = Self::default();

        for path in paths {
            let original = path.as_ref().to_path_buf();
            if !original.exists() {
                continue;
            }
            let aside = stash_path(&original);
            // On error the partially filled guard drops and restores.
            fs::rename(&original, &aside)?;
            info!("Moved {} aside", original.display());
            stash.moved.push((original, aside));
        }

        Ok(stash)
    }

    pub fn stashed(&self) -> impl Iterator<Item = &Path> {
        self.moved.iter().map(|(original, _)| original.as_path())
    }

    /// Put everything back now instead of at drop.
    pub fn restore(mut self) {
        self.restore_all();
    }

    fn restore_all(&mut self) {
        for (original, aside) in self.moved.drain(..).rev() {
            match fs::rename(&aside, &original) {
                Ok(()) => info!("Restored {}", original.display()),
                Err(e) => warn!(
                    "Failed to restore {} from {}: {}",
                    original.display(),
                    aside.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for ConfigStash {
    fn drop(&mut self) {
        self.restore_all();
    }
}

fn stash_path(original: &Path) -> PathBuf {
    let mut name = original.as_os_str().to_os_string();
    name.push(".");
    name.push(STASH_SUFFIX);
    PathBuf::from(name)
}

//! Additive directory overlay
//!
//! Copies every file under an overlay directory onto a working copy. Files
//! with the same relative path are replaced; everything else in the working
//! copy stays. Edits are applied in order, so the last writer wins.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Directories never copied into or out of a working copy
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Copy `overlay` onto `base`, returning the relative paths that were written
///
/// `base` is created if missing. Symlinks are followed; their targets are
/// copied as regular files.
pub fn apply_overlay(base: &Path, overlay: &Path) -> Result<Vec<PathBuf>> {
    if !overlay.is_dir() {
        return Err(Error::setup(format!(
            "overlay is not a directory: {}",
            overlay.display()
        )));
    }
    std::fs::create_dir_all(base)
        .map_err(|e| Error::io(format!("creating {}", base.display()), e))?;

    let mut written = Vec::new();
    copy_tree(overlay, base, Path::new(""), &mut written)?;
    written.sort();
    debug!(
        base = %base.display(),
        overlay = %overlay.display(),
        files = written.len(),
        "Applied overlay"
    );
    Ok(written)
}

/// Create a fresh working copy of `program` under `parent`
///
/// Returns the path of the copy (`parent/<program dir name>`).
pub fn copy_program(program: &Path, parent: &Path) -> Result<PathBuf> {
    let name = program
        .file_name()
        .ok_or_else(|| Error::setup(format!("program path has no name: {}", program.display())))?;
    let target = parent.join(name);
    apply_overlay(&target, program)?;
    Ok(target)
}

fn copy_tree(src: &Path, dst: &Path, rel: &Path, written: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(src)
        .map_err(|e| Error::io(format!("reading {}", src.display()), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("reading {}", src.display()), e))?;
        let name = entry.file_name();
        let from = entry.path();
        let to = dst.join(&name);
        let rel = rel.join(&name);

        // metadata() follows symlinks
        let meta = std::fs::metadata(&from)
            .map_err(|e| Error::io(format!("stat {}", from.display()), e))?;

        if meta.is_dir() {
            if SKIPPED_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            if to.exists() && !to.is_dir() {
                std::fs::remove_file(&to)
                    .map_err(|e| Error::io(format!("replacing {}", to.display()), e))?;
            }
            std::fs::create_dir_all(&to)
                .map_err(|e| Error::io(format!("creating {}", to.display()), e))?;
            copy_tree(&from, &to, &rel, written)?;
        } else {
            if to.is_dir() {
                return Err(Error::setup(format!(
                    "overlay file {} would replace directory {}",
                    rel.display(),
                    to.display()
                )));
            }
            std::fs::copy(&from, &to).map_err(|e| {
                Error::io(format!("copying {} to {}", from.display(), to.display()), e)
            })?;
            written.push(rel);
        }
    }
    Ok(())
}

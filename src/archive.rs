//! Package archive extraction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::PackageError;
use crate::package::MANIFEST_FILE;

/// Directory suffix of a package inside an archive.
const PACKAGE_DIR_SUFFIX: &str = ".vmax";

#[async_trait]
pub trait Unpacker: Send + Sync {
    /// Extracts `archive` into the existing directory `dest`.
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<(), PackageError>;
}

/// Shells out to `unzip`.
#[derive(Debug, Clone)]
pub struct UnzipCommand {
    program: PathBuf,
}

impl Default for UnzipCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("unzip"),
        }
    }
}

#[async_trait]
impl Unpacker for UnzipCommand {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<(), PackageError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-o")
            .arg("-q")
            .arg(archive)
            .arg("-d")
            .arg(dest)
            .output()
            .await
            .map_err(|e| PackageError::Unpack(format!("{}: {e}", self.program.display())))?;

        if !output.status.success() {
            return Err(PackageError::Unpack(format!(
                "exit code {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(archive = %archive.display(), dest = %dest.display(), "Archive extracted");
        Ok(())
    }
}

/// Locates the package directory among extracted files: the first
/// `*.vmax` directory (by name), or `dir` itself when it holds a manifest.
pub fn find_package_root(dir: &Path) -> Result<PathBuf, PackageError> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_dir()
            && name
                .to_string_lossy()
                .to_ascii_lowercase()
                .ends_with(PACKAGE_DIR_SUFFIX)
        {
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    if let Some(root) = candidates.into_iter().next() {
        return Ok(root);
    }
    if dir.join(MANIFEST_FILE).is_file() {
        return Ok(dir.to_path_buf());
    }
    Err(PackageError::NoPackageRoot)
}

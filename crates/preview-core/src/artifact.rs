//! Build outputs handed to the publisher.
//!
//! The build collaborator supplies either a directory or a `.zip` archive of
//! one. Archives are unpacked into a scratch directory that lives as long as
//! the [`Artifact`].

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::error::LifecycleError;
use crate::types::RequestId;

/// Size facts reported alongside a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeMetrics {
    pub files: u64,
    pub bytes: u64,
}

/// Content summary of an artifact tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactScan {
    pub metrics: SizeMetrics,
    /// blake3 over sorted `(path, content)` pairs, hex encoded
    pub fingerprint: String,
}

#[derive(Debug)]
pub struct Artifact {
    root: PathBuf,
    declared_bytes: Option<u64>,
    _extracted: Option<TempDir>,
}

impl Artifact {
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            declared_bytes: None,
            _extracted: None,
        }
    }

    /// Open a directory or `.zip` archive.
    ///
    /// A path that does not exist is accepted here and reported as missing by
    /// [`Artifact::scan`], which is where the publisher checks preconditions.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let is_zip = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if !is_zip {
            return Ok(Self::from_dir(path));
        }

        let scratch = tempfile::Builder::new()
            .prefix("preview-artifact-")
            .tempdir()
            .context("Failed to create artifact scratch directory")?;
        let data = fs::read(path)
            .with_context(|| format!("Failed to read artifact archive: {}", path.display()))?;
        extract_zip(&data, scratch.path())
            .with_context(|| format!("Failed to extract artifact: {}", path.display()))?;

        Ok(Self {
            root: scratch.path().to_path_buf(),
            declared_bytes: None,
            _extracted: Some(scratch),
        })
    }

    /// [`Artifact::open`] for a request, reporting an unreadable archive as
    /// a missing artifact.
    pub fn open_for(request_id: RequestId, path: &Path) -> Result<Self, LifecycleError> {
        Self::open(path).map_err(|err| LifecycleError::ArtifactMissing {
            request_id,
            detail: format!("{:#}", err),
        })
    }

    /// Byte size reported by the build; takes precedence over the measured size.
    pub fn with_declared_size(mut self, bytes: u64) -> Self {
        self.declared_bytes = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check the artifact is present and non-empty, then summarise it.
    pub fn scan(&self, request_id: RequestId) -> Result<ArtifactScan, LifecycleError> {
        let missing = |detail: String| LifecycleError::ArtifactMissing { request_id, detail };

        if !self.root.is_dir() {
            return Err(missing(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let mut hasher = blake3::Hasher::new();
        let mut metrics = SizeMetrics { files: 0, bytes: 0 };
        scan_dir(&mut hasher, &mut metrics, &self.root, "")
            .map_err(|err| missing(format!("{}: {:#}", self.root.display(), err)))?;
        if metrics.files == 0 {
            return Err(missing(format!(
                "{} contains no files",
                self.root.display()
            )));
        }
        if let Some(bytes) = self.declared_bytes {
            metrics.bytes = bytes;
        }
        Ok(ArtifactScan {
            metrics,
            fingerprint: hasher.finalize().to_hex().to_string(),
        })
    }

    /// Copy the artifact tree into `dest`, skipping any `.git` directory and
    /// symbolic links.
    pub fn copy_into(&self, dest: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dest)?;
        copy_tree_filtered(&self.root, dest)
    }
}

fn scan_dir(
    hasher: &mut blake3::Hasher,
    metrics: &mut SizeMetrics,
    dir: &Path,
    base: &str,
) -> anyhow::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let name_str = name.to_string_lossy();
        let rel_path = if base.is_empty() {
            name_str.to_string()
        } else {
            format!("{}/{}", base, name_str)
        };

        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("Failed to stat file: {}", path.display()))?;

        if meta.file_type().is_symlink() {
            tracing::warn!(path = %path.display(), "skipping symbolic link in artifact");
            continue;
        }
        if meta.is_dir() {
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0xFF]);
            scan_dir(hasher, metrics, &path, &rel_path)?;
        } else if meta.is_file() {
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0x00]);
            let content = fs::read(&path)
                .with_context(|| format!("Failed to read file: {}", path.display()))?;
            hasher.update(&content);
            metrics.files += 1;
            metrics.bytes += meta.len();
        } else {
            anyhow::bail!("Unsupported filesystem entry type: {}", path.display());
        }
    }
    Ok(())
}

fn copy_tree_filtered(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(&file_name);
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_tree_filtered(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

fn extract_zip(data: &[u8], dest: &Path) -> anyhow::Result<()> {
    let cursor = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(cursor).context("Artifact is not a zip archive")?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {}", i))?;

        // Entries escaping the destination are skipped
        let Some(relative) = file.enclosed_name() else {
            tracing::warn!(entry = file.name(), "skipping unsafe zip entry");
            continue;
        };
        let outpath = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create directory: {}", outpath.display()))?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create parent directory: {}", parent.display())
            })?;
        }
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read zip entry: {}", file.name()))?;
        fs::write(&outpath, &buffer)
            .with_context(|| format!("Failed to write file: {}", outpath.display()))?;
    }
    Ok(())
}

//! Path checks applied before a job is queued or an output is written.

use std::path::{Component, Path};

use rx_core::media::{extension_of, ALLOWED_MEDIA_EXTENSIONS};
use rx_core::{Error, Result};

/// Check that `path` is an existing regular file with a supported extension.
///
/// Failures are [`Error::Scan`], which the pipeline records as a scan
/// failure on the job.
pub fn validate_media_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::scan(format!("File not found: {}", path.display())));
    }
    if !path.is_file() {
        return Err(Error::scan(format!("Not a file: {}", path.display())));
    }

    let ext = extension_of(path);
    if !ALLOWED_MEDIA_EXTENSIONS.contains(&ext.as_str()) {
        return Err(Error::scan(format!("Unsupported file type: .{ext}")));
    }
    Ok(())
}

/// Check that `path` contains no parent-directory components and that its
/// parent directory exists.
pub fn validate_output_path(path: &Path) -> Result<()> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::Validation("Path traversal not allowed".into()));
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(Error::Validation(format!(
                "Output directory does not exist: {}",
                parent.display()
            )));
        }
    }
    Ok(())
}

//! Scratch directories for stages that produce files.
//!
//! A [`Workspace`] owns a temporary directory. Outputs are written inside it
//! and moved to their destination only once the stage succeeded, so a failed
//! or cancelled run leaves nothing at the destination. Dropping the
//! workspace removes whatever is left.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory scoped to one run.
///
/// # Example
///
/// ```no_run
/// use rx_av::Workspace;
///
/// let workspace = Workspace::new().unwrap();
/// let staged = workspace.temp_file("merged.mkv");
/// // ... write `staged` ...
/// workspace.finalize_into(&staged, std::path::Path::new("/out/merged.mkv")).unwrap();
/// ```
#[derive(Debug)]
pub struct Workspace {
    temp_dir: TempDir,
}

impl Workspace {
    /// Create a workspace under the system temp directory.
    pub fn new() -> rx_core::Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("rsext-")
            .tempdir()
            .map_err(workspace_error("failed to create temp dir"))?;
        Ok(Self { temp_dir })
    }

    /// Create a workspace under `parent`, which is created if missing.
    ///
    /// Staging next to the destination keeps the final move a rename on the
    /// same filesystem.
    pub fn new_in(parent: &Path) -> rx_core::Result<Self> {
        std::fs::create_dir_all(parent).map_err(workspace_error("failed to create parent"))?;
        let temp_dir = tempfile::Builder::new()
            .prefix(".rsext-")
            .tempdir_in(parent)
            .map_err(workspace_error("failed to create temp dir"))?;
        Ok(Self { temp_dir })
    }

    /// Path to the temporary directory.
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a path for a named temporary file inside the workspace.
    pub fn temp_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Create (if needed) and return a subdirectory of the workspace.
    pub fn subdir(&self, name: &str) -> rx_core::Result<PathBuf> {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).map_err(workspace_error("failed to create subdir"))?;
        Ok(dir)
    }

    /// Move `staged` (a file inside this workspace) to `dest`.
    ///
    /// Tries a rename first and falls back to copy plus remove across
    /// filesystems. An existing file at `dest` is replaced.
    pub fn finalize_into(&self, staged: &Path, dest: &Path) -> rx_core::Result<PathBuf> {
        if !staged.starts_with(self.dir()) {
            return Err(rx_core::Error::Internal(format!(
                "{} is not inside the workspace",
                staged.display()
            )));
        }
        if !staged.exists() {
            return Err(rx_core::Error::Tool {
                tool: "workspace".to_string(),
                message: format!("output file does not exist: {}", staged.display()),
            });
        }

        if std::fs::rename(staged, dest).is_err() {
            std::fs::copy(staged, dest)
                .map_err(workspace_error("failed to copy output to destination"))?;
            let _ = std::fs::remove_file(staged);
        }

        Ok(dest.to_path_buf())
    }
}

fn workspace_error(context: &'static str) -> impl Fn(std::io::Error) -> rx_core::Error {
    move |e| rx_core::Error::Tool {
        tool: "workspace".to_string(),
        message: format!("{context}: {e}"),
    }
}

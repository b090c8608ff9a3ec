//! External tool detection and management.
//!
//! The [`ToolRegistry`] resolves the locations of ffmpeg and ffprobe once per
//! run and provides lookup methods for the rest of the crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

/// A resolved external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Human-readable tool name (e.g. "ffmpeg").
    pub name: String,
    /// Resolved path to the executable.
    pub path: PathBuf,
    /// Whether the path came from configuration rather than `PATH`.
    #[serde(default)]
    pub custom: bool,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool was found.
    pub available: bool,
    /// Version string (first line of `-version` output), if available.
    pub version: Option<String>,
    /// Resolved path to the executable.
    pub path: Option<PathBuf>,
    /// Why the tool is unavailable, if it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

/// Registry holding resolved tool configurations.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
    problems: HashMap<String, String>,
}

impl ToolRegistry {
    /// Resolve tools from configured paths, falling back to `PATH`.
    ///
    /// A configured path that is not an existing regular file is recorded as
    /// a problem for that tool; it is never silently replaced by whatever is
    /// on `PATH`, so a typo in the config surfaces instead of running a
    /// different binary.
    pub fn discover(tools_config: &rx_core::config::ToolsConfig) -> Self {
        let mut registry = Self::default();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                "ffmpeg" => tools_config.ffmpeg_path.as_deref(),
                "ffprobe" => tools_config.ffprobe_path.as_deref(),
                _ => None,
            };

            match custom_path {
                Some(p) => match check_custom_path(name, p) {
                    Ok(path) => registry.insert(name, path, true),
                    Err(problem) => {
                        tracing::warn!(tool = name, "{problem}");
                        registry.problems.insert(name.to_string(), problem);
                    }
                },
                None => match which::which(name) {
                    Ok(path) => registry.insert(name, path, false),
                    Err(_) => {
                        registry.problems.insert(
                            name.to_string(),
                            format!("{name} not found; is it installed and in PATH?"),
                        );
                    }
                },
            }
        }

        registry
    }

    /// Build a registry from explicit paths without any filesystem checks.
    pub fn with_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        let mut registry = Self::default();
        registry.insert("ffmpeg", ffmpeg.into(), true);
        registry.insert("ffprobe", ffprobe.into(), true);
        registry
    }

    fn insert(&mut self, name: &str, path: PathBuf, custom: bool) {
        self.tools.insert(
            name.to_string(),
            ToolConfig {
                name: name.to_string(),
                path,
                custom,
            },
        );
    }

    /// Return the [`ToolConfig`] for the given tool, or an
    /// [`rx_core::Error::Tool`] explaining why it is unavailable.
    pub fn require(&self, name: &str) -> rx_core::Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| rx_core::Error::Tool {
            tool: name.to_string(),
            message: self
                .problems
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("{name} not found; is it installed and in PATH?")),
        })
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(cfg) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(&cfg.path),
                    path: Some(cfg.path.clone()),
                    problem: None,
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                    problem: self.problems.get(name).cloned(),
                },
            })
            .collect()
    }
}

/// Validate a user-supplied tool path.
fn check_custom_path(name: &str, path: &Path) -> std::result::Result<PathBuf, String> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(path.to_path_buf()),
        Ok(_) => Err(format!(
            "configured {name} path '{}' is not a file",
            path.display()
        )),
        Err(e) => Err(format!(
            "configured {name} path '{}' is not usable: {e}",
            path.display()
        )),
    }
}

/// Run `<tool> -version` and return the first line of stdout.
fn detect_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg("-version")
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}

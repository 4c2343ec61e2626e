//! Enumerating workspace files and applying ignore patterns.

use camino::{Utf8Path, Utf8PathBuf};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::SyncError;

/// Ignore file specific to this tool; preferred when present.
pub const TOOL_IGNORE_FILE: &str = ".vastignore";

/// General-purpose ignore file used when no tool-specific file exists.
pub const GENERIC_IGNORE_FILE: &str = ".gitignore";

/// Gitignore-style predicate over paths relative to a workspace root.
#[derive(Clone, Debug)]
pub struct IgnoreMatcher {
    matcher: Gitignore,
}

impl IgnoreMatcher {
    /// Locates the ignore file for `root`, preferring [`TOOL_IGNORE_FILE`]
    /// over [`GENERIC_IGNORE_FILE`]. Returns `None` when neither exists.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Ignore`] when the file exists but cannot be read.
    pub fn discover(root: &Utf8Path) -> Result<Option<Self>, SyncError> {
        for name in [TOOL_IGNORE_FILE, GENERIC_IGNORE_FILE] {
            let candidate = root.join(name);
            if candidate.is_file() {
                return Self::from_file(root, &candidate).map(Some);
            }
        }
        Ok(None)
    }

    /// Builds a matcher from the patterns in `path`, anchored at `root`.
    ///
    /// Lines that fail to parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Ignore`] when the file cannot be read.
    pub fn from_file(root: &Utf8Path, path: &Utf8Path) -> Result<Self, SyncError> {
        let mut builder = GitignoreBuilder::new(root);
        if let Some(err) = builder.add(path) {
            if !path.is_file() {
                return Err(SyncError::Ignore {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                });
            }
            warn!(file = %path, error = %err, "skipping unparseable ignore patterns");
        }
        let matcher = builder.build().map_err(|err| SyncError::Ignore {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        debug!(file = %path, patterns = matcher.num_ignores(), "loaded ignore file");
        Ok(Self { matcher })
    }

    /// Returns `true` when `relative`, or any directory above it, matches.
    #[must_use]
    pub fn is_excluded(&self, relative: &Utf8Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(relative.as_std_path(), is_dir)
            .is_ignore()
    }
}

/// Files selected for transfer, relative to the workspace root and sorted.
///
/// Only regular files are listed. The manifest is fixed once built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkspaceManifest {
    root: Utf8PathBuf,
    entries: Vec<Utf8PathBuf>,
    excluded: Vec<Utf8PathBuf>,
}

impl WorkspaceManifest {
    /// Enumerates `root` recursively, discovering an ignore file when
    /// `filter_enabled` is set.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the root is missing, a directory cannot be
    /// read, or the ignore file is unreadable.
    pub fn collect(root: &Utf8Path, filter_enabled: bool) -> Result<Self, SyncError> {
        let matcher = if filter_enabled {
            IgnoreMatcher::discover(root)?
        } else {
            None
        };
        Self::build(root, matcher.as_ref())
    }

    /// Enumerates `root` recursively, excluding paths `matcher` matches.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingSource`] when `root` is not a directory or
    /// [`SyncError::Walk`] when enumeration fails.
    pub fn build(root: &Utf8Path, matcher: Option<&IgnoreMatcher>) -> Result<Self, SyncError> {
        if !root.is_dir() {
            return Err(SyncError::MissingSource {
                path: root.to_path_buf(),
            });
        }

        let mut entries = Vec::new();
        let mut excluded = Vec::new();
        for item in WalkDir::new(root).sort_by_file_name() {
            let entry = item.map_err(|err| SyncError::Walk {
                path: root.to_path_buf(),
                message: err.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relative_path(root, entry.path())?;
            if matcher.is_some_and(|m| m.is_excluded(&relative, false)) {
                excluded.push(relative);
            } else {
                entries.push(relative);
            }
        }
        entries.sort();
        excluded.sort();

        Ok(Self {
            root: root.to_path_buf(),
            entries,
            excluded,
        })
    }

    /// Workspace root the entries are relative to.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Included files, sorted by path.
    #[must_use]
    pub fn entries(&self) -> &[Utf8PathBuf] {
        &self.entries
    }

    /// Files dropped by the ignore patterns, sorted by path.
    #[must_use]
    pub fn excluded(&self) -> &[Utf8PathBuf] {
        &self.excluded
    }

    /// Number of included files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no file was included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn relative_path(root: &Utf8Path, path: &std::path::Path) -> Result<Utf8PathBuf, SyncError> {
    let utf8 = Utf8Path::from_path(path).ok_or_else(|| SyncError::Walk {
        path: root.to_path_buf(),
        message: format!("{} is not valid UTF-8", path.display()),
    })?;
    utf8.strip_prefix(root)
        .map(Utf8Path::to_path_buf)
        .map_err(|err| SyncError::Walk {
            path: root.to_path_buf(),
            message: err.to_string(),
        })
}

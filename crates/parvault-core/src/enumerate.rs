//! Recursive file enumeration shared by protect, metadata capture and size
//! calculation.
//!
//! A [`FileEnumerator`] walks a root (file or directory), prunes excluded
//! directories (the parity storage directory in practice) before descending
//! into them, and optionally filters by extension.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{VaultError, VaultResult};

/// A regular file discovered by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Aggregate produced by [`FileEnumerator::summarize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationSummary {
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
    pub skipped_unreadable: usize,
}

/// Builder-style recursive enumerator.
#[derive(Debug, Clone)]
pub struct FileEnumerator {
    root: PathBuf,
    excluded_dir_names: BTreeSet<String>,
    extensions: Option<BTreeSet<String>>,
    follow_symlinks: bool,
}

impl FileEnumerator {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded_dir_names: BTreeSet::new(),
            extensions: None,
            follow_symlinks: false,
        }
    }

    /// Skip any directory with this exact name (and everything below it).
    #[must_use]
    pub fn exclude_dir_name(mut self, name: impl Into<String>) -> Self {
        self.excluded_dir_names.insert(name.into());
        self
    }

    /// Only yield files whose lowercase extension is in `extensions`.
    /// `None` or an empty list yields every file.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Option<&[String]>) -> Self {
        self.extensions = extensions
            .map(|list| {
                list.iter()
                    .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect::<BTreeSet<_>>()
            })
            .filter(|set| !set.is_empty());
        self
    }

    #[must_use]
    pub const fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` passes the extension filter.
    #[must_use]
    pub fn matches_extension(&self, path: &Path) -> bool {
        let Some(allowed) = &self.extensions else {
            return true;
        };
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| allowed.contains(&ext.to_ascii_lowercase()))
    }

    /// Iterate matching files. Walk errors are yielded, not swallowed.
    pub fn iter(&self) -> impl Iterator<Item = VaultResult<EnumeratedFile>> + '_ {
        let excluded = &self.excluded_dir_names;
        WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| excluded.contains(name)))
            })
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() || !self.matches_extension(entry.path()) {
                        return None;
                    }
                    Some(
                        entry
                            .metadata()
                            .map(|meta| EnumeratedFile {
                                path: entry.path().to_path_buf(),
                                size: meta.len(),
                            })
                            .map_err(walk_error),
                    )
                }
                Err(error) => Some(Err(walk_error(error))),
            })
    }

    /// Collect every matching file, skipping (and logging) unreadable entries.
    pub fn summarize(&self) -> VaultResult<EnumerationSummary> {
        if !self.root.exists() {
            return Err(VaultError::PathNotFound {
                path: self.root.clone(),
            });
        }

        let mut summary = EnumerationSummary::default();
        for item in self.iter() {
            match item {
                Ok(file) => {
                    summary.total_bytes = summary.total_bytes.saturating_add(file.size);
                    summary.files.push(file.path);
                }
                Err(error) => {
                    summary.skipped_unreadable += 1;
                    warn!(
                        target: "parvault.enumerate",
                        root = %self.root.display(),
                        %error,
                        "skipping unreadable entry"
                    );
                }
            }
        }
        Ok(summary)
    }
}

fn walk_error(error: walkdir::Error) -> VaultError {
    match error.into_io_error() {
        Some(io) => VaultError::Io(io),
        None => VaultError::SubsystemError {
            subsystem: "enumerate",
            source: Box::new(std::io::Error::other("filesystem loop detected")),
        },
    }
}

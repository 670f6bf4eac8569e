//! Per-file ownership, permission, mtime and extended-attribute state.
//!
//! Metadata is tracked independently of parity data: par2 repairs contents
//! but not ownership, so a restore after repair reapplies what was captured
//! at protect time.

use std::fs::{self, File, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parvault_core::tracing_config::span_names;
use parvault_core::{
    FileEnumerator, MetadataStatus, VaultError, VaultResult, unix_timestamp_ms,
};
use parvault_storage::{
    FileMetadataRecord, ProtectedItem, Storage, get_protected_item, list_file_metadata,
    replace_file_metadata,
};
use serde::Serialize;
use tracing::{debug, info, warn};

const PERMISSION_MASK: u32 = 0o7777;
const MAX_REPORTED_FAILURES: usize = 5;

/// One field that differs from the captured state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataDifference {
    pub file: PathBuf,
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
}

/// Result of a verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataReport {
    pub status: MetadataStatus,
    pub checked: usize,
    pub missing: Vec<PathBuf>,
    pub differences: Vec<MetadataDifference>,
    pub restored: usize,
    pub restore_failures: usize,
}

/// Result of a restore pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub files: usize,
    pub attempted: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

impl RestoreReport {
    fn merge(&mut self, file: &FileRestore) {
        self.files += 1;
        self.attempted += file.attempted;
        self.failed += file.failures.len();
        for failure in &file.failures {
            if self.failures.len() < MAX_REPORTED_FAILURES {
                self.failures.push(failure.clone());
            }
        }
    }

    /// `MetadataPartialFailure` when any action failed.
    pub fn into_result(self) -> VaultResult<Self> {
        if self.failed == 0 {
            return Ok(self);
        }
        Err(VaultError::MetadataPartialFailure {
            failed: self.failed,
            attempted: self.attempted,
            detail: self.failures.join("; "),
        })
    }
}

#[derive(Debug, Default)]
struct FileRestore {
    attempted: usize,
    failures: Vec<String>,
}

impl FileRestore {
    fn attempt(&mut self, what: &str, file: &Path, result: std::io::Result<()>) {
        self.attempted += 1;
        if let Err(error) = result {
            self.failures
                .push(format!("{what} {}: {error}", file.display()));
        }
    }
}

/// Captures, compares and restores file metadata for protected items.
#[derive(Debug, Clone)]
pub struct MetadataManager {
    storage: Arc<Storage>,
    parity_dir_name: String,
}

impl MetadataManager {
    #[must_use]
    pub fn new(storage: Arc<Storage>, parity_dir_name: impl Into<String>) -> Self {
        Self {
            storage,
            parity_dir_name: parity_dir_name.into(),
        }
    }

    /// Record the state of every concrete file under the item, replacing
    /// previous rows in one transaction. Returns the number of files captured.
    pub fn capture(&self, path: &Path, item_id: i64) -> VaultResult<usize> {
        let span = tracing::info_span!(
            target: "parvault.metadata",
            span_names::METADATA_PASS,
            op = "capture",
            item_id
        );
        let _entered = span.enter();

        let item = self.load_item(item_id)?;
        let files = self.files_for(path, &item)?;
        let mut records = Vec::with_capacity(files.len());
        for file in &files {
            match read_record(file) {
                Ok(record) => records.push(record),
                Err(error) => warn!(
                    target: "parvault.metadata",
                    file = %file.display(),
                    %error,
                    "skipping unreadable file during capture"
                ),
            }
        }

        let captured_at = unix_timestamp_ms()?;
        let captured = self.storage.transaction(|conn| {
            replace_file_metadata(conn, item_id, &records, captured_at)
        })?;
        info!(
            target: "parvault.metadata",
            item_id,
            captured,
            skipped = files.len() - records.len(),
            "metadata captured"
        );
        Ok(captured)
    }

    /// Compare current state with the captured rows; with `auto_restore`
    /// reapply stored values to every file that differs.
    pub fn verify(&self, item_id: i64, auto_restore: bool) -> VaultResult<MetadataReport> {
        let span = tracing::info_span!(
            target: "parvault.metadata",
            span_names::METADATA_PASS,
            op = "verify",
            item_id
        );
        let _entered = span.enter();

        let records = self
            .storage
            .read(|conn| list_file_metadata(conn, item_id))?;
        let mut missing = Vec::new();
        let mut differences = Vec::new();
        let mut restore = RestoreReport::default();

        for record in &records {
            if !record.file_path.exists() {
                missing.push(record.file_path.clone());
                continue;
            }
            let current = match read_record(&record.file_path) {
                Ok(current) => current,
                Err(error) => {
                    differences.push(MetadataDifference {
                        file: record.file_path.clone(),
                        field: "readable",
                        expected: "true".to_owned(),
                        actual: error.to_string(),
                    });
                    continue;
                }
            };
            let found = compare(record, &current);
            if found.is_empty() {
                continue;
            }
            differences.extend(found);
            if auto_restore {
                restore.merge(&apply_record(record));
            }
        }

        let status = if !missing.is_empty() {
            MetadataStatus::MissingFiles
        } else if !differences.is_empty() {
            MetadataStatus::MetadataIssues
        } else {
            MetadataStatus::Verified
        };
        info!(
            target: "parvault.metadata",
            item_id,
            status = status.as_str(),
            checked = records.len(),
            missing = missing.len(),
            differences = differences.len(),
            restored = restore.files,
            "metadata verified"
        );
        Ok(MetadataReport {
            status,
            checked: records.len(),
            missing,
            differences,
            restored: restore.files,
            restore_failures: restore.failed,
        })
    }

    /// Reapply owner, group, permission bits and mtime for every captured
    /// file regardless of current state. Missing files are skipped.
    pub fn restore(&self, item_id: i64) -> VaultResult<RestoreReport> {
        let span = tracing::info_span!(
            target: "parvault.metadata",
            span_names::METADATA_PASS,
            op = "restore",
            item_id
        );
        let _entered = span.enter();

        let records = self
            .storage
            .read(|conn| list_file_metadata(conn, item_id))?;
        let mut report = RestoreReport::default();
        for record in &records {
            if !record.file_path.exists() {
                debug!(
                    target: "parvault.metadata",
                    file = %record.file_path.display(),
                    "skipping restore of missing file"
                );
                continue;
            }
            report.merge(&apply_record(record));
        }
        if report.failed > 0 {
            warn!(
                target: "parvault.metadata",
                item_id,
                failed = report.failed,
                attempted = report.attempted,
                "metadata restore partially failed"
            );
        } else {
            info!(target: "parvault.metadata", item_id, files = report.files, "metadata restored");
        }
        Ok(report)
    }

    fn load_item(&self, item_id: i64) -> VaultResult<ProtectedItem> {
        self.storage
            .read(|conn| get_protected_item(conn, item_id))?
            .ok_or_else(|| VaultError::NotFound {
                entity: "protected_items",
                key: item_id.to_string(),
            })
    }

    fn files_for(&self, path: &Path, item: &ProtectedItem) -> VaultResult<Vec<PathBuf>> {
        if let Some(files) = &item.protected_files {
            return Ok(files.clone());
        }
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        Ok(FileEnumerator::new(path)
            .exclude_dir_name(&self.parity_dir_name)
            .with_extensions(item.file_types.as_deref())
            .summarize()?
            .files)
    }
}

/// Read the current metadata of one file.
pub fn read_record(path: &Path) -> std::io::Result<FileMetadataRecord> {
    let meta = fs::metadata(path)?;
    Ok(FileMetadataRecord {
        file_path: path.to_path_buf(),
        owner: meta.uid(),
        group: meta.gid(),
        permissions: meta.mode() & PERMISSION_MASK,
        mtime_sec: meta.mtime(),
        mtime_nsec: u32::try_from(meta.mtime_nsec()).unwrap_or(0),
        xattrs: xattr::read_all(path),
    })
}

fn compare(expected: &FileMetadataRecord, actual: &FileMetadataRecord) -> Vec<MetadataDifference> {
    let mut found = Vec::new();
    let mut check = |field: &'static str, want: String, have: String| {
        if want != have {
            found.push(MetadataDifference {
                file: expected.file_path.clone(),
                field,
                expected: want,
                actual: have,
            });
        }
    };
    check("owner", expected.owner.to_string(), actual.owner.to_string());
    check("group", expected.group.to_string(), actual.group.to_string());
    check(
        "permissions",
        format!("{:o}", expected.permissions),
        format!("{:o}", actual.permissions),
    );
    check(
        "mtime",
        format!("{}.{:09}", expected.mtime_sec, expected.mtime_nsec),
        format!("{}.{:09}", actual.mtime_sec, actual.mtime_nsec),
    );
    if let Some(stored) = &expected.xattrs {
        let current = actual.xattrs.clone().unwrap_or_default();
        if stored != &current {
            check(
                "xattrs",
                stored.keys().cloned().collect::<Vec<_>>().join(","),
                current.keys().cloned().collect::<Vec<_>>().join(","),
            );
        }
    }
    found
}

// Ownership first: chown may clear setuid/setgid bits that the permission
// step puts back.
fn apply_record(record: &FileMetadataRecord) -> FileRestore {
    let path = &record.file_path;
    let mut restore = FileRestore::default();
    restore.attempt(
        "chown",
        path,
        std::os::unix::fs::chown(path, Some(record.owner), Some(record.group)),
    );
    restore.attempt("set mtime", path, set_mtime(path, record));
    restore.attempt(
        "chmod",
        path,
        fs::set_permissions(path, Permissions::from_mode(record.permissions)),
    );
    if let Some(xattrs) = &record.xattrs {
        for (name, value) in xattrs {
            restore.attempt("setxattr", path, xattr::write(path, name, value));
        }
    }
    restore
}

fn set_mtime(path: &Path, record: &FileMetadataRecord) -> std::io::Result<()> {
    File::open(path)?.set_modified(recorded_mtime(record.mtime_sec, record.mtime_nsec))
}

/// `st_mtime`/`st_mtime_nsec` back to a `SystemTime`. The nanoseconds always
/// count forward, including before the epoch.
fn recorded_mtime(sec: i64, nsec: u32) -> SystemTime {
    let whole = Duration::from_secs(sec.unsigned_abs());
    let base = if sec >= 0 {
        UNIX_EPOCH + whole
    } else {
        UNIX_EPOCH - whole
    };
    base + Duration::from_nanos(u64::from(nsec))
}

#[cfg(target_os = "linux")]
mod xattr {
    use std::collections::BTreeMap;
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn c_path(path: &Path) -> io::Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
    }

    fn names(path: &CString) -> io::Result<Vec<String>> {
        #[allow(unsafe_code)]
        // SAFETY: a null buffer with size 0 asks only for the required length.
        let size = unsafe { libc::listxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
        let Ok(size) = usize::try_from(size) else {
            return Err(io::Error::last_os_error());
        };
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0_u8; size];
        #[allow(unsafe_code)]
        // SAFETY: buffer is valid for `buffer.len()` writable bytes.
        let written =
            unsafe { libc::listxattr(path.as_ptr(), buffer.as_mut_ptr().cast(), buffer.len()) };
        let Ok(written) = usize::try_from(written) else {
            return Err(io::Error::last_os_error());
        };
        buffer.truncate(written);
        Ok(buffer
            .split(|byte| *byte == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect())
    }

    fn value(path: &CString, name: &str) -> io::Result<Vec<u8>> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains NUL"))?;
        #[allow(unsafe_code)]
        // SAFETY: a null buffer with size 0 asks only for the required length.
        let size =
            unsafe { libc::getxattr(path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
        let Ok(size) = usize::try_from(size) else {
            return Err(io::Error::last_os_error());
        };
        let mut buffer = vec![0_u8; size];
        if size == 0 {
            return Ok(buffer);
        }
        #[allow(unsafe_code)]
        // SAFETY: buffer is valid for `buffer.len()` writable bytes.
        let read = unsafe {
            libc::getxattr(
                path.as_ptr(),
                c_name.as_ptr(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
            )
        };
        let Ok(read) = usize::try_from(read) else {
            return Err(io::Error::last_os_error());
        };
        buffer.truncate(read);
        Ok(buffer)
    }

    /// Hex-encoded attributes; `None` when the filesystem has none or does
    /// not support them.
    pub(super) fn read_all(path: &Path) -> Option<BTreeMap<String, String>> {
        let c_path = c_path(path).ok()?;
        let names = names(&c_path).ok()?;
        let map: BTreeMap<String, String> = names
            .into_iter()
            .filter_map(|name| {
                let bytes = value(&c_path, &name).ok()?;
                Some((name, hex::encode(bytes)))
            })
            .collect();
        (!map.is_empty()).then_some(map)
    }

    pub(super) fn write(path: &Path, name: &str, hex_value: &str) -> io::Result<()> {
        let bytes = hex::decode(hex_value)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        let c_path = c_path(path)?;
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xattr name contains NUL"))?;
        #[allow(unsafe_code)]
        // SAFETY: both strings are NUL terminated and `bytes` is valid for
        // `bytes.len()` readable bytes.
        let result = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                bytes.as_ptr().cast(),
                bytes.len(),
                0,
            )
        };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr {
    use std::collections::BTreeMap;
    use std::io;
    use std::path::Path;

    pub(super) fn read_all(_path: &Path) -> Option<BTreeMap<String, String>> {
        None
    }

    pub(super) fn write(_path: &Path, _name: &str, _hex_value: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended attributes are not supported on this platform",
        ))
    }
}

use std::path::{Path, PathBuf};

use parvault_core::{ItemStatus, ProtectionMode, VaultError, VaultResult};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::connection::{map_storage_error, query_rows};
use crate::row::{
    conversion_error, get_json, get_optional_path, get_path, get_u64, json_text, path_text, to_i64,
};

const ITEM_COLUMNS: &str = "id, path, mode, redundancy, protected_date, last_verified, last_status, \
     size, data_size, par2_size, par2_path, file_types, parent_dir, protected_files, parent_item_id";

/// One protected path as persisted in `protected_items`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedItem {
    pub id: i64,
    pub path: PathBuf,
    pub mode: ProtectionMode,
    pub redundancy: u8,
    pub protected_date: i64,
    pub last_verified: Option<i64>,
    pub last_status: ItemStatus,
    pub size: u64,
    pub data_size: u64,
    pub par2_size: u64,
    pub par2_path: PathBuf,
    pub file_types: Option<Vec<String>>,
    pub parent_dir: Option<PathBuf>,
    pub protected_files: Option<Vec<PathBuf>>,
    /// Individual-mode item this per-file row belongs to.
    pub parent_item_id: Option<i64>,
}

impl ProtectedItem {
    /// Concrete files covered by this item: the recorded list when present,
    /// otherwise the path itself.
    #[must_use]
    pub fn covered_files(&self) -> Vec<PathBuf> {
        self.protected_files
            .clone()
            .unwrap_or_else(|| vec![self.path.clone()])
    }
}

/// Values written by a successful protect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProtectedItem {
    pub path: PathBuf,
    pub mode: ProtectionMode,
    pub redundancy: u8,
    pub size: u64,
    pub data_size: u64,
    pub par2_size: u64,
    pub par2_path: PathBuf,
    /// Expected normalized (see `normalize_file_types`).
    pub file_types: Option<Vec<String>>,
    pub parent_dir: Option<PathBuf>,
    pub protected_files: Option<Vec<PathBuf>>,
    pub parent_item_id: Option<i64>,
}

impl NewProtectedItem {
    fn uniqueness_key(&self) -> String {
        match self.parent_item_id {
            Some(parent) => format!("parent:{parent}"),
            None => file_types_key(self.file_types.as_deref()),
        }
    }
}

fn file_types_key(file_types: Option<&[String]>) -> String {
    file_types.map(|types| types.join(",")).unwrap_or_default()
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ProtectedItem> {
    let mode_text: String = row.get(2)?;
    let mode = mode_text
        .parse::<ProtectionMode>()
        .map_err(|error| conversion_error(2, Type::Text, error))?;
    let redundancy: i64 = row.get(3)?;
    let status_text: String = row.get(6)?;
    let last_status = ItemStatus::parse(&status_text).ok_or_else(|| {
        conversion_error(
            6,
            Type::Text,
            format!("unknown item status {status_text:?}"),
        )
    })?;
    Ok(ProtectedItem {
        id: row.get(0)?,
        path: get_path(row, 1)?,
        mode,
        redundancy: u8::try_from(redundancy)
            .map_err(|error| conversion_error(3, Type::Integer, error))?,
        protected_date: row.get(4)?,
        last_verified: row.get(5)?,
        last_status,
        size: get_u64(row, 7)?,
        data_size: get_u64(row, 8)?,
        par2_size: get_u64(row, 9)?,
        par2_path: get_path(row, 10)?,
        file_types: get_json(row, 11)?,
        parent_dir: get_optional_path(row, 12)?,
        protected_files: get_json(row, 13)?,
        parent_item_id: row.get(14)?,
    })
}

/// Insert or refresh the item keyed by (`path`, `file_types`), or by
/// (`path`, parent item) for per-file children. Returns its id.
pub fn upsert_protected_item(
    conn: &Connection,
    item: &NewProtectedItem,
    now_ms: i64,
) -> VaultResult<i64> {
    let file_types = item.file_types.as_deref().map(json_text).transpose()?;
    let protected_files = item.protected_files.as_deref().map(json_text).transpose()?;
    let id = conn
        .query_row(
            "INSERT INTO protected_items (\
                path, mode, redundancy, protected_date, last_status, size, data_size, par2_size, \
                par2_path, file_types, file_types_key, parent_dir, protected_files, parent_item_id\
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             ON CONFLICT(path, file_types_key) DO UPDATE SET \
                mode = excluded.mode, redundancy = excluded.redundancy, \
                protected_date = excluded.protected_date, last_status = excluded.last_status, \
                size = excluded.size, data_size = excluded.data_size, par2_size = excluded.par2_size, \
                par2_path = excluded.par2_path, file_types = excluded.file_types, \
                parent_dir = excluded.parent_dir, protected_files = excluded.protected_files, \
                parent_item_id = excluded.parent_item_id \
             RETURNING id;",
            params![
                path_text(&item.path),
                item.mode.to_db_string(),
                i64::from(item.redundancy),
                now_ms,
                ItemStatus::Protected.as_str(),
                to_i64(item.size, "size")?,
                to_i64(item.data_size, "data_size")?,
                to_i64(item.par2_size, "par2_size")?,
                path_text(&item.par2_path),
                file_types,
                item.uniqueness_key(),
                item.parent_dir.as_deref().map(path_text),
                protected_files,
                item.parent_item_id,
            ],
            |row| row.get(0),
        )
        .map_err(map_storage_error)?;

    tracing::debug!(
        target: "parvault.storage",
        op = "items.upsert",
        item_id = id,
        path = %item.path.display(),
        mode = %item.mode,
        "protected item stored"
    );
    Ok(id)
}

pub fn get_protected_item(conn: &Connection, id: i64) -> VaultResult<Option<ProtectedItem>> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM protected_items WHERE id = ?1;"),
        [id],
        item_from_row,
    )
    .optional()
    .map_err(map_storage_error)
}

/// Exact lookup on the uniqueness key.
pub fn find_protected_item(
    conn: &Connection,
    path: &Path,
    file_types: Option<&[String]>,
) -> VaultResult<Option<ProtectedItem>> {
    conn.query_row(
        &format!(
            "SELECT {ITEM_COLUMNS} FROM protected_items WHERE path = ?1 AND file_types_key = ?2;"
        ),
        params![path_text(path), file_types_key(file_types)],
        item_from_row,
    )
    .optional()
    .map_err(map_storage_error)
}

/// Every item registered for `path`: top-level items first, then per-file
/// children, oldest first within each.
pub fn find_protected_items_by_path(
    conn: &Connection,
    path: &Path,
) -> VaultResult<Vec<ProtectedItem>> {
    query_rows(
        conn,
        &format!(
            "SELECT {ITEM_COLUMNS} FROM protected_items WHERE path = ?1 \
             ORDER BY parent_item_id IS NOT NULL, id;"
        ),
        params![path_text(path)],
        item_from_row,
    )
}

pub fn list_protected_items(conn: &Connection) -> VaultResult<Vec<ProtectedItem>> {
    query_rows(
        conn,
        &format!("SELECT {ITEM_COLUMNS} FROM protected_items ORDER BY path, id;"),
        &[],
        item_from_row,
    )
}

/// Per-file rows owned by the individual-mode item `parent_item_id`.
pub fn list_children(conn: &Connection, parent_item_id: i64) -> VaultResult<Vec<ProtectedItem>> {
    query_rows(
        conn,
        &format!(
            "SELECT {ITEM_COLUMNS} FROM protected_items WHERE parent_item_id = ?1 ORDER BY path;"
        ),
        params![parent_item_id],
        item_from_row,
    )
}

/// Record the outcome of a verify or repair.
pub fn update_item_status(
    conn: &Connection,
    id: i64,
    status: ItemStatus,
    verified_at: i64,
) -> VaultResult<()> {
    let updated = conn
        .execute(
            "UPDATE protected_items SET last_status = ?1, last_verified = ?2 WHERE id = ?3;",
            params![status.as_str(), verified_at, id],
        )
        .map_err(map_storage_error)?;
    if updated == 0 {
        return Err(VaultError::NotFound {
            entity: "protected_items",
            key: id.to_string(),
        });
    }
    tracing::debug!(
        target: "parvault.storage",
        op = "items.update_status",
        item_id = id,
        status = status.as_str(),
        "protected item status updated"
    );
    Ok(())
}

/// Delete the item; history and metadata rows go with it via cascade.
pub fn delete_protected_item(conn: &Connection, id: i64) -> VaultResult<bool> {
    let deleted = conn
        .execute("DELETE FROM protected_items WHERE id = ?1;", [id])
        .map_err(map_storage_error)?;
    Ok(deleted > 0)
}

pub fn redundancy_by_path(conn: &Connection, path: &Path) -> VaultResult<Option<u8>> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT redundancy FROM protected_items WHERE path = ?1 \
             ORDER BY parent_item_id IS NOT NULL, id LIMIT 1;",
            [path_text(path)],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_storage_error)?;
    Ok(value.and_then(|value| u8::try_from(value).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Storage;

    fn sample(path: &str, file_types: Option<Vec<String>>) -> NewProtectedItem {
        NewProtectedItem {
            path: PathBuf::from(path),
            mode: ProtectionMode::Directory,
            redundancy: 10,
            size: 4_096,
            data_size: 4_096,
            par2_size: 512,
            par2_path: PathBuf::from(format!("{path}/.parity/media.par2")),
            file_types,
            parent_dir: None,
            protected_files: Some(vec![PathBuf::from(format!("{path}/a.mkv"))]),
            parent_item_id: None,
        }
    }

    #[test]
    fn upsert_is_keyed_on_path_and_file_types() {
        let storage = Storage::open_in_memory().expect("storage");
        let all = sample("/mnt/user/media", None);
        let mkv = sample("/mnt/user/media", Some(vec!["mkv".into()]));

        let (first, again, other) = storage
            .transaction(|conn| {
                let first = upsert_protected_item(conn, &all, 1)?;
                let mut bumped = all.clone();
                bumped.redundancy = 20;
                let again = upsert_protected_item(conn, &bumped, 2)?;
                let other = upsert_protected_item(conn, &mkv, 3)?;
                Ok((first, again, other))
            })
            .expect("upserts");

        assert_eq!(first, again, "same key refreshes the existing row");
        assert_ne!(first, other, "different file_types is a different item");

        let items = storage
            .read(|conn| find_protected_items_by_path(conn, Path::new("/mnt/user/media")))
            .expect("lookup");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].redundancy, 20);
        assert_eq!(items[0].protected_date, 2);
        assert_eq!(items[1].file_types, Some(vec!["mkv".to_owned()]));

        let exact = storage
            .read(|conn| {
                find_protected_item(
                    conn,
                    Path::new("/mnt/user/media"),
                    Some(&["mkv".to_owned()][..]),
                )
            })
            .expect("exact lookup")
            .expect("row");
        assert_eq!(exact.id, other);
    }

    #[test]
    fn children_belong_to_their_parent_item() {
        let storage = Storage::open_in_memory().expect("storage");
        let individual = |category: &str, ext: &str| {
            let mut item = sample("/mnt/user/mixed", Some(vec![ext.to_owned()]));
            item.mode = ProtectionMode::IndividualFiles {
                category: category.to_owned(),
            };
            item
        };
        let child = |file: &str, parent: i64| NewProtectedItem {
            path: PathBuf::from(file),
            mode: ProtectionMode::File,
            redundancy: 10,
            size: 10,
            data_size: 10,
            par2_size: 1,
            par2_path: PathBuf::from(format!("{file}.par2")),
            file_types: None,
            parent_dir: Some(PathBuf::from("/mnt/user/mixed")),
            protected_files: None,
            parent_item_id: Some(parent),
        };
        let mut standalone = sample("/mnt/user/mixed/a.mkv", None);
        standalone.mode = ProtectionMode::File;
        standalone.protected_files = None;

        let (videos, images, file_item) = storage
            .transaction(|conn| {
                let file_item = upsert_protected_item(conn, &standalone, 1)?;
                let videos = upsert_protected_item(conn, &individual("videos", "mkv"), 1)?;
                let images = upsert_protected_item(conn, &individual("images", "jpg"), 1)?;
                upsert_protected_item(conn, &child("/mnt/user/mixed/a.mkv", videos), 1)?;
                upsert_protected_item(conn, &child("/mnt/user/mixed/b.jpg", images), 1)?;
                Ok((videos, images, file_item))
            })
            .expect("inserts");

        let video_children = storage
            .read(|conn| list_children(conn, videos))
            .expect("children");
        assert_eq!(video_children.len(), 1);
        assert_eq!(video_children[0].path, PathBuf::from("/mnt/user/mixed/a.mkv"));
        assert_eq!(video_children[0].parent_item_id, Some(videos));

        let standalone_row = storage
            .read(|conn| get_protected_item(conn, file_item))
            .expect("get")
            .expect("standalone row survives the child upsert");
        assert_eq!(standalone_row.mode, ProtectionMode::File);
        assert_eq!(standalone_row.parent_item_id, None);

        let by_path = storage
            .read(|conn| find_protected_items_by_path(conn, Path::new("/mnt/user/mixed/a.mkv")))
            .expect("by path");
        assert_eq!(by_path.len(), 2);
        assert_eq!(by_path[0].id, file_item, "top-level item sorts first");

        storage
            .transaction(|conn| delete_protected_item(conn, videos))
            .expect("delete");
        assert!(
            storage
                .read(|conn| list_children(conn, videos))
                .expect("children")
                .is_empty()
        );
        assert_eq!(
            storage
                .read(|conn| list_children(conn, images))
                .expect("children")
                .len(),
            1
        );
    }

    #[test]
    fn status_update_and_redundancy_lookup() {
        let storage = Storage::open_in_memory().expect("storage");
        let id = storage
            .transaction(|conn| upsert_protected_item(conn, &sample("/data", None), 1))
            .expect("insert");

        storage
            .transaction(|conn| update_item_status(conn, id, ItemStatus::Damaged, 99))
            .expect("update");
        let item = storage
            .read(|conn| get_protected_item(conn, id))
            .expect("get")
            .expect("row");
        assert_eq!(item.last_status, ItemStatus::Damaged);
        assert_eq!(item.last_verified, Some(99));

        assert_eq!(
            storage
                .read(|conn| redundancy_by_path(conn, Path::new("/data")))
                .expect("redundancy"),
            Some(10)
        );
        let missing = storage
            .transaction(|conn| update_item_status(conn, 404, ItemStatus::Protected, 1))
            .expect_err("unknown id");
        assert!(matches!(missing, VaultError::NotFound { .. }));
    }
}

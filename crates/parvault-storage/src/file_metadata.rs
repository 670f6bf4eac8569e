use std::collections::BTreeMap;
use std::path::PathBuf;

use parvault_core::VaultResult;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::connection::{map_storage_error, query_rows};
use crate::row::{conversion_error, get_json, get_path, json_text, path_text};

/// Captured ownership, permission and timestamp state of one file.
///
/// Extended attribute values are hex encoded so arbitrary bytes survive the
/// JSON column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataRecord {
    pub file_path: PathBuf,
    pub owner: u32,
    pub group: u32,
    /// Permission bits (`mode & 0o7777`).
    pub permissions: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub xattrs: Option<BTreeMap<String, String>>,
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileMetadataRecord> {
    let as_u32 = |index: usize| -> rusqlite::Result<u32> {
        let value: i64 = row.get(index)?;
        u32::try_from(value).map_err(|error| conversion_error(index, Type::Integer, error))
    };
    Ok(FileMetadataRecord {
        file_path: get_path(row, 0)?,
        owner: as_u32(1)?,
        group: as_u32(2)?,
        permissions: as_u32(3)?,
        mtime_sec: row.get(4)?,
        mtime_nsec: as_u32(5)?,
        xattrs: get_json(row, 6)?,
    })
}

/// Replace every metadata row of an item with `records`.
pub fn replace_file_metadata(
    conn: &Connection,
    protected_item_id: i64,
    records: &[FileMetadataRecord],
    captured_at: i64,
) -> VaultResult<usize> {
    conn.execute(
        "DELETE FROM file_metadata WHERE protected_item_id = ?1;",
        [protected_item_id],
    )
    .map_err(map_storage_error)?;

    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO file_metadata (\
                protected_item_id, file_path, owner, group_id, permissions, mtime_sec, mtime_nsec, \
                xattrs, captured_at\
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
        )
        .map_err(map_storage_error)?;
    for record in records {
        let xattrs = record
            .xattrs
            .as_ref()
            .filter(|map| !map.is_empty())
            .map(json_text)
            .transpose()?;
        stmt.execute(params![
            protected_item_id,
            path_text(&record.file_path),
            record.owner,
            record.group,
            record.permissions,
            record.mtime_sec,
            record.mtime_nsec,
            xattrs,
            captured_at,
        ])
        .map_err(map_storage_error)?;
    }

    tracing::debug!(
        target: "parvault.storage",
        op = "metadata.replace",
        item_id = protected_item_id,
        files = records.len(),
        "file metadata replaced"
    );
    Ok(records.len())
}

pub fn list_file_metadata(
    conn: &Connection,
    protected_item_id: i64,
) -> VaultResult<Vec<FileMetadataRecord>> {
    query_rows(
        conn,
        "SELECT file_path, owner, group_id, permissions, mtime_sec, mtime_nsec, xattrs \
         FROM file_metadata WHERE protected_item_id = ?1 ORDER BY file_path;",
        params![protected_item_id],
        record_from_row,
    )
}

#[cfg(test)]
mod tests {
    use parvault_core::ProtectionMode;

    use super::*;
    use crate::connection::Storage;
    use crate::protected_items::{NewProtectedItem, delete_protected_item, upsert_protected_item};
    use crate::verification_history::{append_history, count_history};

    fn record(path: &str, mode: u32) -> FileMetadataRecord {
        FileMetadataRecord {
            file_path: PathBuf::from(path),
            owner: 99,
            group: 100,
            permissions: mode,
            mtime_sec: 1_700_000_000,
            mtime_nsec: 5,
            xattrs: Some(BTreeMap::from([(
                "user.comment".to_owned(),
                "6869".to_owned(),
            )])),
        }
    }

    fn seed_item(storage: &Storage) -> i64 {
        let item = NewProtectedItem {
            path: PathBuf::from("/mnt/user/docs"),
            mode: ProtectionMode::Directory,
            redundancy: 5,
            size: 10,
            data_size: 10,
            par2_size: 2,
            par2_path: PathBuf::from("/mnt/user/docs/.parity/docs.par2"),
            file_types: None,
            parent_dir: None,
            protected_files: None,
            parent_item_id: None,
        };
        storage
            .transaction(|conn| upsert_protected_item(conn, &item, 1))
            .expect("seed item")
    }

    #[test]
    fn replace_overwrites_previous_capture() {
        let storage = Storage::open_in_memory().expect("storage");
        let item_id = seed_item(&storage);

        storage
            .transaction(|conn| {
                replace_file_metadata(
                    conn,
                    item_id,
                    &[record("/mnt/user/docs/a", 0o644), record("/mnt/user/docs/b", 0o600)],
                    1,
                )
            })
            .expect("first capture");
        storage
            .transaction(|conn| {
                replace_file_metadata(conn, item_id, &[record("/mnt/user/docs/a", 0o640)], 2)
            })
            .expect("second capture");

        let rows = storage
            .read(|conn| list_file_metadata(conn, item_id))
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].permissions, 0o640);
        assert_eq!(
            rows[0].xattrs.as_ref().and_then(|m| m.get("user.comment")),
            Some(&"6869".to_owned())
        );
    }

    #[test]
    fn deleting_item_cascades_to_history_and_metadata() {
        let storage = Storage::open_in_memory().expect("storage");
        let item_id = seed_item(&storage);
        storage
            .transaction(|conn| {
                replace_file_metadata(conn, item_id, &[record("/mnt/user/docs/a", 0o644)], 1)?;
                append_history(conn, item_id, parvault_core::ItemStatus::Protected, None, 1)?;
                Ok(())
            })
            .expect("seed rows");

        let deleted = storage
            .transaction(|conn| delete_protected_item(conn, item_id))
            .expect("delete");
        assert!(deleted);
        assert!(
            storage
                .read(|conn| list_file_metadata(conn, item_id))
                .expect("list")
                .is_empty()
        );
        assert_eq!(
            storage
                .read(|conn| count_history(conn, item_id))
                .expect("count"),
            0
        );
    }
}

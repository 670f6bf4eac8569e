use parvault_core::{ItemStatus, VaultResult};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::connection::{map_storage_error, query_rows};
use crate::row::conversion_error;

/// Append-only record of one verify or repair outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: i64,
    pub protected_item_id: i64,
    pub timestamp: i64,
    pub status: ItemStatus,
    pub details: Option<String>,
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<VerificationRecord> {
    let status: String = row.get(3)?;
    Ok(VerificationRecord {
        id: row.get(0)?,
        protected_item_id: row.get(1)?,
        timestamp: row.get(2)?,
        status: ItemStatus::parse(&status).ok_or_else(|| {
            conversion_error(3, Type::Text, format!("unknown item status {status:?}"))
        })?,
        details: row.get(4)?,
    })
}

pub fn append_history(
    conn: &Connection,
    protected_item_id: i64,
    status: ItemStatus,
    details: Option<&str>,
    timestamp: i64,
) -> VaultResult<i64> {
    conn.execute(
        "INSERT INTO verification_history (protected_item_id, timestamp, status, details) \
         VALUES (?1, ?2, ?3, ?4);",
        params![protected_item_id, timestamp, status.as_str(), details],
    )
    .map_err(map_storage_error)?;
    let id = conn.last_insert_rowid();
    tracing::debug!(
        target: "parvault.storage",
        op = "history.append",
        item_id = protected_item_id,
        status = status.as_str(),
        "verification history appended"
    );
    Ok(id)
}

/// History for one item, newest first.
pub fn history_for_item(
    conn: &Connection,
    protected_item_id: i64,
    limit: usize,
) -> VaultResult<Vec<VerificationRecord>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    query_rows(
        conn,
        "SELECT id, protected_item_id, timestamp, status, details FROM verification_history \
         WHERE protected_item_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2;",
        params![protected_item_id, limit],
        record_from_row,
    )
}

pub fn count_history(conn: &Connection, protected_item_id: i64) -> VaultResult<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM verification_history WHERE protected_item_id = ?1;",
            [protected_item_id],
            |row| row.get(0),
        )
        .map_err(map_storage_error)?;
    Ok(u64::try_from(count).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use parvault_core::ProtectionMode;

    use super::*;
    use crate::connection::Storage;
    use crate::protected_items::{NewProtectedItem, upsert_protected_item};

    fn seed_item(storage: &Storage) -> i64 {
        let item = NewProtectedItem {
            path: PathBuf::from("/mnt/user/photos"),
            mode: ProtectionMode::Directory,
            redundancy: 10,
            size: 1,
            data_size: 1,
            par2_size: 1,
            par2_path: PathBuf::from("/mnt/user/photos/.parity/photos.par2"),
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
    fn history_is_returned_newest_first() {
        let storage = Storage::open_in_memory().expect("storage");
        let item_id = seed_item(&storage);
        storage
            .transaction(|conn| {
                append_history(conn, item_id, ItemStatus::Protected, Some("created"), 10)?;
                append_history(conn, item_id, ItemStatus::Damaged, Some("a.jpg damaged"), 20)?;
                append_history(conn, item_id, ItemStatus::Repaired, None, 30)?;
                Ok(())
            })
            .expect("append");

        let records = storage
            .read(|conn| history_for_item(conn, item_id, 2))
            .expect("history");
        let statuses: Vec<ItemStatus> = records.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![ItemStatus::Repaired, ItemStatus::Damaged]);
        assert_eq!(
            storage
                .read(|conn| count_history(conn, item_id))
                .expect("count"),
            3
        );
    }

    #[test]
    fn history_requires_existing_item() {
        let storage = Storage::open_in_memory().expect("storage");
        let result = storage
            .transaction(|conn| append_history(conn, 999, ItemStatus::Error, None, 1));
        assert!(result.is_err(), "foreign key must reject orphan history");
    }
}

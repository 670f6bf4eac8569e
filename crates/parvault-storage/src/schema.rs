use std::io;

use parvault_core::{VaultError, VaultResult};
use rusqlite::{Connection, OptionalExtension};

use crate::connection::map_storage_error;

pub const SCHEMA_VERSION: i64 = 4;

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        statements: &[
            "CREATE TABLE IF NOT EXISTS protected_items (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                path TEXT NOT NULL,\
                mode TEXT NOT NULL,\
                redundancy INTEGER NOT NULL,\
                protected_date INTEGER NOT NULL,\
                last_verified INTEGER,\
                last_status TEXT NOT NULL,\
                size INTEGER NOT NULL DEFAULT 0,\
                data_size INTEGER NOT NULL DEFAULT 0,\
                par2_size INTEGER NOT NULL DEFAULT 0,\
                par2_path TEXT NOT NULL,\
                file_types TEXT,\
                file_types_key TEXT NOT NULL DEFAULT '',\
                parent_dir TEXT,\
                protected_files TEXT,\
                UNIQUE(path, file_types_key)\
            );",
            "CREATE INDEX IF NOT EXISTS idx_protected_items_path ON protected_items(path);",
            "CREATE INDEX IF NOT EXISTS idx_protected_items_status ON protected_items(last_status);",
            "CREATE INDEX IF NOT EXISTS idx_protected_items_parent_dir ON protected_items(parent_dir);",
            "CREATE TABLE IF NOT EXISTS verification_history (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                protected_item_id INTEGER NOT NULL REFERENCES protected_items(id) ON DELETE CASCADE,\
                timestamp INTEGER NOT NULL,\
                status TEXT NOT NULL,\
                details TEXT\
            );",
            "CREATE INDEX IF NOT EXISTS idx_verification_history_item ON verification_history(protected_item_id, timestamp DESC);",
        ],
    },
    Migration {
        version: 2,
        statements: &[
            "CREATE TABLE IF NOT EXISTS file_metadata (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                protected_item_id INTEGER NOT NULL REFERENCES protected_items(id) ON DELETE CASCADE,\
                file_path TEXT NOT NULL,\
                owner INTEGER NOT NULL,\
                group_id INTEGER NOT NULL,\
                permissions INTEGER NOT NULL,\
                mtime_sec INTEGER NOT NULL,\
                mtime_nsec INTEGER NOT NULL DEFAULT 0,\
                xattrs TEXT,\
                captured_at INTEGER NOT NULL,\
                UNIQUE(protected_item_id, file_path)\
            );",
            "CREATE INDEX IF NOT EXISTS idx_file_metadata_item ON file_metadata(protected_item_id);",
        ],
    },
    Migration {
        version: 3,
        statements: &[
            "CREATE TABLE IF NOT EXISTS operation_queue (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                operation_type TEXT NOT NULL,\
                parameters TEXT NOT NULL,\
                status TEXT NOT NULL DEFAULT 'pending',\
                created_at INTEGER NOT NULL,\
                started_at INTEGER,\
                completed_at INTEGER,\
                updated_at INTEGER NOT NULL,\
                result TEXT,\
                pid INTEGER\
            );",
            "CREATE INDEX IF NOT EXISTS idx_operation_queue_pending ON operation_queue(created_at, id) WHERE status = 'pending';",
            "CREATE INDEX IF NOT EXISTS idx_operation_queue_status ON operation_queue(status, updated_at);",
        ],
    },
    // Per-file children point at the individual-mode item that owns them and
    // take a `parent:<id>` uniqueness key so they never collide with a
    // top-level item on the same path.
    Migration {
        version: 4,
        statements: &[
            "ALTER TABLE protected_items ADD COLUMN parent_item_id INTEGER \
                REFERENCES protected_items(id) ON DELETE CASCADE;",
            "CREATE INDEX IF NOT EXISTS idx_protected_items_parent_item ON protected_items(parent_item_id);",
            "UPDATE protected_items AS child SET parent_item_id = (\
                SELECT owner.id FROM protected_items AS owner, json_each(owner.protected_files) AS listed \
                WHERE owner.path = child.parent_dir AND owner.parent_dir IS NULL \
                  AND listed.value = child.path \
                ORDER BY owner.id LIMIT 1\
             ) WHERE child.parent_dir IS NOT NULL;",
            "UPDATE protected_items SET file_types_key = 'parent:' || parent_item_id \
             WHERE parent_item_id IS NOT NULL;",
        ],
    },
];

/// Create or upgrade the schema. Each migration commits atomically with its
/// `schema_version` row.
pub fn bootstrap(conn: &Connection) -> VaultResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")
        .map_err(map_storage_error)?;

    let mut version = current_version_optional(conn)?.unwrap_or(0);
    if version > SCHEMA_VERSION {
        return Err(VaultError::SubsystemError {
            subsystem: "storage",
            source: Box::new(io::Error::other(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}; upgrade parvault"
            ))),
        });
    }

    for migration in MIGRATIONS {
        if migration.version <= version {
            continue;
        }

        tracing::debug!(
            target: "parvault.storage",
            from_version = version,
            to_version = migration.version,
            "applying storage schema migration"
        );

        conn.execute_batch("BEGIN IMMEDIATE;")
            .map_err(map_storage_error)?;
        if let Err(error) = apply_migration(conn, migration) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(error);
        }
        conn.execute_batch("COMMIT;").map_err(|error| {
            let _ = conn.execute_batch("ROLLBACK;");
            map_storage_error(error)
        })?;
        version = migration.version;
    }

    tracing::debug!(
        target: "parvault.storage",
        schema_version = version,
        "storage schema bootstrap complete"
    );

    Ok(())
}

fn apply_migration(conn: &Connection, migration: &Migration) -> VaultResult<()> {
    for statement in migration.statements {
        conn.execute_batch(statement).map_err(map_storage_error)?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO schema_version(version) VALUES (?1);",
        [migration.version],
    )
    .map_err(map_storage_error)?;
    Ok(())
}

pub fn current_version(conn: &Connection) -> VaultResult<i64> {
    current_version_optional(conn)?.ok_or_else(|| VaultError::SubsystemError {
        subsystem: "storage",
        source: Box::new(io::Error::other("schema_version table has no rows")),
    })
}

fn current_version_optional(conn: &Connection) -> VaultResult<Option<i64>> {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1;",
        [],
        |row| row.get(0),
    )
    .optional()
    .map_err(map_storage_error)
}

//! Column conversions shared by the table modules.

use std::error::Error;
use std::path::{Path, PathBuf};

use parvault_core::{VaultError, VaultResult};
use rusqlite::Row;
use rusqlite::types::Type;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn conversion_error(
    index: usize,
    column_type: Type,
    error: impl Into<Box<dyn Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, column_type, error.into())
}

pub(crate) fn get_u64(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    u64::try_from(value).map_err(|error| conversion_error(index, Type::Integer, error))
}

pub(crate) fn get_optional_u32(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<u32>> {
    let value: Option<i64> = row.get(index)?;
    value
        .map(|value| u32::try_from(value).map_err(|error| conversion_error(index, Type::Integer, error)))
        .transpose()
}

pub(crate) fn get_path(row: &Row<'_>, index: usize) -> rusqlite::Result<PathBuf> {
    row.get::<_, String>(index).map(PathBuf::from)
}

pub(crate) fn get_optional_path(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<PathBuf>> {
    row.get::<_, Option<String>>(index)
        .map(|value| value.map(PathBuf::from))
}

pub(crate) fn get_json<T: DeserializeOwned>(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|error| conversion_error(index, Type::Text, error))
    })
    .transpose()
}

pub(crate) fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn json_text<T: Serialize + ?Sized>(value: &T) -> VaultResult<String> {
    serde_json::to_string(value).map_err(|error| VaultError::SubsystemError {
        subsystem: "serialization",
        source: Box::new(error),
    })
}

pub(crate) fn to_i64(value: u64, field: &str) -> VaultResult<i64> {
    i64::try_from(value).map_err(|_| {
        VaultError::invalid_parameter(field, value.to_string(), "does not fit into a SQLite integer")
    })
}

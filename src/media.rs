use crate::config::TARGET_MIME_TYPE;
use crate::db::OptionalRowExt;
use crate::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A media library entry owning one stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: i64,
    pub author_id: Option<i64>,
    pub file_path: String,
    pub source_url: String,
    pub mime_type: String,
    pub metadata_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSize {
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub filesize: u64,
}

/// Dimensions of the primary file plus every generated size, keyed by size name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantMetadata {
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
    pub sizes: BTreeMap<String, GeneratedSize>,
}

const RECORD_COLUMNS: &str = "id, author_id, file_path, source_url, mime_type, metadata_json";

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRecord> {
    Ok(MediaRecord {
        id: row.get(0)?,
        author_id: row.get(1)?,
        file_path: row.get(2)?,
        source_url: row.get(3)?,
        mime_type: row.get(4)?,
        metadata_json: row.get(5)?,
    })
}

/// Owning record of a locator: by public URL first, then by stored relative path.
pub fn find_owning_record(
    conn: &Connection,
    public_url: &str,
    locator: &str,
) -> Result<Option<MediaRecord>> {
    let by_url = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM media_record WHERE source_url=?1 ORDER BY id LIMIT 1"),
            params![public_url],
            map_record,
        )
        .optional()?;
    if by_url.is_some() {
        return Ok(by_url);
    }

    let normalized = normalize_relative(locator);
    let by_path = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM media_record WHERE file_path=?1 ORDER BY id LIMIT 1"),
            params![normalized],
            map_record,
        )
        .optional()?;
    Ok(by_path)
}

fn normalize_relative(locator: &str) -> String {
    locator
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

/// Display name, else login, else `ID <n>`.
pub fn author_label(conn: &Connection, author_id: i64) -> Result<String> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT display_name, login FROM author WHERE id=?1",
            params![author_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let label = match row {
        Some((display, _)) if !display.trim().is_empty() => display,
        Some((_, login)) if !login.trim().is_empty() => login,
        _ => format!("ID {author_id}"),
    };
    Ok(label)
}

/// Points the record at its converted file and replaces its variant metadata.
pub fn repoint_record(
    conn: &Connection,
    record_id: i64,
    new_locator: &str,
    new_url: &str,
    metadata: &VariantMetadata,
) -> Result<()> {
    let metadata_json = serde_json::to_string(metadata)?;
    conn.execute(
        "UPDATE media_record SET file_path=?1, source_url=?2, mime_type=?3, metadata_json=?4 WHERE id=?5",
        params![new_locator, new_url, TARGET_MIME_TYPE, metadata_json, record_id],
    )?;
    Ok(())
}

pub fn insert_author(conn: &Connection, display_name: &str, login: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO author(display_name, login) VALUES(?1, ?2)",
        params![display_name, login],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_record(
    conn: &Connection,
    author_id: Option<i64>,
    file_path: &str,
    source_url: &str,
    mime_type: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO media_record(author_id, file_path, source_url, mime_type) VALUES(?1, ?2, ?3, ?4)",
        params![author_id, normalize_relative(file_path), source_url, mime_type],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_record(conn: &Connection, record_id: i64) -> Result<Option<MediaRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM media_record WHERE id=?1"),
            params![record_id],
            map_record,
        )
        .optional()?;
    Ok(record)
}

//! Reference scanning and URL rewriting across the structured content stores.

use crate::Result;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};

/// A text column that may mention a media locator.
#[derive(Debug, Clone, Copy)]
pub struct StoreColumn {
    pub table: &'static str,
    pub column: &'static str,
}

pub const REFERENCE_STORES: &[StoreColumn] = &[
    StoreColumn { table: "content", column: "body" },
    StoreColumn { table: "content", column: "guid" },
    StoreColumn { table: "record_attribute", column: "value" },
    StoreColumn { table: "term_attribute", column: "value" },
    StoreColumn { table: "actor_attribute", column: "value" },
    StoreColumn { table: "config_entry", column: "value" },
];

/// Stored values as a tagged tree. Structured values are JSON objects or
/// arrays; anything else is a single text leaf kept byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTree {
    Mapping(Vec<(String, ValueTree)>),
    Sequence(Vec<ValueTree>),
    Text(String),
    Scalar(Value),
}

impl ValueTree {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                return Self::from_json(value);
            }
        }
        ValueTree::Text(raw.to_string())
    }

    fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => ValueTree::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
            Value::Array(items) => {
                ValueTree::Sequence(items.into_iter().map(Self::from_json).collect())
            }
            Value::String(s) => ValueTree::Text(s),
            other => ValueTree::Scalar(other),
        }
    }

    fn into_json(self) -> Value {
        match self {
            ValueTree::Mapping(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    map.insert(k, v.into_json());
                }
                Value::Object(map)
            }
            ValueTree::Sequence(items) => {
                Value::Array(items.into_iter().map(Self::into_json).collect())
            }
            ValueTree::Text(s) => Value::String(s),
            ValueTree::Scalar(v) => v,
        }
    }

    /// Serializes back into the stored representation.
    pub fn render(self) -> Result<String> {
        match self {
            ValueTree::Text(s) => Ok(s),
            other => Ok(serde_json::to_string(&other.into_json())?),
        }
    }

    /// Rebuilds the tree with `f` applied to every string leaf. Mapping keys
    /// and non-string leaves are left alone.
    pub fn map_text<F>(self, f: &mut F) -> ValueTree
    where
        F: FnMut(String) -> String,
    {
        match self {
            ValueTree::Mapping(entries) => ValueTree::Mapping(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.map_text(f)))
                    .collect(),
            ),
            ValueTree::Sequence(items) => {
                ValueTree::Sequence(items.into_iter().map(|v| v.map_text(f)).collect())
            }
            ValueTree::Text(s) => ValueTree::Text(f(s)),
            scalar @ ValueTree::Scalar(_) => scalar,
        }
    }

    pub fn replace_text(self, old: &str, new: &str) -> ValueTree {
        self.map_text(&mut |s: String| {
            if s.contains(old) {
                s.replace(old, new)
            } else {
                s
            }
        })
    }
}

/// True when any store row mentions `needle` (case-sensitive substring).
pub fn has_reference(conn: &Connection, needle: &str) -> Result<bool> {
    if needle.is_empty() {
        return Ok(false);
    }
    for store in REFERENCE_STORES {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE instr({}, ?1) > 0)",
            store.table, store.column
        );
        let found: i64 = conn.query_row(&sql, params![needle], |row| row.get(0))?;
        if found != 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub rows_matched: usize,
    pub rows_updated: usize,
}

/// Replaces `old` with `new` in every stored string leaf, paging through each
/// store by primary key in batches of `batch_size`.
pub fn rewrite_all(
    conn: &Connection,
    old: &str,
    new: &str,
    batch_size: usize,
) -> Result<RewriteReport> {
    let mut report = RewriteReport::default();
    if old.is_empty() || old == new {
        return Ok(report);
    }
    let batch_size = batch_size.max(1);

    for store in REFERENCE_STORES {
        let select = format!(
            "SELECT id, {col} FROM {table} WHERE id > ?1 AND instr({col}, ?2) > 0 ORDER BY id ASC LIMIT ?3",
            col = store.column,
            table = store.table
        );
        let update = format!(
            "UPDATE {table} SET {col}=?1 WHERE id=?2",
            col = store.column,
            table = store.table
        );

        let mut cursor = 0_i64;
        loop {
            let rows: Vec<(i64, String)> = {
                let mut stmt = conn.prepare(&select)?;
                let mapped = stmt.query_map(params![cursor, old, batch_size as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                mapped.collect::<std::result::Result<_, _>>()?
            };

            for (id, raw) in &rows {
                report.rows_matched += 1;
                let original = ValueTree::parse(raw);
                let updated = original.clone().replace_text(old, new);
                if updated != original {
                    conn.execute(&update, params![updated.render()?, id])?;
                    report.rows_updated += 1;
                }
            }

            match rows.last() {
                Some((id, _)) => cursor = *id,
                None => break,
            }
            if rows.len() < batch_size {
                break;
            }
        }
    }

    Ok(report)
}

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::models::{FileMetadata, RelativePath};

const FILE_DB_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    signature TEXT NOT NULL,
    size INTEGER NOT NULL,
    last_modified TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_metadata_hash ON file_metadata(hash);
"#;

pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("open metadata index {}", path.display()))?;
    conn.execute_batch(FILE_DB_SCHEMA)
        .context("init metadata index schema")?;
    Ok(conn)
}

fn rows_to_metadata(rows: Vec<(String, String, String, i64, String)>) -> Result<Vec<FileMetadata>> {
    let mut out = Vec::with_capacity(rows.len());
    for (path, hash, signature, size, last_modified) in rows {
        let path = RelativePath::new(&path)
            .with_context(|| format!("invalid path in metadata index: {path}"))?;
        let last_modified = DateTime::parse_from_rfc3339(&last_modified)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        out.push(FileMetadata {
            path,
            hash,
            signature,
            size: size.max(0) as u64,
            last_modified,
        });
    }
    Ok(out)
}

fn query_metadata(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<FileMetadata>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    let mut raw = Vec::new();
    while let Some(row) = rows.next()? {
        raw.push((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
        ));
    }
    rows_to_metadata(raw)
}

/// All rows whose path matches an SQL LIKE pattern.
pub fn get_all_metadata(conn: &Connection, path_like: &str) -> Result<Vec<FileMetadata>> {
    query_metadata(
        conn,
        "SELECT path, hash, signature, size, last_modified FROM file_metadata WHERE path LIKE ?1 ORDER BY path",
        &[&path_like],
    )
}

/// Exact-path lookup. Mutation endpoints match on this, never on LIKE.
pub fn get_metadata_exact(conn: &Connection, path: &RelativePath) -> Result<Option<FileMetadata>> {
    let rows = query_metadata(
        conn,
        "SELECT path, hash, signature, size, last_modified FROM file_metadata WHERE path = ?1",
        &[&path.as_str()],
    )?;
    Ok(rows.into_iter().next())
}

pub fn all_metadata(conn: &Connection) -> Result<Vec<FileMetadata>> {
    query_metadata(
        conn,
        "SELECT path, hash, signature, size, last_modified FROM file_metadata ORDER BY path",
        &[],
    )
}

/// Move freshly-written content into its snapshot location and update the
/// index row inside one transaction. The rename happens before commit so a
/// failed move leaves the index untouched.
pub fn move_with_transaction(
    conn: &mut Connection,
    snapshot_root: &Path,
    origin_path: &Path,
    metadata: &FileMetadata,
) -> Result<()> {
    let target = metadata.path.to_fs_path(snapshot_root);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }

    let tx = conn.transaction().context("begin metadata tx")?;
    tx.execute(
        "INSERT OR REPLACE INTO file_metadata (path, hash, signature, size, last_modified) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            metadata.path.as_str(),
            metadata.hash,
            metadata.signature,
            metadata.size as i64,
            metadata.last_modified.to_rfc3339(),
        ],
    )?;
    fs::rename(origin_path, &target).with_context(|| {
        format!("rename {} -> {}", origin_path.display(), target.display())
    })?;
    tx.commit().context("commit metadata tx")?;
    Ok(())
}

/// Remove the index row and the snapshot file inside one transaction.
pub fn delete_with_transaction(
    conn: &mut Connection,
    snapshot_root: &Path,
    path: &RelativePath,
) -> Result<()> {
    let abs = path.to_fs_path(snapshot_root);
    let tx = conn.transaction().context("begin metadata tx")?;
    tx.execute(
        "DELETE FROM file_metadata WHERE path = ?1",
        params![path.as_str()],
    )?;
    if abs.exists() {
        fs::remove_file(&abs).with_context(|| format!("remove {}", abs.display()))?;
    }
    tx.commit().context("commit metadata tx")?;
    Ok(())
}

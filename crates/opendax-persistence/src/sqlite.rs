// SPDX-License-Identifier: MIT

//! A structured retention backend, for deployments that want to inspect or
//! back up retained tags with ordinary SQL tooling instead of the flat-file
//! format's private record layout.

use std::path::Path;

use anyhow::Context;
use rusqlite::{params, Connection};

use opendax_core::error::{Error, Result};
use opendax_core::retention::{RetainedTag, RetainedType, RetentionStore};

/// Retention backed by a local SQLite database.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .context("opening retention database")
            .map_err(to_error)?;
        Self::with_connection(conn)
    }

    /// Builds an in-memory store, used by tests and by a server started
    /// without a configured retention path.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("opening in-memory retention database")
            .map_err(to_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS types (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                spec TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tags (
                name     TEXT PRIMARY KEY,
                tag_type INTEGER NOT NULL,
                count    INTEGER NOT NULL,
                attr     INTEGER NOT NULL,
                data     BLOB NOT NULL
            );",
        )
        .context("creating retention schema")
        .map_err(to_error)?;
        Ok(SqliteStore { conn })
    }
}

fn to_error(e: anyhow::Error) -> Error {
    Error::Io(e.to_string())
}

impl RetentionStore for SqliteStore {
    fn load_types(&mut self) -> Result<Vec<RetainedType>> {
        let mut stmt = self
            .conn
            .prepare("SELECT spec FROM types ORDER BY id")
            .map_err(|e| Error::Io(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Io(e.to_string()))?;
        let mut out = Vec::new();
        for spec in rows {
            out.push(RetainedType {
                spec: spec.map_err(|e| Error::Io(e.to_string()))?,
            });
        }
        Ok(out)
    }

    fn load_tags(&mut self) -> Result<Vec<RetainedTag>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, tag_type, count, attr, data FROM tags")
            .map_err(|e| Error::Io(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RetainedTag {
                    name: row.get(0)?,
                    tag_type: row.get(1)?,
                    count: row.get(2)?,
                    attr: row.get(3)?,
                    data: row.get(4)?,
                })
            })
            .map_err(|e| Error::Io(e.to_string()))?;
        let mut out = Vec::new();
        for tag in rows {
            out.push(tag.map_err(|e| Error::Io(e.to_string()))?);
        }
        Ok(out)
    }

    fn record_tag(&mut self, tag: &RetainedTag) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tags (name, tag_type, count, attr, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![tag.name, tag.tag_type, tag.count, tag.attr, tag.data],
            )
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }

    fn persist_write(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<()> {
        let row_id: i64 = self
            .conn
            .query_row("SELECT rowid FROM tags WHERE name = ?1", params![name], |r| r.get(0))
            .map_err(|_| Error::NotFound)?;
        let mut blob = self
            .conn
            .blob_open(rusqlite::DatabaseName::Main, "tags", "data", row_id, false)
            .map_err(|e| Error::Io(e.to_string()))?;
        use std::io::{Seek, SeekFrom, Write};
        blob.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| Error::Io(e.to_string()))?;
        blob.write_all(data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WriteZero {
                Error::TooBig
            } else {
                Error::Io(e.to_string())
            }
        })?;
        Ok(())
    }

    fn record_type(&mut self, spec: &str) -> Result<()> {
        self.conn
            .execute("INSERT INTO types (spec) VALUES (?1)", params![spec])
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }

    fn remove_tag(&mut self, name: &str) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM tags WHERE name = ?1", params![name])
            .map_err(|e| Error::Io(e.to_string()))?;
        if changed == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendax_core::types;

    #[test]
    fn persists_and_reloads_a_tag() {
        let mut store = SqliteStore::in_memory().unwrap();
        store
            .record_tag(&RetainedTag {
                name: "speed".into(),
                tag_type: types::DINT,
                count: 1,
                attr: 0x0004,
                data: vec![0, 0, 0, 0],
            })
            .unwrap();
        store.persist_write("speed", 0, &42i32.to_ne_bytes()).unwrap();
        let tags = store.load_tags().unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(i32::from_ne_bytes(tags[0].data.clone().try_into().unwrap()), 42);
    }

    #[test]
    fn removing_unknown_tag_errors() {
        let mut store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.remove_tag("ghost").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn types_round_trip_in_declaration_order() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.record_type("a:x,DINT,1").unwrap();
        store.record_type("b:y,DINT,1").unwrap();
        let types = store.load_types().unwrap();
        assert_eq!(types[0].spec, "a:x,DINT,1");
        assert_eq!(types[1].spec, "b:y,DINT,1");
    }
}

//! SQLite-backed checkpoint store.
//!
//! One local database file per job. Each committed checkpoint is a
//! single row holding the sealed blob, written in its own transaction
//! so a commit is atomic from the restore side's point of view.

use std::path::Path;
use std::sync::OnceLock;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::EngineResult;

use super::CheckpointId;
use super::CheckpointStore;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE ckpts ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             ckpt_id INTEGER NOT NULL PRIMARY KEY CHECK (ckpt_id > 0), \
             image BLOB NOT NULL \
             ) STRICT",
        )])
    })
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        // These are recommended by Litestream.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        get_migrations().to_latest(&mut conn)?;
        tracing::info!("opened checkpoint store at {:?}", path.as_ref());
        Ok(Self { conn })
    }
}

impl CheckpointStore for SqliteStore {
    fn save(&mut self, id: CheckpointId, blob: &[u8]) -> EngineResult<()> {
        let txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO ckpts (ckpt_id, image) \
             VALUES (?1, ?2) \
             ON CONFLICT (ckpt_id) DO UPDATE \
             SET image = EXCLUDED.image",
            (id.0, blob),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn load(&self, id: CheckpointId) -> EngineResult<Option<Vec<u8>>> {
        let blob = self
            .conn
            .query_row(
                "SELECT image FROM ckpts WHERE ckpt_id = ?1",
                (id.0,),
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn ids(&self) -> EngineResult<Vec<CheckpointId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ckpt_id FROM ckpts ORDER BY ckpt_id ASC")?;
        let ids = stmt
            .query_map((), |row| Ok(CheckpointId(row.get(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn delete(&mut self, id: CheckpointId) -> EngineResult<()> {
        self.conn
            .execute("DELETE FROM ckpts WHERE ckpt_id = ?1", (id.0,))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_valid() -> rusqlite_migration::Result<()> {
        get_migrations().validate()
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::open(dir.path().join("ckpt.sqlite3")).unwrap();
        store.save(CheckpointId(1), b"first").unwrap();
        store.save(CheckpointId(2), b"second").unwrap();
        assert_eq!(store.load(CheckpointId(1)).unwrap().unwrap(), b"first");
        assert_eq!(store.ids().unwrap(), vec![CheckpointId(1), CheckpointId(2)]);
    }

    #[test]
    fn save_same_id_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::open(dir.path().join("ckpt.sqlite3")).unwrap();
        store.save(CheckpointId(1), b"old").unwrap();
        store.save(CheckpointId(1), b"new").unwrap();
        assert_eq!(store.load(CheckpointId(1)).unwrap().unwrap(), b"new");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.sqlite3");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.save(CheckpointId(9), b"durable").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load(CheckpointId(9)).unwrap().unwrap(), b"durable");
    }

    #[test]
    fn delete_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::open(dir.path().join("ckpt.sqlite3")).unwrap();
        store.save(CheckpointId(1), b"x").unwrap();
        store.delete(CheckpointId(1)).unwrap();
        assert_eq!(store.load(CheckpointId(1)).unwrap(), None);
        assert!(store.ids().unwrap().is_empty());
    }
}

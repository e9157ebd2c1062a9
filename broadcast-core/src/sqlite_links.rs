//! SQLite-backed link store
//!
//! One row per (site, item) holding the encoded entry blob. The database
//! runs in WAL mode; writes are single-row upserts.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::link::LinkStore;
use crate::types::ItemRef;

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS link_registry (
            site INTEGER NOT NULL,
            item INTEGER NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (site, item)
        ) WITHOUT ROWID;",
    )?;
    Ok(())
}

/// Link store persisted in a SQLite database file
pub struct SqliteLinkStore {
    conn: Mutex<Connection>,
}

impl SqliteLinkStore {
    /// Open or create the registry database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        tracing::debug!("opened link registry at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored entries
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM link_registry", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LinkStore for SqliteLinkStore {
    fn read(&self, item: ItemRef) -> Result<Option<Vec<u8>>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT data FROM link_registry WHERE site=?1 AND item=?2")?;
        let data = stmt
            .query_row(params![item.site as i64, item.item as i64], |r| {
                r.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(data)
    }

    fn write(&self, item: ItemRef, data: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO link_registry (site,item,data) VALUES (?1,?2,?3) \
             ON CONFLICT(site,item) DO UPDATE SET data=excluded.data",
            params![item.site as i64, item.item as i64, data],
        )?;
        Ok(())
    }

    fn remove(&self, item: ItemRef) -> Result<()> {
        self.conn().execute(
            "DELETE FROM link_registry WHERE site=?1 AND item=?2",
            params![item.site as i64, item.item as i64],
        )?;
        Ok(())
    }
}

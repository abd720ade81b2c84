//! Durable `person name -> gallery entry` storage.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use veil_core::GalleryEntry;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt entry for {person}: {source}")]
    Corrupt {
        person: String,
        source: serde_json::Error,
    },
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Key-value store holding one entry per person.
pub trait GalleryStore: Send + Sync {
    fn get(&self, person: &str) -> Result<Option<GalleryEntry>, StoreError>;
    /// All entries, ordered by person name.
    fn get_all(&self) -> Result<Vec<GalleryEntry>, StoreError>;
    /// Insert or replace the entry named `entry.person`.
    fn put(&self, entry: &GalleryEntry) -> Result<(), StoreError>;
    /// Returns whether an entry was removed.
    fn delete(&self, person: &str) -> Result<bool, StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// SQLite-backed store. Each row holds the JSON-encoded entry.
pub struct SqliteGalleryStore {
    conn: Mutex<Connection>,
}

impl SqliteGalleryStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "gallery database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gallery (
                person TEXT PRIMARY KEY NOT NULL,
                entry  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode(person: String, json: &str) -> Result<GalleryEntry, StoreError> {
        serde_json::from_str(json).map_err(|source| StoreError::Corrupt { person, source })
    }
}

impl GalleryStore for SqliteGalleryStore {
    fn get(&self, person: &str) -> Result<Option<GalleryEntry>, StoreError> {
        let conn = lock(&self.conn);
        let json: Option<String> = conn
            .query_row(
                "SELECT entry FROM gallery WHERE person = ?1",
                params![person],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| Self::decode(person.to_string(), &json))
            .transpose()
    }

    fn get_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare("SELECT person, entry FROM gallery ORDER BY person")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut entries = Vec::new();
        for row in rows {
            let (person, json) = row?;
            match Self::decode(person, &json) {
                Ok(entry) => entries.push(entry),
                // Skip the broken row; the rest of the gallery stays usable.
                Err(e) => tracing::warn!(error = %e, "skipping unreadable gallery row"),
            }
        }
        Ok(entries)
    }

    fn put(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)?;
        lock(&self.conn).execute(
            "INSERT INTO gallery (person, entry) VALUES (?1, ?2)
             ON CONFLICT(person) DO UPDATE SET entry = excluded.entry",
            params![entry.person, json],
        )?;
        Ok(())
    }

    fn delete(&self, person: &str) -> Result<bool, StoreError> {
        let removed = lock(&self.conn).execute("DELETE FROM gallery WHERE person = ?1", params![person])?;
        Ok(removed > 0)
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.conn).execute("DELETE FROM gallery", [])?;
        Ok(())
    }
}

/// Non-durable store for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryGalleryStore {
    entries: Mutex<BTreeMap<String, GalleryEntry>>,
}

impl MemoryGalleryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GalleryStore for MemoryGalleryStore {
    fn get(&self, person: &str) -> Result<Option<GalleryEntry>, StoreError> {
        Ok(lock(&self.entries).get(person).cloned())
    }

    fn get_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(lock(&self.entries).values().cloned().collect())
    }

    fn put(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        lock(&self.entries).insert(entry.person.clone(), entry.clone());
        Ok(())
    }

    fn delete(&self, person: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.entries).remove(person).is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.entries).clear();
        Ok(())
    }
}

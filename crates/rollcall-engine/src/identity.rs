//! External identity store adapters.
//!
//! The surrounding application owns identities; the engine only needs to
//! list enrolled ones, look one up, and flip `face_registered` after a
//! durable sample write.

use rollcall_core::IdentityId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity {0} not found")]
    NotFound(IdentityId),
    #[error("identity database: {0}")]
    Database(#[from] rusqlite::Error),
}

/// An identity record as held by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub face_registered: bool,
}

pub trait IdentityStore: Send + Sync {
    /// Identities with `face_registered = true`.
    fn registered(&self) -> Result<Vec<Identity>, IdentityError>;

    fn lookup(&self, id: IdentityId) -> Result<Option<Identity>, IdentityError>;

    /// Set `face_registered = true`. Fails with `NotFound` for unknown ids.
    fn mark_registered(&self, id: IdentityId) -> Result<(), IdentityError>;
}

/// In-process identity store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<BTreeMap<IdentityId, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: IdentityId, name: impl Into<String>) {
        let mut map = self.identities.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            id,
            Identity {
                id,
                name: name.into(),
                face_registered: false,
            },
        );
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn registered(&self) -> Result<Vec<Identity>, IdentityError> {
        let map = self.identities.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.values().filter(|i| i.face_registered).cloned().collect())
    }

    fn lookup(&self, id: IdentityId) -> Result<Option<Identity>, IdentityError> {
        let map = self.identities.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(&id).cloned())
    }

    fn mark_registered(&self, id: IdentityId) -> Result<(), IdentityError> {
        let mut map = self.identities.write().unwrap_or_else(PoisonError::into_inner);
        let identity = map.get_mut(&id).ok_or(IdentityError::NotFound(id))?;
        identity.face_registered = true;
        Ok(())
    }
}

const CREATE_STUDENTS: &str = "CREATE TABLE IF NOT EXISTS students (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    face_registered INTEGER NOT NULL DEFAULT 0
)";

/// Identity store over the attendance application's `students` table.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "could not create identity db directory");
            }
        }
        let store = Self::from_connection(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "identity database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, IdentityError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, IdentityError> {
        conn.execute_batch(CREATE_STUDENTS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or rename an identity, leaving its registration flag alone.
    pub fn upsert(&self, id: IdentityId, name: &str) -> Result<(), IdentityError> {
        self.conn().execute(
            "INSERT INTO students (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id.0, name],
        )?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Identity>, IdentityError> {
        self.query("SELECT id, name, face_registered FROM students ORDER BY id", [])
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Identity>, IdentityError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_identity)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(IdentityError::from)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: IdentityId(row.get(0)?),
        name: row.get(1)?,
        face_registered: row.get(2)?,
    })
}

impl IdentityStore for SqliteIdentityStore {
    fn registered(&self) -> Result<Vec<Identity>, IdentityError> {
        self.query(
            "SELECT id, name, face_registered FROM students WHERE face_registered = 1 ORDER BY id",
            [],
        )
    }

    fn lookup(&self, id: IdentityId) -> Result<Option<Identity>, IdentityError> {
        let conn = self.conn();
        let identity = conn
            .query_row(
                "SELECT id, name, face_registered FROM students WHERE id = ?1",
                params![id.0],
                row_to_identity,
            )
            .optional()?;
        Ok(identity)
    }

    fn mark_registered(&self, id: IdentityId) -> Result<(), IdentityError> {
        let changed = self.conn().execute(
            "UPDATE students SET face_registered = 1 WHERE id = ?1",
            params![id.0],
        )?;
        if changed == 0 {
            return Err(IdentityError::NotFound(id));
        }
        Ok(())
    }
}

//! Durable store backends: SQLite, a JSON snapshot file, and an in-memory
//! backend for tests.

use crate::store::{Snapshot, StoreBackend, StoreError};
use crate::types::Embedding;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL
)";

/// Which durable backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Json,
}

impl BackendKind {
    /// Default file name under the data directory.
    pub fn default_file_name(self) -> &'static str {
        match self {
            BackendKind::Sqlite => "faces.db",
            BackendKind::Json => "known_faces.json",
        }
    }

    /// Guess the backend from a store file's extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(BackendKind::Json),
            "db" | "sqlite" | "sqlite3" => Some(BackendKind::Sqlite),
            _ => None,
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "json" => Ok(BackendKind::Json),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Open the configured backend.
pub fn open_backend(kind: BackendKind, path: &Path) -> Result<Box<dyn StoreBackend>, StoreError> {
    let backend: Box<dyn StoreBackend> = match kind {
        BackendKind::Sqlite => Box::new(SqliteBackend::open(path)?),
        BackendKind::Json => Box::new(JsonFileBackend::new(path)),
    };
    Ok(backend)
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// SQLite-backed store: one row per observation, ordered by insertion.
pub struct SqliteBackend {
    conn: Connection,
    path: PathBuf,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        ensure_parent(path)?;
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

fn encode_vector(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

/// Decode a little-endian f32 blob, or explain why it does not hold `dim` values.
fn decode_vector(bytes: &[u8], dim: usize) -> Result<Embedding, String> {
    let expected = dim
        .checked_mul(4)
        .ok_or_else(|| format!("dimension {dim} is out of range"))?;
    if bytes.len() != expected {
        return Err(format!("{} bytes, expected {expected}", bytes.len()));
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}

impl StoreBackend for SqliteBackend {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, dim, vector FROM embeddings ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        if rows.is_empty() {
            return Ok(None);
        }

        let mut embeddings = Vec::with_capacity(rows.len());
        let mut names = Vec::with_capacity(rows.len());
        for (name, dim, bytes) in rows {
            let dim = usize::try_from(dim)
                .map_err(|_| self.corrupt(format!("negative dimension for {name}")))?;
            let embedding = decode_vector(&bytes, dim)
                .map_err(|reason| self.corrupt(format!("vector for {name}: {reason}")))?;
            embeddings.push(embedding);
            names.push(name);
        }

        Snapshot::from_parts(embeddings, names)
            .map(Some)
            .map_err(|reason| self.corrupt(reason))
    }

    fn persist(&mut self, snapshot: &Snapshot, from: usize) -> Result<(), StoreError> {
        let created_at = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO embeddings (name, dim, vector, created_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (embedding, name) in snapshot.iter().skip(from) {
                stmt.execute(params![
                    name,
                    embedding.dim() as i64,
                    encode_vector(embedding),
                    created_at
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(
            path = %self.path.display(),
            written = snapshot.len().saturating_sub(from),
            "persisted embeddings"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

/// On-disk layout of [`JsonFileBackend`]: two parallel arrays.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    embeddings: Vec<Embedding>,
    names: Vec<String>,
}

/// Whole-snapshot JSON file, atomically replaced on every persist.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StoreBackend for JsonFileBackend {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let corrupt = |reason: String| StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason,
        };
        let file: SnapshotFile = serde_json::from_str(&data).map_err(|e| corrupt(e.to_string()))?;
        Snapshot::from_parts(file.embeddings, file.names)
            .map(Some)
            .map_err(corrupt)
    }

    fn persist(&mut self, snapshot: &Snapshot, _from: usize) -> Result<(), StoreError> {
        ensure_parent(&self.path)?;
        let file = SnapshotFile {
            embeddings: snapshot.embeddings().to_vec(),
            names: snapshot.names().to_vec(),
        };
        let json = serde_json::to_vec(&file)
            .map_err(|e| StoreError::WriteRejected(e.to_string()))?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

/// Volatile backend. Reloading a store from a clone of it behaves like
/// reopening a durable backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    stored: Option<Snapshot>,
    fail_writes: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            stored: Some(snapshot),
            fail_writes: false,
        }
    }

    /// Make every subsequent persist fail, to exercise recovery paths.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn persisted_len(&self) -> usize {
        self.stored.as_ref().map_or(0, Snapshot::len)
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.stored.clone())
    }

    fn persist(&mut self, snapshot: &Snapshot, from: usize) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::WriteRejected("memory backend set to fail".into()));
        }
        let stored = self.stored.get_or_insert_with(Snapshot::new);
        for (embedding, name) in snapshot.iter().skip(from) {
            stored.push(embedding.clone(), name.to_string());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

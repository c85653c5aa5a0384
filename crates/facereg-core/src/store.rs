//! Identity store: the durable, append-only mapping of identity names to
//! the embeddings observed for them.
//!
//! The store is the only mutable shared state in the engine. The in-memory
//! [`Snapshot`] is authoritative for matching; a [`StoreBackend`] makes it
//! durable. Appends are optimistic: the entry lands in memory first and the
//! backend is asked to persist every entry it has not yet acknowledged, so a
//! failed write is retried on the next append instead of being lost.

use crate::types::Embedding;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt snapshot at {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("embedding dimension mismatch: store holds {expected}-dim embeddings, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding holds a non-finite value (NaN or infinity)")]
    NonFinite,
    #[error("backend rejected write: {0}")]
    WriteRejected(String),
}

impl StoreError {
    /// True for errors raised before an append touched the snapshot.
    pub fn is_rejection(&self) -> bool {
        matches!(self, StoreError::DimensionMismatch { .. } | StoreError::NonFinite)
    }
}

/// Point-in-time view of every known embedding and its owning identity.
///
/// Index `i` of `embeddings()` and `names()` refer to the same observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    embeddings: Vec<Embedding>,
    names: Vec<String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from two parallel sequences, as read from a backend.
    pub fn from_parts(embeddings: Vec<Embedding>, names: Vec<String>) -> Result<Self, String> {
        if embeddings.len() != names.len() {
            return Err(format!(
                "{} embeddings but {} names",
                embeddings.len(),
                names.len()
            ));
        }
        if let Some(first) = embeddings.first() {
            let dim = first.dim();
            if let Some(bad) = embeddings.iter().find(|e| e.dim() != dim) {
                return Err(format!("mixed embedding dimensions {dim} and {}", bad.dim()));
            }
        }
        Ok(Self { embeddings, names })
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Dimension of the stored embeddings, or `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dim)
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Embedding, &str)> {
        self.embeddings
            .iter()
            .zip(self.names.iter().map(String::as_str))
    }

    /// Distinct identity names with their embedding counts, in first-seen order.
    pub fn identities(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for name in &self.names {
            match index.get(name.as_str()) {
                Some(&i) => out[i].1 += 1,
                None => {
                    index.insert(name, out.len());
                    out.push((name.clone(), 1));
                }
            }
        }
        out
    }

    pub(crate) fn push(&mut self, embedding: Embedding, name: String) {
        self.embeddings.push(embedding);
        self.names.push(name);
    }
}

/// Durable home of a [`Snapshot`].
pub trait StoreBackend: Send {
    /// Read the persisted snapshot. `Ok(None)` means nothing has been
    /// persisted yet; an unreadable snapshot is an error.
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError>;

    /// Make entries `from..snapshot.len()` durable. Entries before `from`
    /// are already persisted.
    fn persist(&mut self, snapshot: &Snapshot, from: usize) -> Result<(), StoreError>;

    /// Human-readable location, for logs and status output.
    fn describe(&self) -> String;
}

impl StoreBackend for Box<dyn StoreBackend> {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        (**self).load()
    }

    fn persist(&mut self, snapshot: &Snapshot, from: usize) -> Result<(), StoreError> {
        (**self).persist(snapshot, from)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Identity store over whichever backend the configuration selected.
pub type Store = IdentityStore<Box<dyn StoreBackend>>;

/// Append-only identity store over a durable backend.
pub struct IdentityStore<B: StoreBackend> {
    backend: B,
    snapshot: Snapshot,
    /// Number of leading entries the backend has acknowledged.
    persisted: usize,
}

impl<B: StoreBackend> IdentityStore<B> {
    /// Load the persisted snapshot. A missing snapshot is a normal cold start.
    pub fn load(mut backend: B) -> Result<Self, StoreError> {
        let snapshot = match backend.load()? {
            Some(snapshot) => {
                tracing::info!(
                    location = %backend.describe(),
                    embeddings = snapshot.len(),
                    identities = snapshot.identities().len(),
                    "loaded known faces"
                );
                snapshot
            }
            None => {
                tracing::info!(
                    location = %backend.describe(),
                    "no known faces data found; starting with an empty store"
                );
                Snapshot::new()
            }
        };
        let persisted = snapshot.len();
        Ok(Self {
            backend,
            snapshot,
            persisted,
        })
    }

    /// Current view of all embeddings and names, including every prior append.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Append one observation and persist it.
    ///
    /// Embeddings with the wrong dimension or non-finite values are refused
    /// before anything changes. On a backend failure the entry stays in memory
    /// and the error is returned; the unpersisted tail is retried by the next
    /// `append` or `flush`.
    pub fn append(&mut self, embedding: Embedding, name: impl Into<String>) -> Result<(), StoreError> {
        if !embedding.is_finite() {
            return Err(StoreError::NonFinite);
        }
        if let Some(expected) = self.snapshot.dim() {
            if embedding.dim() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
        }
        self.snapshot.push(embedding, name.into());
        self.flush()
    }

    /// Persist any entries held only in memory.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.persisted == self.snapshot.len() {
            return Ok(());
        }
        self.backend.persist(&self.snapshot, self.persisted)?;
        self.persisted = self.snapshot.len();
        Ok(())
    }

    /// Entries present in memory but not yet acknowledged by the backend.
    pub fn pending(&self) -> usize {
        self.snapshot.len() - self.persisted
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

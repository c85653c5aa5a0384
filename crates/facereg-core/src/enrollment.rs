//! Enrollment of unmatched faces as new identity observations.

use crate::store::{IdentityStore, StoreBackend, StoreError};
use crate::types::Embedding;

/// Result of an enrollment.
///
/// `Persisted` and `Deferred` both leave the embedding in the in-memory store;
/// `Deferred` means the backend write failed and the entry is pending a retry.
/// `Rejected` means the store refused the embedding and nothing was added.
#[derive(Debug)]
pub enum EnrollmentOutcome {
    Persisted,
    Deferred(StoreError),
    Rejected(StoreError),
}

impl EnrollmentOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, EnrollmentOutcome::Persisted)
    }
}

/// Enrollment policy: commit the embedding under the proposed label, as-is.
///
/// Labels are trusted. Two different people enrolled under the same label end
/// up sharing one identity name; no uniqueness check is made.
#[derive(Debug, Default, Clone, Copy)]
pub struct Enroller;

impl Enroller {
    /// Enroll `embedding` under `label`.
    ///
    /// Embeddings the store refuses (wrong dimension, non-finite values) come
    /// back as `Rejected`; the recognition session validates detections so
    /// this does not happen in normal operation.
    pub fn enroll<B: StoreBackend>(
        &self,
        store: &mut IdentityStore<B>,
        embedding: Embedding,
        label: &str,
    ) -> EnrollmentOutcome {
        match store.append(embedding, label) {
            Ok(()) => {
                tracing::info!(name = label, total = store.snapshot().len(), "new face enrolled");
                EnrollmentOutcome::Persisted
            }
            Err(e) if e.is_rejection() => {
                tracing::error!(name = label, error = %e, "enrollment refused by the identity store");
                EnrollmentOutcome::Rejected(e)
            }
            Err(e) => {
                tracing::warn!(
                    name = label,
                    pending = store.pending(),
                    error = %e,
                    "enrollment kept in memory; persisting failed"
                );
                EnrollmentOutcome::Deferred(e)
            }
        }
    }
}

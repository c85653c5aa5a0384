//! facereg-core: incremental face identity matching.
//!
//! Given face embeddings from an external detector, decides for every face
//! whether it re-observes a known identity or is new, and grows a persistent
//! identity store with every new face.

pub mod backend;
pub mod config;
pub mod enrollment;
pub mod matcher;
pub mod provider;
pub mod render;
pub mod report;
pub mod session;
pub mod store;
pub mod types;

pub use config::Config;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use session::{ImageOutcome, RecognitionSession, SkipReason};
pub use store::{IdentityStore, Snapshot, Store, StoreBackend, StoreError};
pub use types::{BoundingBox, Detection, Embedding, LabeledFace, RecognitionResult};

use facereg_core::render::RenderError;
use facereg_core::session::ImageOutcome;
use facereg_core::{Config, EuclideanMatcher, RecognitionSession, Store, StoreBackend, StoreError};
use std::path::PathBuf;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("output setup failed: {0}")]
    Render(#[from] RenderError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Store statistics reported by the engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusInfo {
    pub store: String,
    pub embeddings: usize,
    pub identities: usize,
    /// Entries held in memory that the backend has not acknowledged.
    pub pending: usize,
    pub tolerance: f32,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Recognize {
        path: PathBuf,
        image_ref: String,
        reply: oneshot::Sender<ImageOutcome>,
    },
    ListIdentities {
        reply: oneshot::Sender<Vec<(String, usize)>>,
    },
    Status {
        reply: oneshot::Sender<StatusInfo>,
    },
    /// Stop serving, flush, and reply with the entries still unpersisted.
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Every request is handled to completion, one at a time, by the thread that
/// owns the identity store, so concurrent callers never race on an append.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Recognize the faces in one image file.
    pub async fn recognize(&self, path: PathBuf, image_ref: String) -> Result<ImageOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Recognize {
            path,
            image_ref,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Known identities with their embedding counts.
    pub async fn list_identities(&self) -> Result<Vec<(String, usize)>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::ListIdentities { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<StatusInfo, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Status { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Ask the engine to stop. Resolves once the final flush has run, with
    /// the number of enrollments that could still not be persisted.
    pub async fn shutdown(&self) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Shutdown { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the identity store and prepares the output directories synchronously
/// so the daemon fails fast when the persisted snapshot is unreadable. The
/// returned `JoinHandle` must be joined after [`EngineHandle::shutdown`] so the
/// final flush completes before the process exits.
pub fn spawn_engine(config: &Config) -> Result<(EngineHandle, JoinHandle<()>), EngineError> {
    let mut store = config.open_store()?;
    let mut session = config.build_session()?;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    let thread = std::thread::Builder::new()
        .name("facereg-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut shutdown_reply = None;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize {
                        path,
                        image_ref,
                        reply,
                    } => {
                        let outcome = session.process(&mut store, &path, &image_ref);
                        let _ = reply.send(outcome);
                    }
                    EngineRequest::ListIdentities { reply } => {
                        let _ = reply.send(store.snapshot().identities());
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(status(&store, &session));
                    }
                    EngineRequest::Shutdown { reply } => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
            }
            if let Err(e) = store.flush() {
                tracing::error!(pending = store.pending(), error = %e, "unpersisted enrollments lost at shutdown");
            }
            if let Some(reply) = shutdown_reply {
                let _ = reply.send(store.pending());
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok((EngineHandle { tx }, thread))
}

fn status(store: &Store, session: &RecognitionSession<EuclideanMatcher>) -> StatusInfo {
    let snapshot = store.snapshot();
    StatusInfo {
        store: store.backend().describe(),
        embeddings: snapshot.len(),
        identities: snapshot.identities().len(),
        pending: store.pending(),
        tolerance: session.matcher().tolerance(),
    }
}

use std::sync::{Arc, RwLock};

use anyhow::Context as _;

use crate::store::Store;

/// The project/session pair traffic is currently being captured into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecording {
    pub project_id: String,
    pub session_id: String,
}

/// Process-wide recording toggle with a write-through to the
/// `active_recording` singleton row, so the state survives restarts.
///
/// Reads on the proxy hot path hit only the in-memory snapshot. Transitions
/// persist first and swap the snapshot second; a failed persist leaves the
/// snapshot untouched.
#[derive(Debug, Clone)]
pub struct RecordingState {
    store: Store,
    snapshot: Arc<RwLock<Option<ActiveRecording>>>,
    transition: Arc<tokio::sync::Mutex<()>>,
}

impl RecordingState {
    /// Creates the state and recovers any recording left active by a previous
    /// process.
    pub async fn load(store: Store) -> anyhow::Result<Self> {
        let recovered = store
            .get_active_recording()
            .await
            .context("recover active recording")?
            .map(|(project_id, session_id)| ActiveRecording {
                project_id,
                session_id,
            });

        Ok(Self {
            store,
            snapshot: Arc::new(RwLock::new(recovered)),
            transition: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn current(&self) -> Option<ActiveRecording> {
        self.snapshot
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Starts recording into the given session. An already-active recording is
    /// replaced wholesale; the caller validates project and session first.
    pub async fn start(&self, project_id: &str, session_id: &str) -> anyhow::Result<()> {
        let _transition = self.transition.lock().await;

        self.store
            .set_active_recording(project_id, session_id)
            .await
            .context("persist active recording")?;

        let mut snapshot = self.snapshot.write().unwrap_or_else(|err| err.into_inner());
        *snapshot = Some(ActiveRecording {
            project_id: project_id.to_owned(),
            session_id: session_id.to_owned(),
        });
        Ok(())
    }

    /// Stops any active recording. Stopping while inactive is a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let _transition = self.transition.lock().await;

        self.store
            .clear_active_recording()
            .await
            .context("clear persisted recording")?;

        let mut snapshot = self.snapshot.write().unwrap_or_else(|err| err.into_inner());
        *snapshot = None;
        Ok(())
    }
}

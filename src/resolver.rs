use tracing::warn;

use crate::{
    models::parse_project_config,
    recording::RecordingState,
    store::Store,
};

/// Request header naming an explicit project to forward through when no
/// recording is active and no default upstream is configured.
pub const PROJECT_ID_HEADER: &str = "x-echowire-project-id";

/// Where a proxied request should go and whether the exchange is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUpstream {
    pub base_url: String,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub should_record: bool,
}

#[derive(Debug)]
pub enum ResolveError {
    /// No active recording, no default upstream, no project header.
    NoUpstreamConfigured,
    /// The header named a project that does not exist.
    ProjectNotFound(String),
    /// The named project exists but its stored config does not resolve to a
    /// usable target.
    InvalidProjectConfig { project_id: String, source: anyhow::Error },
    /// The active recording pointed at a missing or unusable project and has
    /// been stopped.
    CorruptedRecording { project_id: String, detail: String },
    Storage(anyhow::Error),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoUpstreamConfigured => write!(f, "no upstream configured"),
            Self::ProjectNotFound(id) => write!(f, "project `{id}` not found"),
            Self::InvalidProjectConfig { project_id, source } => {
                write!(f, "project `{project_id}` has invalid config: {source}")
            }
            Self::CorruptedRecording { project_id, detail } => write!(
                f,
                "active recording pointed at unusable project `{project_id}` ({detail}); recording stopped"
            ),
            Self::Storage(err) => write!(f, "resolve upstream: {err}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Decides the upstream target for one proxied request, in priority order:
/// the active recording's project, then the configured default upstream, then
/// an explicit project named by [`PROJECT_ID_HEADER`].
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    store: Store,
    recording: RecordingState,
    default_upstream: Option<String>,
}

impl UpstreamResolver {
    pub fn new(store: Store, recording: RecordingState, default_upstream: Option<String>) -> Self {
        Self {
            store,
            recording,
            default_upstream,
        }
    }

    pub async fn resolve(
        &self,
        header_project_id: Option<&str>,
    ) -> Result<ResolvedUpstream, ResolveError> {
        if let Some(active) = self.recording.current() {
            return match self.project_base_url(&active.project_id).await {
                Ok(base_url) => Ok(ResolvedUpstream {
                    base_url,
                    project_id: Some(active.project_id),
                    session_id: Some(active.session_id),
                    should_record: true,
                }),
                Err(err) => {
                    // A broken pointer would fail every subsequent request, so
                    // stop the recording rather than leave it wedged.
                    let detail = err.to_string();
                    warn!(
                        project_id = %active.project_id,
                        session_id = %active.session_id,
                        error = %detail,
                        "stopping recording with unusable project config"
                    );
                    if let Err(stop_err) = self.recording.stop().await {
                        warn!(error = %stop_err, "failed to stop corrupted recording");
                    }
                    Err(ResolveError::CorruptedRecording {
                        project_id: active.project_id,
                        detail,
                    })
                }
            };
        }

        if let Some(default_upstream) = &self.default_upstream {
            return Ok(ResolvedUpstream {
                base_url: default_upstream.trim_end_matches('/').to_owned(),
                project_id: None,
                session_id: None,
                should_record: false,
            });
        }

        if let Some(project_id) = header_project_id.map(str::trim).filter(|id| !id.is_empty()) {
            let base_url = self.project_base_url(project_id).await?;
            return Ok(ResolvedUpstream {
                base_url,
                project_id: Some(project_id.to_owned()),
                session_id: None,
                should_record: false,
            });
        }

        Err(ResolveError::NoUpstreamConfigured)
    }

    async fn project_base_url(&self, project_id: &str) -> Result<String, ResolveError> {
        let project = self
            .store
            .get_project(project_id)
            .await
            .map_err(ResolveError::Storage)?
            .ok_or_else(|| ResolveError::ProjectNotFound(project_id.to_owned()))?;

        let config = parse_project_config(&project.config_json).map_err(|source| {
            ResolveError::InvalidProjectConfig {
                project_id: project_id.to_owned(),
                source,
            }
        })?;
        Ok(config.upstream_base_url())
    }
}

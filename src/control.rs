use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use http_body_util::BodyExt as _;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    models::{
        Project, Session, generate_project_id, generate_session_id, normalize_project_config,
        now_rfc3339,
    },
    present::present_event,
    proxy::{ProxyBody, error_response, json_response},
    recording::RecordingState,
    store::{InsertProjectError, Store},
};

#[derive(Debug)]
pub struct ControlHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ControlHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ControlState {
    store: Store,
    recording: RecordingState,
}

pub async fn serve(
    listen: &str,
    store: Store,
    recording: RecordingState,
) -> anyhow::Result<ControlHandle> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind control {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get control local_addr: {err}"))?;

    let state = Arc::new(ControlState { store, recording });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| control_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("control connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ControlHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn control_handler(
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let path = req.uri().path().to_owned();
    let raw_requested = query_flag(req.uri().query(), "raw");
    let method = req.method().clone();
    let segments: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::POST, ["api", "v1", "projects"]) => create_project(req, &state).await,
        (&Method::GET, ["api", "v1", "projects"]) => list_projects(&state).await,
        (&Method::GET, ["api", "v1", "projects", project_id]) => {
            get_project(&state, project_id).await
        }
        (&Method::PUT, ["api", "v1", "projects", project_id]) => {
            let project_id = (*project_id).to_owned();
            update_project(req, &state, &project_id).await
        }
        (&Method::DELETE, ["api", "v1", "projects", project_id]) => {
            delete_project(&state, project_id).await
        }
        (&Method::POST, ["api", "v1", "projects", project_id, "sessions"]) => {
            let project_id = (*project_id).to_owned();
            create_session(req, &state, &project_id).await
        }
        (&Method::GET, ["api", "v1", "projects", project_id, "sessions"]) => {
            list_sessions(&state, project_id).await
        }
        (&Method::GET, ["api", "v1", "projects", project_id, "sessions", session_id]) => {
            get_session(&state, project_id, session_id).await
        }
        (&Method::DELETE, ["api", "v1", "projects", project_id, "sessions", session_id]) => {
            delete_session(&state, project_id, session_id).await
        }
        (
            &Method::POST,
            ["api", "v1", "projects", project_id, "sessions", session_id, "record", "start"],
        ) => record_start(&state, project_id, session_id).await,
        (
            &Method::GET,
            ["api", "v1", "projects", project_id, "sessions", session_id, "record", "status"],
        ) => record_status(&state, project_id, session_id).await,
        (
            &Method::POST,
            ["api", "v1", "projects", project_id, "sessions", session_id, "record", "stop"],
        ) => record_stop(&state, project_id, session_id).await,
        (&Method::GET, ["api", "v1", "projects", project_id, "sessions", session_id, "events"]) => {
            list_events(&state, project_id, session_id, raw_requested).await
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn query_flag(query: Option<&str>, key: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    query.split('&').any(|pair| {
        let mut parts = pair.splitn(2, '=');
        parts.next() == Some(key) && matches!(parts.next(), Some("1") | Some("true") | None)
    })
}

#[derive(Debug, Deserialize)]
struct ProjectRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct ProjectResponse {
    id: String,
    name: String,
    config: serde_json::Value,
    created_at: String,
}

impl ProjectResponse {
    fn from_project(project: &Project) -> Self {
        Self {
            id: project.id.clone(),
            name: project.name.clone(),
            config: serde_json::from_str(&project.config_json)
                .unwrap_or(serde_json::Value::Null),
            created_at: project.created_at.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordingStatusResponse {
    recording: bool,
    project_id: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct RecordingStoppedResponse {
    recording: bool,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct RecordingConflictResponse {
    error: &'static str,
    active_project_id: String,
    active_session_id: String,
}

async fn read_json_body<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<ProxyBody>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("read request body: {err}"),
            ));
        }
    };
    serde_json::from_slice(&bytes).map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}"))
    })
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response<ProxyBody> {
    tracing::error!("{context}: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

async fn create_project(req: Request<Incoming>, state: &ControlState) -> Response<ProxyBody> {
    let body: ProjectRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let name = body.name.trim().to_owned();
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name is required");
    }
    let config_json = match normalize_config_value(&body.config) {
        Ok(config_json) => config_json,
        Err(response) => return response,
    };

    let project = Project {
        id: generate_project_id(),
        name,
        config_json,
        created_at: now_rfc3339(),
    };

    match state.store.insert_project(project.clone()).await {
        Ok(()) => json_response(StatusCode::CREATED, &ProjectResponse::from_project(&project)),
        Err(InsertProjectError::DuplicateName(name)) => error_response(
            StatusCode::CONFLICT,
            format!("project name `{name}` already exists"),
        ),
        Err(InsertProjectError::Other(err)) => internal_error("create project", err),
    }
}

fn normalize_config_value(config: &serde_json::Value) -> Result<String, Response<ProxyBody>> {
    if config.is_null() {
        return Err(error_response(StatusCode::BAD_REQUEST, "config is required"));
    }
    let raw = match serde_json::to_string(config) {
        Ok(raw) => raw,
        Err(err) => return Err(internal_error("serialize project config", err)),
    };
    normalize_project_config(&raw)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))
}

async fn list_projects(state: &ControlState) -> Response<ProxyBody> {
    match state.store.list_projects().await {
        Ok(projects) => {
            let payload: Vec<ProjectResponse> =
                projects.iter().map(ProjectResponse::from_project).collect();
            json_response(StatusCode::OK, &payload)
        }
        Err(err) => internal_error("list projects", err),
    }
}

async fn get_project(state: &ControlState, project_id: &str) -> Response<ProxyBody> {
    match state.store.get_project(project_id).await {
        Ok(Some(project)) => json_response(StatusCode::OK, &ProjectResponse::from_project(&project)),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "project not found"),
        Err(err) => internal_error("get project", err),
    }
}

async fn update_project(
    req: Request<Incoming>,
    state: &ControlState,
    project_id: &str,
) -> Response<ProxyBody> {
    let body: ProjectRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let mut project = match state.store.get_project(project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "project not found"),
        Err(err) => return internal_error("get project", err),
    };

    let name = body.name.trim();
    if !name.is_empty() {
        project.name = name.to_owned();
    }
    if !body.config.is_null() {
        project.config_json = match normalize_config_value(&body.config) {
            Ok(config_json) => config_json,
            Err(response) => return response,
        };
    }

    match state.store.update_project(project.clone()).await {
        Ok(()) => json_response(StatusCode::OK, &ProjectResponse::from_project(&project)),
        Err(err) => internal_error("update project", err),
    }
}

async fn delete_project(state: &ControlState, project_id: &str) -> Response<ProxyBody> {
    // Deleting the project a recording targets implicitly stops it.
    if let Some(active) = state.recording.current() {
        if active.project_id == project_id {
            if let Err(err) = state.recording.stop().await {
                return internal_error("stop recording before project delete", err);
            }
        }
    }

    match state.store.delete_project(project_id).await {
        Ok(true) => no_content(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "project not found"),
        Err(err) => internal_error("delete project", err),
    }
}

async fn create_session(
    req: Request<Incoming>,
    state: &ControlState,
    project_id: &str,
) -> Response<ProxyBody> {
    let body: CreateSessionRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let name = body.name.trim().to_owned();
    if name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "name is required");
    }

    match state.store.get_project(project_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "project not found"),
        Err(err) => return internal_error("get project", err),
    }

    let session = Session {
        id: generate_session_id(),
        project_id: project_id.to_owned(),
        name,
        created_at: now_rfc3339(),
        sealed: false,
    };

    match state.store.insert_session(session.clone()).await {
        Ok(()) => json_response(StatusCode::CREATED, &session),
        Err(err) => internal_error("create session", err),
    }
}

async fn list_sessions(state: &ControlState, project_id: &str) -> Response<ProxyBody> {
    match state.store.get_project(project_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "project not found"),
        Err(err) => return internal_error("get project", err),
    }

    match state.store.list_sessions_by_project(project_id).await {
        Ok(sessions) => json_response(StatusCode::OK, &sessions),
        Err(err) => internal_error("list sessions", err),
    }
}

/// Loads a session and checks it belongs to the project in the path.
async fn session_in_project(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
) -> Result<Session, Response<ProxyBody>> {
    match state.store.get_session(session_id).await {
        Ok(Some(session)) if session.project_id == project_id => Ok(session),
        Ok(_) => Err(error_response(StatusCode::NOT_FOUND, "session not found")),
        Err(err) => Err(internal_error("get session", err)),
    }
}

async fn get_session(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
) -> Response<ProxyBody> {
    match session_in_project(state, project_id, session_id).await {
        Ok(session) => json_response(StatusCode::OK, &session),
        Err(response) => response,
    }
}

async fn delete_session(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
) -> Response<ProxyBody> {
    if let Err(response) = session_in_project(state, project_id, session_id).await {
        return response;
    }

    // Deleting the session that owns the recording implicitly stops it.
    if let Some(active) = state.recording.current() {
        if active.session_id == session_id {
            if let Err(err) = state.recording.stop().await {
                return internal_error("stop recording before session delete", err);
            }
        }
    }

    match state.store.delete_session(session_id).await {
        Ok(true) => no_content(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "session not found"),
        Err(err) => internal_error("delete session", err),
    }
}

async fn record_start(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
) -> Response<ProxyBody> {
    match state.store.get_project(project_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "project not found"),
        Err(err) => return internal_error("get project", err),
    }
    let session = match session_in_project(state, project_id, session_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    if session.sealed {
        return error_response(StatusCode::BAD_REQUEST, "session is sealed");
    }

    match state.recording.start(project_id, session_id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            &RecordingStatusResponse {
                recording: true,
                project_id: project_id.to_owned(),
                session_id: session_id.to_owned(),
            },
        ),
        Err(err) => internal_error("start recording", err),
    }
}

async fn record_status(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
) -> Response<ProxyBody> {
    if let Err(response) = session_in_project(state, project_id, session_id).await {
        return response;
    }

    let recording = state
        .recording
        .current()
        .is_some_and(|active| active.session_id == session_id);
    json_response(
        StatusCode::OK,
        &RecordingStatusResponse {
            recording,
            project_id: project_id.to_owned(),
            session_id: session_id.to_owned(),
        },
    )
}

async fn record_stop(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
) -> Response<ProxyBody> {
    if let Err(response) = session_in_project(state, project_id, session_id).await {
        return response;
    }

    let Some(active) = state.recording.current() else {
        return json_response(
            StatusCode::OK,
            &RecordingStoppedResponse {
                recording: false,
                message: "recording already stopped",
            },
        );
    };

    if active.session_id != session_id {
        return json_response(
            StatusCode::CONFLICT,
            &RecordingConflictResponse {
                error: "another session owns the active recording",
                active_project_id: active.project_id,
                active_session_id: active.session_id,
            },
        );
    }

    match state.recording.stop().await {
        Ok(()) => json_response(
            StatusCode::OK,
            &RecordingStatusResponse {
                recording: false,
                project_id: project_id.to_owned(),
                session_id: session_id.to_owned(),
            },
        ),
        Err(err) => internal_error("stop recording", err),
    }
}

async fn list_events(
    state: &ControlState,
    project_id: &str,
    session_id: &str,
    raw: bool,
) -> Response<ProxyBody> {
    if let Err(response) = session_in_project(state, project_id, session_id).await {
        return response;
    }

    let events = match state.store.list_events_by_session(session_id).await {
        Ok(events) => events,
        Err(err) => return internal_error("list events", err),
    };

    if raw {
        return json_response(StatusCode::OK, &events);
    }

    let presented: Vec<_> = events.iter().map(present_event).collect();
    json_response(StatusCode::OK, &presented)
}

fn no_content() -> Response<ProxyBody> {
    let mut response = Response::new(
        http_body_util::Full::new(bytes::Bytes::new())
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

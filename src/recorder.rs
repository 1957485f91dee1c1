use tracing::warn;

use crate::{
    headers::HeaderMultimap,
    models::{Event, generate_event_id},
    store::Store,
};

/// Stored bodies are capped at this many bytes; the full body still streams
/// through to the caller.
pub const BODY_CAPTURE_LIMIT: usize = 64 * 1024;

/// One finished exchange handed off by the proxy for persistence.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub session_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub method: String,
    pub url: String,
    pub status: i64,
    pub req_headers: HeaderMultimap,
    pub resp_headers: HeaderMultimap,
    pub req_body: Vec<u8>,
    pub resp_body: Vec<u8>,
    pub redaction_applied: String,
}

/// Persists captured exchanges as session events. Runs after the response has
/// already been returned to the caller, so failures are logged and swallowed
/// rather than surfaced.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    store: Store,
}

impl EventRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record(&self, exchange: CapturedExchange) {
        let session_id = exchange.session_id.clone();
        match self.persist(exchange).await {
            Ok(seq) => {
                tracing::debug!(session_id = %session_id, seq, "captured event");
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to persist captured event");
            }
        }
    }

    async fn persist(&self, mut exchange: CapturedExchange) -> anyhow::Result<i64> {
        exchange.req_body.truncate(BODY_CAPTURE_LIMIT);
        exchange.resp_body.truncate(BODY_CAPTURE_LIMIT);

        let event = Event {
            id: generate_event_id(),
            session_id: exchange.session_id,
            seq: 0,
            started_at: exchange.started_at,
            ended_at: exchange.ended_at,
            method: exchange.method,
            url: exchange.url,
            status: exchange.status,
            req_headers: exchange.req_headers.to_json()?,
            resp_headers: exchange.resp_headers.to_json()?,
            req_body: exchange.req_body,
            resp_body: exchange.resp_body,
            redaction_applied: exchange.redaction_applied,
        };
        self.store.insert_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::{BODY_CAPTURE_LIMIT, CapturedExchange, EventRecorder};
    use crate::{
        headers::HeaderMultimap,
        models::{Project, Session, generate_project_id, generate_session_id, now_rfc3339},
        store::Store,
    };

    async fn setup() -> (tempfile::TempDir, Store, EventRecorder, String) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Store::open(temp_dir.path().join("db.sqlite")).unwrap();

        let project = Project {
            id: generate_project_id(),
            name: "demo".to_owned(),
            config_json: r#"{"targetName":"","targetScheme":"http","targetHost":"h","targetPort":80}"#.to_owned(),
            created_at: now_rfc3339(),
        };
        store.insert_project(project.clone()).await.unwrap();
        let session = Session {
            id: generate_session_id(),
            project_id: project.id,
            name: "run".to_owned(),
            created_at: now_rfc3339(),
            sealed: false,
        };
        let session_id = session.id.clone();
        store.insert_session(session).await.unwrap();

        let recorder = EventRecorder::new(store.clone());
        (temp_dir, store, recorder, session_id)
    }

    fn exchange(session_id: &str) -> CapturedExchange {
        let mut req_headers = HeaderMultimap::new();
        req_headers.append("Content-Type", "application/json");
        CapturedExchange {
            session_id: session_id.to_owned(),
            started_at: now_rfc3339(),
            ended_at: now_rfc3339(),
            method: "POST".to_owned(),
            url: "/widgets?debug=1".to_owned(),
            status: 201,
            req_headers,
            resp_headers: HeaderMultimap::new(),
            req_body: br#"{"name":"w"}"#.to_vec(),
            resp_body: b"created".to_vec(),
            redaction_applied: String::new(),
        }
    }

    #[tokio::test]
    async fn records_exchange_with_headers_and_sequence() {
        let (_guard, store, recorder, session_id) = setup().await;

        recorder.record(exchange(&session_id)).await;
        recorder.record(exchange(&session_id)).await;

        let events = store.list_events_by_session(&session_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
        assert_eq!(events[0].method, "POST");
        assert_eq!(events[0].url, "/widgets?debug=1");
        assert_eq!(events[0].status, 201);

        let headers = HeaderMultimap::from_json(&events[0].req_headers).unwrap();
        assert_eq!(headers.first("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn oversized_bodies_are_capped_in_storage() {
        let (_guard, store, recorder, session_id) = setup().await;

        let mut oversized = exchange(&session_id);
        oversized.resp_body = vec![0xab; BODY_CAPTURE_LIMIT + 4096];
        recorder.record(oversized).await;

        let events = store.list_events_by_session(&session_id).await.unwrap();
        assert_eq!(events[0].resp_body.len(), BODY_CAPTURE_LIMIT);
    }

    #[tokio::test]
    async fn persistence_failure_is_swallowed() {
        let (_guard, store, recorder, _session_id) = setup().await;

        // No such session: the FK constraint rejects the insert, but record()
        // must not panic or surface the error.
        recorder.record(exchange("sess_missing")).await;
        assert!(
            store
                .list_events_by_session("sess_missing")
                .await
                .unwrap()
                .is_empty()
        );
    }
}

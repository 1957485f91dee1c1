use std::{
    collections::VecDeque,
    convert::Infallible,
    error::Error as StdError,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::{Frame, Incoming},
    header::{self, HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    headers::HeaderMultimap,
    models::now_rfc3339,
    recorder::{BODY_CAPTURE_LIMIT, CapturedExchange, EventRecorder},
    resolver::{PROJECT_ID_HEADER, ResolveError, UpstreamResolver},
};

pub(crate) type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type ProxyHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<ProxyHttpsConnector, ProxyBody>;

/// Hard ceiling on one upstream exchange, response body included; the inbound
/// connection closing cancels it earlier.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ProxyState {
    client: HttpClient,
    resolver: UpstreamResolver,
    recorder: EventRecorder,
    listen_addr: SocketAddr,
    upstream_timeout: Duration,
}

pub async fn serve(
    listen: &str,
    resolver: UpstreamResolver,
    recorder: EventRecorder,
) -> anyhow::Result<ProxyHandle> {
    serve_with_timeout(listen, resolver, recorder, UPSTREAM_TIMEOUT).await
}

pub async fn serve_with_timeout(
    listen: &str,
    resolver: UpstreamResolver,
    recorder: EventRecorder,
    upstream_timeout: Duration,
) -> anyhow::Result<ProxyHandle> {
    ensure_rustls_crypto_provider()?;

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let state = Arc::new(ProxyState {
        client: build_http_client()?,
        resolver,
        recorder,
        listen_addr,
        upstream_timeout,
    });

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
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("proxy connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_http_client() -> anyhow::Result<HttpClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    let path = req.uri().path().to_owned();
    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/healthz") => json_response(
            StatusCode::OK,
            &HealthResponse {
                ok: true,
                addr: state.listen_addr.to_string(),
            },
        ),
        (&Method::GET, "/upstream-check") => upstream_check(&req, &state).await,
        _ => forward(req, &state).await,
    };
    Ok(response)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    addr: String,
}

#[derive(Debug, Serialize)]
struct UpstreamCheckResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    target_url: String,
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Resolves the upstream exactly like a forwarded request would, then probes
/// it with a short GET to report reachability.
async fn upstream_check(req: &Request<Incoming>, state: &ProxyState) -> Response<ProxyBody> {
    let resolved = match state.resolver.resolve(header_project_id(req)).await {
        Ok(resolved) => resolved,
        Err(err) => return resolve_error_response(&err),
    };

    let target_url = format!("{}/", resolved.base_url);
    let probe = Request::builder()
        .method(Method::GET)
        .uri(&target_url)
        .body(empty_body());
    let probe = match probe {
        Ok(probe) => probe,
        Err(err) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                format!("build upstream probe for {target_url}: {err}"),
            );
        }
    };

    match tokio::time::timeout(UPSTREAM_CHECK_TIMEOUT, state.client.request(probe)).await {
        Ok(Ok(response)) => json_response(
            StatusCode::OK,
            &UpstreamCheckResponse {
                ok: true,
                project_id: resolved.project_id,
                target_url,
                status_code: response.status().as_u16(),
                error: None,
            },
        ),
        Ok(Err(err)) => json_response(
            StatusCode::BAD_GATEWAY,
            &UpstreamCheckResponse {
                ok: false,
                project_id: resolved.project_id,
                target_url,
                status_code: 0,
                error: Some(err.to_string()),
            },
        ),
        Err(_) => json_response(
            StatusCode::BAD_GATEWAY,
            &UpstreamCheckResponse {
                ok: false,
                project_id: resolved.project_id,
                target_url,
                status_code: 0,
                error: Some(format!(
                    "upstream probe timed out after {}s",
                    UPSTREAM_CHECK_TIMEOUT.as_secs()
                )),
            },
        ),
    }
}

async fn forward(req: Request<Incoming>, state: &ProxyState) -> Response<ProxyBody> {
    let started_at = now_rfc3339();

    let resolved = match state.resolver.resolve(header_project_id(&req)).await {
        Ok(resolved) => resolved,
        Err(err) => return resolve_error_response(&err),
    };

    let method = req.method().clone();
    let observed_url = req
        .uri()
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    // Headers are captured as received, before hop-by-hop hygiene.
    let captured_req_headers = HeaderMultimap::from_header_map(req.headers());

    let target_url = build_target_url(&resolved.base_url, &observed_url);
    let target_uri: Uri = match target_url.parse() {
        Ok(uri) => uri,
        Err(err) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                format!("construct upstream url {target_url}: {err}"),
            );
        }
    };

    // One absolute budget for the whole upstream exchange. Connecting,
    // sending, and draining the response body all count against it, so an
    // upstream that returns headers and then stalls mid-body still fails.
    let deadline = tokio::time::Instant::now() + state.upstream_timeout;

    let (parts, body) = req.into_parts();
    let (captured_req_body, outbound_body) =
        match read_body_with_limit(body, BODY_CAPTURE_LIMIT).await {
            Ok(BodyReadOutcome::Buffered(bytes)) => {
                (bytes.to_vec(), full_body(bytes))
            }
            Ok(BodyReadOutcome::TooLarge {
                prefetched,
                remaining,
                ..
            }) => {
                let mut captured = flatten_chunks(&prefetched);
                captured.truncate(BODY_CAPTURE_LIMIT);
                (
                    captured,
                    PrefixedIncomingBody::new(prefetched, remaining, deadline).boxed(),
                )
            }
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("read request body: {err}"),
                );
            }
        };

    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(target_uri.clone());
    if let Some(outbound_headers) = outbound.headers_mut() {
        *outbound_headers = parts.headers.clone();
        strip_hop_by_hop_headers(outbound_headers);
        set_host_header(outbound_headers, &target_uri);
    }
    let outbound = match outbound.body(outbound_body) {
        Ok(outbound) => outbound,
        Err(err) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                format!("build upstream request: {err}"),
            );
        }
    };

    let upstream_result = tokio::time::timeout_at(deadline, state.client.request(outbound)).await;
    let upstream_response = match upstream_result {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            return upstream_failure(
                state,
                &resolved,
                started_at,
                method,
                observed_url,
                captured_req_headers,
                captured_req_body,
                format!("upstream_error: {err}"),
            )
            .await;
        }
        Err(_) => {
            return upstream_failure(
                state,
                &resolved,
                started_at,
                method,
                observed_url,
                captured_req_headers,
                captured_req_body,
                format!(
                    "upstream_error: timed out after {}s",
                    state.upstream_timeout.as_secs()
                ),
            )
            .await;
        }
    };

    let status = upstream_response.status();
    let captured_resp_headers = HeaderMultimap::from_header_map(upstream_response.headers());
    let (mut resp_parts, resp_body) = upstream_response.into_parts();
    strip_hop_by_hop_headers(&mut resp_parts.headers);

    let read_result =
        tokio::time::timeout_at(deadline, read_body_with_limit(resp_body, BODY_CAPTURE_LIMIT))
            .await;
    let (captured_resp_body, downstream_body) = match read_result {
        Ok(Ok(BodyReadOutcome::Buffered(bytes))) => (bytes.to_vec(), full_body(bytes)),
        Ok(Ok(BodyReadOutcome::TooLarge {
            prefetched,
            remaining,
            ..
        })) => {
            let mut captured = flatten_chunks(&prefetched);
            captured.truncate(BODY_CAPTURE_LIMIT);
            (
                captured,
                PrefixedIncomingBody::new(prefetched, remaining, deadline).boxed(),
            )
        }
        Ok(Err(err)) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                format!("read upstream response body: {err}"),
            );
        }
        Err(_) => {
            return upstream_failure(
                state,
                &resolved,
                started_at,
                method,
                observed_url,
                captured_req_headers,
                captured_req_body,
                format!(
                    "upstream_error: timed out after {}s",
                    state.upstream_timeout.as_secs()
                ),
            )
            .await;
        }
    };

    if resolved.should_record {
        if let Some(session_id) = resolved.session_id.clone() {
            state
                .recorder
                .record(CapturedExchange {
                    session_id,
                    started_at,
                    ended_at: now_rfc3339(),
                    method: method.to_string(),
                    url: observed_url,
                    status: i64::from(status.as_u16()),
                    req_headers: captured_req_headers,
                    resp_headers: captured_resp_headers,
                    req_body: captured_req_body,
                    resp_body: captured_resp_body,
                    redaction_applied: String::new(),
                })
                .await;
        }
    }

    Response::from_parts(resp_parts, downstream_body)
}

/// 502 to the caller; the failed attempt is still captured when a recording
/// is active, annotated with the upstream error.
#[allow(clippy::too_many_arguments)]
async fn upstream_failure(
    state: &ProxyState,
    resolved: &crate::resolver::ResolvedUpstream,
    started_at: String,
    method: Method,
    observed_url: String,
    captured_req_headers: HeaderMultimap,
    captured_req_body: Vec<u8>,
    redaction_applied: String,
) -> Response<ProxyBody> {
    tracing::warn!(
        method = %method,
        url = %observed_url,
        upstream = %resolved.base_url,
        detail = %redaction_applied,
        "upstream request failed"
    );

    if resolved.should_record {
        if let Some(session_id) = resolved.session_id.clone() {
            state
                .recorder
                .record(CapturedExchange {
                    session_id,
                    started_at,
                    ended_at: now_rfc3339(),
                    method: method.to_string(),
                    url: observed_url,
                    status: i64::from(StatusCode::BAD_GATEWAY.as_u16()),
                    req_headers: captured_req_headers,
                    resp_headers: HeaderMultimap::new(),
                    req_body: captured_req_body,
                    resp_body: Vec::new(),
                    redaction_applied,
                })
                .await;
        }
    }

    error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
}

fn header_project_id(req: &Request<Incoming>) -> Option<&str> {
    req.headers()
        .get(PROJECT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Base path with its trailing slash trimmed, concatenated with the incoming
/// path+query (defaulted to "/").
fn build_target_url(base_url: &str, path_and_query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = if path_and_query.is_empty() {
        "/"
    } else {
        path_and_query
    };
    format!("{base}{path}")
}

fn resolve_error_response(err: &ResolveError) -> Response<ProxyBody> {
    let status = match err {
        ResolveError::NoUpstreamConfigured
        | ResolveError::ProjectNotFound(_)
        | ResolveError::InvalidProjectConfig { .. } => StatusCode::BAD_REQUEST,
        ResolveError::CorruptedRecording { .. } | ResolveError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("upstream resolution failed: {err}");
        return error_response(status, "upstream resolution failed");
    }
    error_response(status, err.to_string())
}

fn set_host_header(headers: &mut hyper::HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    headers.remove(header::HOST);
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

/// Removes the fixed hop-by-hop set plus any header named by a `Connection`
/// token; applied to the outbound request and to the returned response.
fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}

#[derive(Debug)]
enum BodyReadOutcome {
    Buffered(Bytes),
    TooLarge {
        prefetched: Vec<Bytes>,
        remaining: Incoming,
    },
}

/// Buffers up to `max_body_bytes`; past the limit the buffered prefix and the
/// unread remainder are handed back so the full body can still stream through.
async fn read_body_with_limit(
    mut body: Incoming,
    max_body_bytes: usize,
) -> Result<BodyReadOutcome, hyper::Error> {
    let mut buffered = Vec::new();
    let mut buffered_len = 0usize;
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffered_len = buffered_len.saturating_add(data.len());
        buffered.push(data);
        if buffered_len > max_body_bytes {
            return Ok(BodyReadOutcome::TooLarge {
                prefetched: buffered,
                remaining: body,
            });
        }
    }

    let mut flattened = Vec::with_capacity(buffered_len);
    for chunk in &buffered {
        flattened.extend_from_slice(chunk);
    }
    Ok(BodyReadOutcome::Buffered(Bytes::from(flattened)))
}

fn flatten_chunks(chunks: &[Bytes]) -> Vec<u8> {
    let total: usize = chunks.iter().map(Bytes::len).sum();
    let mut flattened = Vec::with_capacity(total);
    for chunk in chunks {
        flattened.extend_from_slice(chunk);
    }
    flattened
}

/// Replays already-buffered chunks before draining the rest of the wire body.
/// The remainder shares the exchange deadline, so a stalled peer errors the
/// stream instead of holding it open.
struct PrefixedIncomingBody {
    prefetched: VecDeque<Bytes>,
    remaining: Incoming,
    timeout: Pin<Box<tokio::time::Sleep>>,
}

impl PrefixedIncomingBody {
    fn new(prefetched: Vec<Bytes>, remaining: Incoming, deadline: tokio::time::Instant) -> Self {
        Self {
            prefetched: prefetched.into(),
            remaining,
            timeout: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }
}

impl hyper::body::Body for PrefixedIncomingBody {
    type Data = Bytes;
    type Error = Box<dyn StdError + Send + Sync>;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(chunk) = this.prefetched.pop_front() {
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }
        if this.timeout.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err("body read timed out".into())));
        }
        match Pin::new(&mut this.remaining).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(Box::new(err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(full_body(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize JSON response: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize response",
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let payload = ErrorResponse {
        error: message.into(),
    };
    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{\"error\":\"internal\"}".to_vec());
    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{OriginalUri, Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use futures::{StreamExt, stream};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::{
    config::Config,
    error::{NestError, Result},
    patch::{PatchOperation, PatchReport, patch_document},
    schema::{AcceptAll, BodyValidator, SchemaValidator},
    store::{self, CollectionIndex, Document, DocumentIndex, Metadata, Root, WriteMode},
    subscribe::{EventKind, SubscriptionHub},
    token::AuthManager,
};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct AppState {
    root: Arc<Root>,
    hub: Arc<SubscriptionHub>,
    validator: Arc<dyn BodyValidator>,
    auth: Arc<AuthManager>,
}

/// Resolved identity of the caller, attached by the auth middleware.
#[derive(Clone)]
struct Principal {
    username: String,
    token: String,
}

pub async fn run(config: Config) -> Result<()> {
    let validator: Arc<dyn BodyValidator> = match &config.schema_file {
        Some(path) => Arc::new(SchemaValidator::from_file(path)?),
        None => Arc::new(AcceptAll),
    };
    let auth = Arc::new(AuthManager::new(config.token_ttl_secs));
    if let Some(path) = &config.token_file {
        auth.load_bootstrap(path)?;
    }

    // Both top-level maps exist before the first handler runs and live for
    // the whole process.
    let state = AppState {
        root: Arc::new(Root::new()),
        hub: Arc::new(SubscriptionHub::new()),
        validator,
        auth,
    };

    let v1 = Router::new()
        .route(
            "/v1/{*path}",
            get(get_resource)
                .put(put_resource)
                .post(post_resource)
                .patch(patch_resource)
                .delete(delete_resource)
                .options(preflight),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/auth", post(login).delete(logout).options(preflight))
        .merge(v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting NestDBX server on {addr}");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    // CORS preflight bypasses token validation.
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    let token = extract_bearer_token(request.headers()).ok_or(NestError::Unauthorized)?;
    let username = state.auth.authenticate(&token)?;
    request.extensions_mut().insert(Principal { username, token });
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?;
    let value = value.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
}

async fn login(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request: LoginRequest = serde_json::from_slice(&body)
        .map_err(|_| NestError::BadRequest("invalid request body".into()))?;
    let token = state.auth.login(&request.username)?;
    Ok(Json(json!({ "token": token })).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let token = extract_bearer_token(&headers).ok_or(NestError::Unauthorized)?;
    state.auth.logout(&token)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

#[derive(Deserialize, Default)]
struct ResourceQuery {
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

/// Where the final path segment lives: databases sit in the root, documents
/// in a database's or collection's document index, collections in a
/// document's collection index. Segment-count parity decides which.
enum Parent {
    Root,
    Documents(DocumentIndex),
    Collections(CollectionIndex),
}

/// Split and vet the resource path. `//` anywhere and an encoded slash in
/// the database segment are rejected; a trailing slash is ignored.
fn parse_segments(uri: &axum::http::Uri, decoded: &str) -> Result<Vec<String>> {
    let raw = uri.path();
    if raw.contains("//") {
        return Err(NestError::BadRequest("bad path: // not allowed".into()));
    }
    let raw_first = raw
        .trim_start_matches("/v1/")
        .split('/')
        .next()
        .unwrap_or_default();
    if raw_first.contains("%2F") || raw_first.contains("%2f") {
        return Err(NestError::BadRequest(
            "database name cannot contain /".into(),
        ));
    }

    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(NestError::BadRequest("empty resource path".into()));
    }
    Ok(trimmed.split('/').map(str::to_string).collect())
}

/// Walk the alternating tree down to the last segment's parent container,
/// failing with the appropriate NotFound at the first missing link.
fn resolve_parent(state: &AppState, segments: &[String]) -> Result<Parent> {
    if segments.len() == 1 {
        return Ok(Parent::Root);
    }

    let database = state.root.get_database(&segments[0])?;
    let mut documents = Arc::clone(&database.documents);
    let mut collections: Option<CollectionIndex> = None;

    for (depth, name) in segments
        .iter()
        .enumerate()
        .skip(1)
        .take(segments.len() - 2)
    {
        if depth % 2 == 1 {
            let document = store::get_document(&documents, name)?;
            collections = Some(Arc::clone(&document.collections));
        } else {
            let index = collections
                .as_ref()
                .ok_or_else(|| NestError::BadRequest("malformed resource path".into()))?;
            let collection = store::get_collection(index, name)?;
            documents = Arc::clone(&collection.documents);
        }
    }

    if segments.len() % 2 == 0 {
        Ok(Parent::Documents(documents))
    } else {
        let index = collections
            .ok_or_else(|| NestError::BadRequest("malformed resource path".into()))?;
        Ok(Parent::Collections(index))
    }
}

/// Document index of the container the (odd-length) path names.
fn resolve_container_documents(state: &AppState, segments: &[String]) -> Result<DocumentIndex> {
    match resolve_parent(state, segments)? {
        Parent::Root => Ok(state.root.get_database(&segments[0])?.documents),
        Parent::Collections(collections) => {
            let name = &segments[segments.len() - 1];
            Ok(store::get_collection(&collections, name)?.documents)
        }
        Parent::Documents(_) => Err(NestError::BadRequest(
            "path does not name a container".into(),
        )),
    }
}

/// `interval=[lo,hi]`; empty bounds are open ends. An absent or empty
/// parameter means an unbounded listing.
fn parse_interval(raw: Option<&str>) -> Result<(Option<String>, Option<String>)> {
    let raw = match raw {
        None | Some("") => return Ok((None, None)),
        Some(raw) => raw,
    };
    let trimmed = raw.trim_start_matches('[').trim_end_matches(']');
    let mut parts = trimmed.splitn(2, ',');
    let low = parts.next().unwrap_or_default().trim();
    let high = parts
        .next()
        .ok_or_else(|| NestError::BadRequest("interval must be [low,high]".into()))?
        .trim();
    let bound = |part: &str| {
        if part.is_empty() {
            None
        } else {
            Some(part.to_string())
        }
    };
    Ok((bound(low), bound(high)))
}

#[derive(Serialize)]
struct DocumentView {
    path: String,
    doc: Value,
    meta: Metadata,
}

impl DocumentView {
    fn from_document(document: &Document) -> Self {
        Self {
            path: format!("/{}", document.name),
            doc: document.body.as_ref().clone(),
            meta: document.metadata.clone(),
        }
    }
}

fn document_event_payload(document: &Document) -> String {
    json!({
        "path": document.path,
        "doc": document.body.as_ref(),
        "meta": document.metadata,
    })
    .to_string()
}

fn path_event_payload(resource: &str) -> String {
    json!({ "path": format!("/v1/{resource}") }).to_string()
}

fn quoted_resource(resource: &str) -> String {
    Value::String(format!("/v1/{resource}")).to_string()
}

async fn get_resource(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
    Query(params): Query<ResourceQuery>,
    Extension(principal): Extension<Principal>,
) -> Result<Response> {
    let segments = parse_segments(&uri, &path)?;

    if params
        .mode
        .as_deref()
        .is_some_and(|mode| mode.eq_ignore_ascii_case("subscribe"))
    {
        return subscribe_stream(state, segments.join("/"), principal);
    }

    let cancel = CancellationToken::new();
    let (low, high) = parse_interval(params.interval.as_deref())?;

    if segments.len() % 2 == 1 {
        let documents = resolve_container_documents(&state, &segments)?;
        let listed = store::list_documents(&documents, &cancel, low.as_ref(), high.as_ref())?;
        let views: Vec<DocumentView> = listed.iter().map(DocumentView::from_document).collect();
        Ok(Json(views).into_response())
    } else {
        let Parent::Documents(documents) = resolve_parent(&state, &segments)? else {
            return Err(NestError::BadRequest("malformed resource path".into()));
        };
        let document = store::get_document(&documents, &segments[segments.len() - 1])?;
        Ok(Json(DocumentView::from_document(&document)).into_response())
    }
}

async fn put_resource(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
    Query(params): Query<ResourceQuery>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response> {
    let segments = parse_segments(&uri, &path)?;
    let mode = WriteMode::parse(params.mode.as_deref());
    let resource = segments.join("/");
    let full_path = format!("/v1/{resource}");
    let last = segments[segments.len() - 1].clone();

    let created = match resolve_parent(&state, &segments)? {
        Parent::Root => {
            state.root.put_database(&last)?;
            state
                .hub
                .notify(&resource, EventKind::Update, &path_event_payload(&resource));
            true
        }
        Parent::Collections(collections) => {
            store::put_collection(&collections, &last)?;
            state
                .hub
                .notify(&resource, EventKind::Update, &path_event_payload(&resource));
            true
        }
        Parent::Documents(documents) => {
            let value: Value = serde_json::from_slice(&body)
                .map_err(|_| NestError::BadRequest("invalid request body".into()))?;
            let created = store::put_document(
                &documents,
                &last,
                &full_path,
                value,
                &principal.username,
                mode,
                state.validator.as_ref(),
            )?;
            let document = store::get_document(&documents, &last)?;
            state.hub.notify(
                &resource,
                EventKind::Update,
                &document_event_payload(&document),
            );
            created
        }
    };

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "uri": full_path }))).into_response())
}

async fn post_resource(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response> {
    let segments = parse_segments(&uri, &path)?;
    if segments.len() % 2 == 0 {
        return Err(NestError::BadRequest(
            "documents are created under a database or collection".into(),
        ));
    }

    let documents = resolve_container_documents(&state, &segments)?;
    let value: Value = serde_json::from_slice(&body)
        .map_err(|_| NestError::BadRequest("invalid request body".into()))?;

    let name = generate_document_name();
    let resource = format!("{}/{name}", segments.join("/"));
    let full_path = format!("/v1/{resource}");

    store::put_document(
        &documents,
        &name,
        &full_path,
        value,
        &principal.username,
        WriteMode::Overwrite,
        state.validator.as_ref(),
    )?;
    let document = store::get_document(&documents, &name)?;
    state.hub.notify(
        &resource,
        EventKind::Update,
        &document_event_payload(&document),
    );

    Ok((StatusCode::CREATED, Json(json!({ "uri": full_path }))).into_response())
}

async fn patch_resource(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response> {
    let segments = parse_segments(&uri, &path)?;
    if segments.len() % 2 == 1 {
        return Err(NestError::BadRequest("PATCH targets a document".into()));
    }

    let Parent::Documents(documents) = resolve_parent(&state, &segments)? else {
        return Err(NestError::BadRequest("malformed resource path".into()));
    };
    let operations: Vec<PatchOperation> = serde_json::from_slice(&body)
        .map_err(|_| NestError::BadRequest("invalid patch request body".into()))?;

    let last = &segments[segments.len() - 1];
    let uri_label = format!("/{last}");
    let resource = segments.join("/");

    match patch_document(
        &documents,
        last,
        &principal.username,
        &operations,
        state.validator.as_ref(),
    ) {
        Ok(document) => {
            state.hub.notify(
                &resource,
                EventKind::Update,
                &document_event_payload(&document),
            );
            Ok(Json(PatchReport::applied(&uri_label)).into_response())
        }
        Err(NestError::PatchFailed(message)) => {
            Ok(Json(PatchReport::failed(&uri_label, message)).into_response())
        }
        Err(err) => Err(err),
    }
}

async fn delete_resource(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
) -> Result<Response> {
    let segments = parse_segments(&uri, &path)?;
    let last = &segments[segments.len() - 1];

    match resolve_parent(&state, &segments)? {
        Parent::Root => {
            state.root.delete_database(last)?;
        }
        Parent::Documents(documents) => {
            store::delete_document(&documents, last)?;
        }
        Parent::Collections(collections) => {
            store::delete_collection(&collections, last)?;
        }
    }

    state
        .hub
        .notify_removed(&segments.join("/"), quoted_resource);

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Long-lived SSE stream for one subscriber: a greeting event, the
/// subscriber's queue, and a 15-second comment heartbeat, until the client
/// disconnects or the subscription is cancelled.
fn subscribe_stream(state: AppState, resource: String, principal: Principal) -> Result<Response> {
    state.hub.subscribe_path(&resource)?;
    let cancel = CancellationToken::new();
    let receiver = state
        .hub
        .add_subscription(&resource, &principal.token, cancel.clone())?;

    let guard = SubscriptionGuard {
        hub: Arc::clone(&state.hub),
        resource,
        token: principal.token,
    };

    let greeting = stream::once(async {
        sse_event(EventKind::Update, "\"Successfully connected!\"".to_string())
    });
    let feed =
        ReceiverStream::new(receiver).map(|frame| sse_event(frame.kind, frame.data));
    let stream = greeting
        .chain(feed)
        .take_until(cancel.cancelled_owned())
        .map(move |event| {
            // The guard rides along so the subscription is deleted when the
            // stream is dropped, whichever way it ends.
            let _ = &guard;
            Ok::<_, Infallible>(event)
        });

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEPALIVE_INTERVAL)
                .text("this is a comment message"),
        )
        .into_response())
}

fn sse_event(kind: EventKind, data: String) -> Event {
    Event::default()
        .event(kind.as_str())
        .id(Utc::now().timestamp_millis().to_string())
        .data(data)
}

struct SubscriptionGuard {
    hub: Arc<SubscriptionHub>,
    resource: String,
    token: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        // Already gone when the whole subtree was torn down; nothing to do.
        if let Err(err) = self.hub.delete_subscription(&self.resource, &self.token) {
            debug!(resource = %self.resource, %err, "subscription already removed");
        }
    }
}

/// 16 random bytes, URL-safe base64: the server-generated document name.
fn generate_document_name() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parsing_handles_open_ends() {
        assert_eq!(parse_interval(None).unwrap(), (None, None));
        // A present-but-empty parameter is the same as an absent one.
        assert_eq!(parse_interval(Some("")).unwrap(), (None, None));
        assert_eq!(
            parse_interval(Some("[a,b]")).unwrap(),
            (Some("a".to_string()), Some("b".to_string()))
        );
        assert_eq!(
            parse_interval(Some("[,b]")).unwrap(),
            (None, Some("b".to_string()))
        );
        assert_eq!(
            parse_interval(Some("[a,]")).unwrap(),
            (Some("a".to_string()), None)
        );
        assert!(parse_interval(Some("[a]")).is_err());
    }

    #[test]
    fn document_names_are_url_safe() {
        let name = generate_document_name();
        assert!(!name.is_empty());
        assert!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }
}

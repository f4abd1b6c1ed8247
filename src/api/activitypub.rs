//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections

use axum::body::Bytes;
use axum::{
    Router,
    extract::{DefaultBodyLimit, OriginalUri, Path, State},
    http::{Method, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppState;
use crate::config::SignatureFailureResponse;
use crate::data::LocalAccount;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, ACTIVITYSTREAMS_CONTEXT, InboxOutcome};
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/collections/:collection - Named collections (featured, tags)
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
///
/// Inbox bodies larger than `max_inbox_bytes` are refused with 413.
pub fn activitypub_router(max_inbox_bytes: usize) -> Router<AppState> {
    let inboxes = Router::new()
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_inbox_bytes));

    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/collections/:collection", get(collection))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .merge(inboxes)
}

async fn local_account(state: &AppState, username: &str) -> Result<LocalAccount, AppError> {
    state
        .db
        .get_local_account(username, &state.config.server.domain)
        .await?
        .ok_or(AppError::NotFound)
}

fn activity_json(body: Value) -> Response {
    ([(CONTENT_TYPE, ACTIVITY_JSON)], Json(body)).into_response()
}

/// GET /users/:username
///
/// Returns ActivityPub Actor document.
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/users/:username"])
        .start_timer();

    let local = local_account(&state, &username).await?;
    let actor = &local.actor;
    let base_url = state.config.server.base_url();
    let name = if actor.display_name.is_empty() {
        &actor.name
    } else {
        &actor.display_name
    };

    let mut document = json!({
        "@context": [
            ACTIVITYSTREAMS_CONTEXT,
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor.uri,
        "preferredUsername": actor.name,
        "name": name,
        "summary": actor.note,
        "manuallyApprovesFollowers": actor.locked,
        "inbox": format!("{}/inbox", actor.uri),
        "outbox": format!("{}/outbox", actor.uri),
        "followers": format!("{}/followers", actor.uri),
        "following": format!("{}/following", actor.uri),
        "featured": format!("{}/collections/featured", actor.uri),
        "url": actor.uri,
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "publicKey": {
            "id": actor.public_key_id(),
            "owner": actor.uri,
            "publicKeyPem": actor.public_key_pem
        }
    });
    if let Some(avatar) = &actor.avatar {
        document["icon"] = json!({ "type": "Image", "url": avatar });
    }
    if let Some(header) = &actor.header {
        document["image"] = json!({ "type": "Image", "url": header });
    }

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/users/:username", "200"])
        .inc();

    Ok(activity_json(document))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities for a local user.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/users/:username/inbox"])
        .start_timer();

    local_account(&state, &username).await?;

    receive(&state, "/users/:username/inbox", method, &uri, &headers, &body).await
}

/// POST /inbox
///
/// Shared inbox for all users on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/inbox"])
        .start_timer();

    receive(&state, "/inbox", method, &uri, &headers, &body).await
}

/// Verify and store, then map the outcome to a status code.
///
/// 202 is only sent after the activity row is committed.
async fn receive(
    state: &AppState,
    endpoint: &str,
    method: Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let cancel = state.shutdown.child_token();

    let outcome = state
        .inbox
        .receive(method.as_str(), path_and_query, headers, body, &cancel)
        .await?;

    let response = match outcome {
        InboxOutcome::Accepted { .. } => StatusCode::ACCEPTED.into_response(),
        InboxOutcome::Rejected { reason } => match state.config.federation.signature_failure_response
        {
            SignatureFailureResponse::Accepted => StatusCode::ACCEPTED.into_response(),
            SignatureFailureResponse::Reject => AppError::SignatureInvalid(reason).into_response(),
        },
    };

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, response.status().as_str()])
        .inc();

    Ok(response)
}

/// GET /users/:username/outbox
///
/// Statuses are not published by this server, so the outbox is always empty.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let local = local_account(&state, &username).await?;

    Ok(ordered_collection(
        format!("{}/outbox", local.actor.uri),
        Vec::new(),
    ))
}

/// GET /users/:username/collections/:collection
///
/// Pinned posts and featured tags are not kept, so every named collection
/// is empty.
async fn collection(
    State(state): State<AppState>,
    Path((username, collection)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let local = local_account(&state, &username).await?;

    Ok(ordered_collection(
        format!("{}/collections/{}", local.actor.uri, collection),
        Vec::new(),
    ))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let local = local_account(&state, &username).await?;
    let items = state.db.follower_uris(&local.actor.id).await?;

    Ok(ordered_collection(
        format!("{}/followers", local.actor.uri),
        items,
    ))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let local = local_account(&state, &username).await?;
    let items = state.db.following_uris(&local.actor.id).await?;

    Ok(ordered_collection(
        format!("{}/following", local.actor.uri),
        items,
    ))
}

fn ordered_collection(id: String, items: Vec<String>) -> Response {
    activity_json(json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "type": "OrderedCollection",
        "id": id,
        "totalItems": items.len(),
        "orderedItems": items
    }))
}

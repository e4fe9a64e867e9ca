//! # HTTP Surface
//!
//! `/api/v1/...`: a family of thin shape-adapters over the bridge. Each
//! handler converts its HTTP body into the agent message the far side
//! understands, calls through the bridge, and returns the agent's reply
//! verbatim. Error mapping: a malformed body is 400 with
//! `{"error":"Invalid request body"}`, every bridge failure is 500 with
//! the bridge's message in the same envelope.

use crate::bridge;
use crate::error::BridgeError;
use crate::protocol::Role;
use crate::state::SharedState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/files/list/{agent_type}/{tenant_id}/{key}", post(list_files))
        .route("/files/upload/{agent_type}/{tenant_id}/{key}", post(upload_file))
        .route("/files/download/{agent_type}/{tenant_id}/{key}", get(download_file))
        .route("/files/delete/{agent_type}/{tenant_id}/{key}", delete(delete_path))
        .route("/files/mkdir/{agent_type}/{tenant_id}/{key}", post(create_directory))
        .route("/files/rename/{agent_type}/{tenant_id}/{key}", put(rename_path))
        .route("/files/edit/{agent_type}/{tenant_id}/{key}", post(edit_file))
        .route("/files/save/{agent_type}/{tenant_id}/{key}", post(save_file))
        .route("/files/zip/{agent_type}/{tenant_id}/{key}", post(zip_files))
        .route("/files/unzip/{agent_type}/{tenant_id}/{key}", post(unzip_file))
        .route("/files/open/{agent_type}/{tenant_id}/{key}", post(open_file))
        .route("/files/paste/{agent_type}/{tenant_id}/{key}", post(paste_files))
        .route("/files/operation/{agent_type}/{tenant_id}/{key}", post(file_operation))
        .route("/encoder/settings/{agent_type}/{tenant_id}/{key}", post(encoder_settings))
        .route("/agent/details/{agent_type}/{tenant_id}/{key}", get(agent_details))
        .route("/agent/software/{agent_type}/{tenant_id}/{key}", get(installed_software))
        .route("/agents/keys/{tenant_id}", get(agent_keys))
}

/// The slot every bridged endpoint addresses.
#[derive(Debug, Deserialize)]
pub struct SlotPath {
    agent_type: String,
    tenant_id: String,
    key: String,
}

// ─── Shared Plumbing ────────────────────────────────────────────

fn invalid_body() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Invalid request body"})),
    )
        .into_response()
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": message})),
    )
        .into_response()
}

/// Sends a message through the bridge and maps the outcome onto the
/// HTTP envelope.
async fn relay_call(state: &SharedState, slot: &SlotPath, message: Value) -> Response {
    match relay_call_value(state, slot, message).await {
        Ok(response) => Json(response).into_response(),
        Err(response) => response,
    }
}

async fn relay_call_value(
    state: &SharedState,
    slot: &SlotPath,
    message: Value,
) -> Result<Value, Response> {
    let Ok(role) = slot.agent_type.parse::<Role>() else {
        // A role outside the accepted set can have no uplink; report it
        // exactly like any other absent agent.
        let private = state
            .keystore
            .get_private_by_public(&slot.key)
            .unwrap_or_else(|| slot.key.clone());
        let err = BridgeError::NoAgent {
            role: slot.agent_type.clone(),
            key: slot.key.clone(),
            private,
        };
        return Err(error_response(err.to_string()));
    };
    bridge::call(state, &slot.tenant_id, role, &slot.key, message)
        .await
        .map_err(|err| error_response(err.to_string()))
}

// ─── File Endpoints ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListFilesBody {
    path: Option<String>,
    show_hidden: Option<bool>,
}

async fn list_files(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<ListFilesBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    let message = json!({
        "type": "list_remote",
        "path": body.path,
        "show_hidden": body.show_hidden,
    });
    relay_call(&state, &slot, message).await
}

async fn upload_file(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    mut multipart: Multipart,
) -> Response {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut path: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(_) => return invalid_body(),
        };
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let Ok(bytes) = field.bytes().await else {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": "Failed to read file"})),
                    )
                        .into_response();
                };
                file = Some((filename, bytes.to_vec()));
            }
            Some("path") => {
                path = field.text().await.ok();
            }
            _ => {}
        }
    }

    let Some((filename, content)) = file else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No file provided"})),
        )
            .into_response();
    };
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No path provided"})),
        )
            .into_response();
    };

    let message = json!({
        "type": "upload_file",
        "path": path,
        "filename": filename,
        "content_base64": BASE64.encode(&content),
    });
    relay_call(&state, &slot, message).await
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    path: String,
}

/// Downloads a remote file. When the agent ships the content inline as
/// base64, the response becomes an attachment; otherwise the agent's
/// JSON reply is passed through.
async fn download_file(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let message = json!({"type": "download_file", "path": query.path});
    let response = match relay_call_value(&state, &slot, message).await {
        Ok(response) => response,
        Err(response) => return response,
    };

    if let Some(content) = response.get("content").and_then(Value::as_str) {
        let Ok(bytes) = BASE64.decode(content) else {
            return error_response("Failed to decode file content".to_string());
        };
        let filename = std::path::Path::new(&query.path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| query.path.clone());
        return (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", filename),
                ),
            ],
            bytes,
        )
            .into_response();
    }

    Json(response).into_response()
}

#[derive(Debug, Deserialize)]
struct PathBody {
    path: Option<String>,
}

async fn delete_path(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<PathBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    relay_call(&state, &slot, json!({"type": "delete", "path": body.path})).await
}

async fn create_directory(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<PathBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    relay_call(
        &state,
        &slot,
        json!({"type": "create_folder", "path": body.path}),
    )
    .await
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    old_path: Option<String>,
    new_name: Option<String>,
}

async fn rename_path(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<RenameBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    let message = json!({
        "type": "rename",
        "old_path": body.old_path,
        "new_name": body.new_name,
    });
    relay_call(&state, &slot, message).await
}

async fn edit_file(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<PathBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    relay_call(&state, &slot, json!({"type": "edit_file", "path": body.path})).await
}

#[derive(Debug, Deserialize)]
struct SaveBody {
    path: Option<String>,
    content: Option<String>,
}

async fn save_file(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<SaveBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    let message = json!({
        "type": "save_file",
        "path": body.path,
        "content": body.content,
    });
    relay_call(&state, &slot, message).await
}

#[derive(Debug, Deserialize)]
struct ZipBody {
    target_list: Option<Value>,
    zip_name: Option<String>,
}

async fn zip_files(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<ZipBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    let message = json!({
        "type": "zip_file",
        "target_list": body.target_list,
        "zip_name": body.zip_name,
    });
    relay_call(&state, &slot, message).await
}

#[derive(Debug, Deserialize)]
struct UnzipBody {
    source: Option<String>,
    target: Option<String>,
}

async fn unzip_file(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<UnzipBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    let message = json!({
        "type": "unzip_file",
        "source": body.source,
        "target": body.target,
    });
    relay_call(&state, &slot, message).await
}

async fn open_file(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<PathBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    relay_call(&state, &slot, json!({"type": "open_file", "path": body.path})).await
}

#[derive(Debug, Deserialize)]
struct PasteBody {
    from_list: Option<Value>,
    to: Option<String>,
    mode: Option<String>,
}

async fn paste_files(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<PasteBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    let message = json!({
        "type": "paste_file",
        "from_list": body.from_list,
        "to": body.to,
        "mode": body.mode,
    });
    relay_call(&state, &slot, message).await
}

/// Generic escape hatch: the entire body goes to the agent unmodified.
async fn file_operation(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    relay_call(&state, &slot, body).await
}

// ─── Agent Endpoints ────────────────────────────────────────────

async fn encoder_settings(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return invalid_body();
    };
    relay_call(
        &state,
        &slot,
        json!({"type": "encoder_settings", "settings": body}),
    )
    .await
}

async fn agent_details(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
) -> Response {
    relay_call(&state, &slot, json!({"type": "get_agent_details"})).await
}

async fn installed_software(
    State(state): State<SharedState>,
    Path(slot): Path<SlotPath>,
) -> Response {
    relay_call(&state, &slot, json!({"type": "get_installed_software"})).await
}

/// `GET /agents/keys/{tenant_id}`: the public handle a viewer needs to
/// address this tenant's agent.
async fn agent_keys(
    State(state): State<SharedState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match state.keystore.get_public_by_name(&tenant_id) {
        Some(publickey) => Json(json!({
            "tenant_id": tenant_id,
            "key": publickey,
            "publickey": publickey,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Agent not found"})),
        )
            .into_response(),
    }
}

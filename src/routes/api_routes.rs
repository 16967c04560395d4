use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::AppError;
use crate::service::analysis_service::AnalysisService;

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST `/api/sessions/{id}/datasets` — multipart upload of one or more CSV
/// files; responds with the registered handles as JSON.
pub async fn upload_datasets_handler(
    Path(id): Path<String>,
    State(svc): State<AnalysisService>,
    mut multipart: Multipart,
) -> Response {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                // Only file parts carry a filename; other form fields are
                // not part of this API.
                let Some(filename) = field.file_name().map(str::to_string) else {
                    continue;
                };
                match field.bytes().await {
                    Ok(bytes) => files.push((filename, bytes.to_vec())),
                    Err(e) => {
                        return bad_request(format!("Failed to read '{filename}': {e}"));
                    }
                }
            }
            Ok(None) => break,
            Err(e) => return bad_request(format!("Invalid multipart upload: {e}")),
        }
    }

    match svc.upload_datasets(&id, files).await {
        Ok(handles) => Json(handles).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/sessions/{id}/turns` — REST: conversation history as JSON.
pub async fn list_turns_handler(
    Path(id): Path<String>,
    State(svc): State<AnalysisService>,
) -> impl IntoResponse {
    match svc.turns(&id).await {
        Ok(turns) => Json(turns).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/health` — liveness check.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_remote_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

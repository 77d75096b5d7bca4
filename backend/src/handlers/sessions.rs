use axum::{
    extract::{Extension, Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::AppError,
    models::user::SessionResponse,
    state::AppState,
    types::FamilyId,
    utils::{cookies::refresh_cookie_from_headers, jwt::Claims},
};

/// The caller's sessions, newest first. The one behind the request's refresh
/// cookie is flagged `is_current`.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionResponse>>, AppError> {
    let current = current_family(&state, &headers);
    let sessions = state.sessions.list_sessions(&claims.sub, current).await?;
    Ok(Json(sessions))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(family_id): Path<FamilyId>,
) -> Result<Json<Value>, AppError> {
    state.sessions.revoke_session(&claims.sub, family_id).await?;
    tracing::info!(subject = %claims.sub, family_id = %family_id, "Session revoked by owner");
    Ok(Json(json!({
        "message": "Session revoked",
        "family_id": family_id
    })))
}

fn current_family(state: &AppState, headers: &HeaderMap) -> Option<FamilyId> {
    refresh_cookie_from_headers(headers)
        .and_then(|token| state.sessions.engine().family_id_from_token(&token))
}

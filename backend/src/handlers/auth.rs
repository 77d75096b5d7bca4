use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use validator::Validate;

use crate::{
    error::AppError,
    middleware::auth::bearer_token,
    models::user::{ChangePasswordRequest, LoginRequest, MessageResponse, TokenResponse},
    services::rotation::IssuedTokens,
    state::AppState,
    utils::{
        client::ClientContext,
        cookies::{
            append_set_cookie, build_clear_refresh_cookie, build_refresh_cookie,
            refresh_cookie_from_headers,
        },
        jwt::Claims,
    },
};

const TOKEN_TYPE: &str = "Bearer";

pub async fn login(
    State(state): State<AppState>,
    ctx: ClientContext,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AppError> {
    payload.validate()?;
    let issued = state
        .sessions
        .login(&payload.email, &payload.password, &ctx)
        .await?;
    tracing::info!(
        subject = %issued.subject,
        family_id = %issued.family.family_id,
        "Login succeeded"
    );
    Ok(session_response(&state, issued))
}

/// Rotates the refresh cookie. A bearer access token, when sent, must belong
/// to the same subject. Failures that end the session also clear the cookie.
pub async fn refresh(
    State(state): State<AppState>,
    ctx: ClientContext,
    headers: HeaderMap,
) -> Response {
    let refresh_token = refresh_cookie_from_headers(&headers);
    let access_token = bearer_token(&headers);

    match state
        .sessions
        .refresh(refresh_token.as_deref(), access_token.as_deref(), &ctx)
        .await
    {
        Ok(issued) => session_response(&state, issued),
        Err(err) => {
            let clear = err.ends_session();
            let mut response = AppError::from(err).into_response();
            if clear {
                append_set_cookie(
                    response.headers_mut(),
                    &build_clear_refresh_cookie(state.cookies),
                );
            }
            response
        }
    }
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let refresh_token = refresh_cookie_from_headers(&headers);
    let mut response = match state.sessions.logout(refresh_token.as_deref()).await {
        Ok(family_id) => {
            if let Some(family_id) = family_id {
                tracing::info!(family_id = %family_id, "Logged out");
            }
            Json(MessageResponse::new("Logged out")).into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    };
    append_set_cookie(
        response.headers_mut(),
        &build_clear_refresh_cookie(state.cookies),
    );
    response
}

pub async fn logout_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, AppError> {
    let revoked = state.sessions.logout_all(&claims.sub).await?;
    tracing::info!(subject = %claims.sub, revoked, "Logged out of every session");
    Ok(with_cleared_cookie(
        &state,
        json!({ "message": "Logged out of all sessions", "revoked_sessions": revoked }),
    ))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ctx: ClientContext,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Response, AppError> {
    payload.validate()?;
    let revoked = state
        .sessions
        .change_password(
            &claims.sub,
            &payload.current_password,
            &payload.new_password,
            &ctx,
        )
        .await?;
    Ok(with_cleared_cookie(
        &state,
        json!({ "message": "Password updated successfully", "revoked_sessions": revoked }),
    ))
}

fn session_response(state: &AppState, issued: IssuedTokens) -> Response {
    let mut headers = HeaderMap::new();
    append_set_cookie(
        &mut headers,
        &build_refresh_cookie(
            &issued.refresh_token,
            issued.family.absolute_expires_at,
            state.cookies,
        ),
    );
    let body = TokenResponse {
        access_token: issued.access_token,
        token_type: TOKEN_TYPE.to_string(),
        expires_in: issued.access_expires_in,
        subject: issued.subject,
        roles: issued.roles,
    };
    (headers, Json(body)).into_response()
}

fn with_cleared_cookie(state: &AppState, body: Value) -> Response {
    let mut headers = HeaderMap::new();
    append_set_cookie(&mut headers, &build_clear_refresh_cookie(state.cookies));
    (headers, Json(body)).into_response()
}

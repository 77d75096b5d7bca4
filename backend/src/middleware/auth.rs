use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::{
    error::{AppError, AuthError},
    state::AppState,
    utils::jwt::{Claims, TokenKind},
};

/// Stateless access-token check. Verified claims are inserted into the request
/// extensions for the handlers behind it.
pub async fn auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| AppError::Unauthorized("Missing access token".to_string()))?;
    let claims = authenticate_token(&state, &token)?;
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

fn authenticate_token(state: &AppState, token: &str) -> Result<Claims, AuthError> {
    let claims = state.codec().verify(token)?;
    if claims.typ != TokenKind::Access {
        return Err(AuthError::InvalidTokenType);
    }
    Ok(claims)
}

pub fn parse_bearer_token(header: &str) -> Option<&str> {
    if let Some(rest) = header.strip_prefix("Bearer ") {
        return Some(rest);
    }
    if let Some(space_idx) = header.find(' ') {
        let (scheme, rest) = header.split_at(space_idx);
        if scheme.eq_ignore_ascii_case("bearer") {
            return Some(rest.trim_start());
        }
    }
    None
}

/// Token from the `Authorization` header, if one is present and non-empty.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| token.to_owned())
}

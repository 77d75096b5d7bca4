#![allow(dead_code)] // OpenAPI doc stubs are only referenced by utoipa macros.

use crate::{
    error::ErrorResponse,
    models::user::{
        ChangePasswordRequest, LoginRequest, MessageResponse, SessionResponse, TokenResponse,
    },
    types::FamilyId,
};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        login_doc,
        refresh_doc,
        logout_doc,
        logout_all_doc,
        change_password_doc,
        list_sessions_doc,
        revoke_session_doc
    ),
    components(schemas(
        LoginRequest,
        TokenResponse,
        ChangePasswordRequest,
        MessageResponse,
        SessionResponse,
        ErrorResponse,
        FamilyId
    )),
    modifiers(&SecuritySchemes),
    tags(
        (name = "Auth", description = "Login, refresh rotation and logout"),
        (name = "Sessions", description = "Session management for the signed-in subject")
    ),
    security(("BearerAuth" = []))
)]
pub struct ApiDoc;

struct SecuritySchemes;

impl Modify for SecuritySchemes {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_default();

        let mut bearer = Http::new(HttpAuthScheme::Bearer);
        bearer.bearer_format = Some("JWT".to_string());
        components.add_security_scheme("BearerAuth", SecurityScheme::Http(bearer));

        components.add_security_scheme(
            "RefreshCookie",
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::new("refresh_token"))),
        );
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session started; refresh cookie set", body = TokenResponse),
        (status = 401, description = "INVALID_CREDENTIALS (wrong password or locked account)", body = ErrorResponse),
        (status = 429, description = "Per-IP rate limit exceeded", body = ErrorResponse)
    ),
    tag = "Auth",
    security(())
)]
fn login_doc() {}

#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    responses(
        (status = 200, description = "Refresh token rotated; new cookie set", body = TokenResponse),
        (status = 400, description = "INVALID_TOKEN_TYPE or REFRESH_BINDING_MISMATCH", body = ErrorResponse),
        (status = 401, description = "Token or session failure; cookie cleared when the session ended", body = ErrorResponse)
    ),
    tag = "Auth",
    security(("RefreshCookie" = []))
)]
fn refresh_doc() {}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses((status = 200, description = "Cookie cleared; its session revoked", body = MessageResponse)),
    tag = "Auth",
    security(("RefreshCookie" = []))
)]
fn logout_doc() {}

#[utoipa::path(
    post,
    path = "/api/auth/logout-all",
    responses(
        (status = 200, description = "Every session of the subject revoked", body = serde_json::Value),
        (status = 401, body = ErrorResponse)
    ),
    tag = "Auth"
)]
fn logout_all_doc() {}

#[utoipa::path(
    put,
    path = "/api/auth/change-password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; every session revoked", body = serde_json::Value),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse)
    ),
    tag = "Auth"
)]
fn change_password_doc() {}

#[utoipa::path(
    get,
    path = "/api/auth/sessions",
    responses((status = 200, body = [SessionResponse])),
    tag = "Sessions"
)]
fn list_sessions_doc() {}

#[utoipa::path(
    delete,
    path = "/api/auth/sessions/{family_id}",
    params(("family_id" = String, Path, description = "Session family id")),
    responses(
        (status = 200, description = "Session revoked", body = serde_json::Value),
        (status = 404, description = "No such session for this subject", body = ErrorResponse)
    ),
    tag = "Sessions"
)]
fn revoke_session_doc() {}

//! Service wiring shared by the server binary and the integration tests.

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::{
    config::Config,
    db::{connection::DbPool, redis::RedisPool},
    handlers,
    middleware::{self as app_middleware, rate_limit::AuthRateLimitLayer},
    services::{
        credentials::CredentialVerifier,
        login_guard::build_login_guard,
        refresh_store::build_refresh_store,
        rotation::{RotationEngine, RotationPolicy},
        session::SessionService,
    },
    state::AppState,
    utils::jwt::TokenCodec,
};

/// Builds the store, guard, engine and session service for the configured backend.
pub fn build_state(
    config: Config,
    pool: Option<DbPool>,
    redis: Option<RedisPool>,
    credentials: Arc<dyn CredentialVerifier>,
) -> anyhow::Result<AppState> {
    let store = build_refresh_store(&config, pool.clone(), redis.clone())?;
    let guard = build_login_guard(&config, pool, redis)?;
    let engine = Arc::new(RotationEngine::new(
        store.clone(),
        credentials.clone(),
        TokenCodec::new(&config.jwt_secret),
        RotationPolicy::from_config(&config),
    ));
    let sessions = SessionService::new(engine, guard, credentials);
    Ok(AppState::new(config, sessions, store))
}

/// Auth routes. `limiter` throttles the unauthenticated ones per client IP.
pub fn build_router(state: AppState, limiter: Option<AuthRateLimitLayer>) -> Router {
    let mut public_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/refresh", post(handlers::auth::refresh))
        .route("/api/auth/logout", post(handlers::auth::logout));
    if let Some(limiter) = limiter {
        public_routes = public_routes.layer(limiter);
    }

    let user_routes = Router::new()
        .route("/api/auth/logout-all", post(handlers::auth::logout_all))
        .route(
            "/api/auth/change-password",
            put(handlers::auth::change_password),
        )
        .route("/api/auth/sessions", get(handlers::sessions::list_sessions))
        .route(
            "/api/auth/sessions/{family_id}",
            delete(handlers::sessions::revoke_session),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .layer(axum_middleware::from_fn(app_middleware::log_error_responses))
        .layer(axum_middleware::from_fn(app_middleware::request_id))
        .with_state(state)
}

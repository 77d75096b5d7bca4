use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use sessionguard_backend::{
    app::{build_router, build_state},
    config::Config,
    db::{
        connection::{create_pool, run_migrations, DbPool},
        redis::create_redis_pool,
    },
    docs::ApiDoc,
    middleware::rate_limit::create_auth_rate_limiter,
    services::{credentials::PgCredentialVerifier, sweeper::spawn_session_sweeper},
};

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

fn mask_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => match url.split_once("://") {
            Some((scheme, _)) => format!("{}://***@{}", scheme, host),
            None => format!("***@{}", host),
        },
        None => url.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sessionguard_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(
        database_url = %mask_url(&config.database_url),
        redis_url = %config.redis_url.as_deref().map(mask_url).unwrap_or_else(|| "<unset>".into()),
        jwt_secret = %mask_secret(&config.jwt_secret),
        session_store_backend = ?config.session_store_backend,
        access_token_expiration_minutes = config.access_token_expiration_minutes,
        refresh_token_expiration_days = config.refresh_token_expiration_days,
        refresh_token_idle_hours = config.refresh_token_idle_hours,
        device_mismatch_policy = ?config.refresh_device_mismatch_policy,
        ip_mismatch_policy = ?config.refresh_ip_mismatch_policy,
        "Loaded configuration from environment/.env"
    );

    let pool: DbPool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    let redis = create_redis_pool(&config).await?;

    let credentials = Arc::new(PgCredentialVerifier::new(pool.clone()));
    let state = build_state(config.clone(), Some(pool), redis, credentials)?;

    // Relational rows are deleted; on Redis this prunes the subject index.
    spawn_session_sweeper(state.store.clone(), config.session_sweep_interval_seconds);

    let limiter = create_auth_rate_limiter(&config)?;
    let app = Router::new()
        .merge(build_router(state, Some(limiter)))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config)),
        );

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-device-id"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(std::time::Duration::from_secs(24 * 60 * 60))
}

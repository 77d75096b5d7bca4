use chrono::{Duration, Utc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sessionguard_backend::{
    config::Config,
    db::connection::create_pool,
    repositories::login_attempt,
    services::refresh_store::{PgRefreshTokenStore, RefreshTokenStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sessionguard_backend=info,token_cleanup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let pool = create_pool(&config.database_url).await?;
    let now = Utc::now();

    let store = PgRefreshTokenStore::new(pool.clone());
    let deleted_families = store.sweep_expired(now).await?;
    tracing::info!(deleted_families, "Deleted expired refresh token families");

    let idle_cutoff =
        now - Duration::hours(config.account_lockout_max_duration_hours.max(1) as i64);
    let deleted_attempts = login_attempt::delete_stale_attempts(&pool, idle_cutoff, now).await?;
    tracing::info!(deleted_attempts, "Deleted stale login attempt counters");

    sqlx::query("VACUUM (ANALYZE) refresh_token_families")
        .execute(&pool)
        .await?;

    Ok(())
}

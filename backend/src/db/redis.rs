use crate::config::Config;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;

pub type RedisPool = Pool<RedisConnectionManager>;

/// Builds the shared pool when `REDIS_URL` is configured; the Redis-backed
/// session store and login guard draw from it.
pub async fn create_redis_pool(config: &Config) -> anyhow::Result<Option<RedisPool>> {
    let Some(url) = &config.redis_url else {
        tracing::info!("Redis URL not set, Redis-backed session storage unavailable");
        return Ok(None);
    };

    let pool = connect(url, config.redis_pool_size, config.redis_connect_timeout).await?;
    tracing::info!(
        "Redis connection pool created (size: {})",
        config.redis_pool_size
    );
    Ok(Some(pool))
}

pub async fn connect(url: &str, size: u32, connect_timeout_secs: u64) -> anyhow::Result<RedisPool> {
    let manager = RedisConnectionManager::new(url)?;
    let pool = Pool::builder()
        .max_size(size)
        .connection_timeout(Duration::from_secs(connect_timeout_secs))
        .build(manager)
        .await?;
    Ok(pool)
}

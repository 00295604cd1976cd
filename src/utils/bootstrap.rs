//! Shared initialization code for all saga-orchestrator binaries.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with the `SAGA_LOG` environment variable.
///
/// Defaults to "info" level if `SAGA_LOG` is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(crate::config::LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to a dependency with exponential backoff retry.
///
/// Used at binary startup for the database pool and any broker client —
/// services should not crash-loop just because Postgres/Kafka is still
/// starting up alongside them in a compose/k8s environment.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
        .build();

    let mut last_error = None;

    for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
        if attempt > 0 {
            warn!(
                service_name,
                address,
                attempt,
                backoff_ms = delay.as_millis(),
                error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match connect().await {
            Ok(client) => {
                tracing::info!(service_name, address, attempt, "connected");
                return Ok(client);
            }
            Err(e) => last_error = Some(e),
        }
    }

    let e = last_error.expect("backoff iterator always yields at least one attempt");
    tracing::error!(service_name, address, error = %e, "giving up");
    Err(e)
}

/// Open a SQLite pool against `database_url`, retrying connection
/// establishment like every other dependency at startup.
#[cfg(feature = "sqlite")]
pub async fn sqlite_pool(database_url: &str) -> sqlx::SqlitePool {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    connect_with_retry("sqlite", database_url, || async {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        SqlitePoolOptions::new().max_connections(5).connect_with(options).await
    })
    .await
    .expect("failed to connect to sqlite database")
}

/// Open a Postgres pool against `database_url`, retrying connection
/// establishment like every other dependency at startup.
#[cfg(feature = "postgres")]
pub async fn postgres_pool(database_url: &str) -> sqlx::PgPool {
    use sqlx::postgres::PgPoolOptions;

    connect_with_retry("postgres", database_url, || async {
        PgPoolOptions::new().max_connections(10).connect(database_url).await
    })
    .await
    .expect("failed to connect to postgres database")
}

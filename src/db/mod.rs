//! Database connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::PostgresConfig;

/// PostgreSQL database connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(config: &PostgresConfig) -> Result<Self, sqlx::Error> {
        let mut options = PgConnectOptions::from_str(&config.url)?;
        if config.statement_timeout_ms > 0 {
            options = options.options([(
                "statement_timeout",
                format!("{}ms", config.statement_timeout_ms),
            )]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running PostgreSQL instance
    // Run with: DATABASE_URL=postgres://... cargo test -- --ignored

    fn test_config() -> PostgresConfig {
        PostgresConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| PostgresConfig::default().url),
            max_connections: 2,
            acquire_timeout_secs: 5,
            statement_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let config = PostgresConfig {
            url: "not a url".to_string(),
            ..PostgresConfig::default()
        };
        assert!(Database::connect(&config).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_database_health_check() {
        let db = Database::connect(&test_config())
            .await
            .expect("Failed to connect");

        let health = db.health_check().await;
        assert!(health.is_ok(), "Health check should pass");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_statement_timeout_applied() {
        let db = Database::connect(&test_config())
            .await
            .expect("Failed to connect");

        let timeout: String = sqlx::query_scalar("SHOW statement_timeout")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(timeout, "1s");
    }
}

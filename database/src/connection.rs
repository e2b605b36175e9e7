use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use scheduler_core::error::StoreError;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{error, info};

use crate::schema::SCHEMA;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub max_connections: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("DATABASE_HOST")
                .unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("DATABASE_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .unwrap_or(5432),
            database: std::env::var("DATABASE_NAME")
                .unwrap_or_else(|_| "fate_flow".to_string()),
            user: std::env::var("DATABASE_USER")
                .unwrap_or_else(|_| "fate".to_string()),
            password: std::env::var("DB_PASSWORD").ok(),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(Some(20)),
        }
    }
}

pub struct Database {
    pub(crate) pool: Pool,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Result<Self, StoreError> {
        let mut pool_config = deadpool_postgres::Config::new();
        pool_config.host = Some(config.host);
        pool_config.port = Some(config.port);
        pool_config.user = Some(config.user);
        pool_config.password = config.password;
        pool_config.dbname = Some(config.database);
        pool_config.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.max_connections.unwrap_or(20),
            ..Default::default()
        });

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Database(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    pub(crate) async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to get database client: {}", e)))
    }

    /// Create the tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.execute_sql(SCHEMA).await?;
        info!("Database schema is up to date");
        Ok(())
    }

    /// Execute raw SQL (useful for migrations)
    pub async fn execute_sql(&self, sql: &str) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to execute SQL: {}", e)))
    }
}

#[async_trait]
impl scheduler_core::database::Database for Database {
    async fn health_check(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => match client.query_one("SELECT 1", &[]).await {
                Ok(_) => true,
                Err(e) => {
                    error!(error = ?e, "Database health check query failed");
                    false
                }
            },
            Err(e) => {
                error!(error = ?e, "Database health check failed - couldn't get client");
                false
            }
        }
    }

    async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close();
    }
}

/// Map a driver error, keeping unique-key violations distinguishable.
pub(crate) fn db_error(context: &str, e: tokio_postgres::Error) -> StoreError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StoreError::Duplicate(context.to_string())
    } else {
        StoreError::Database(format!("{}: {}", context, e))
    }
}

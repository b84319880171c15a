//! Database session management
//!
//! One session per refresh run, with keepalive signaling and a bounded
//! per-statement execution ceiling so a stuck refresh surfaces instead of
//! hanging. Multi-statement operations run through `execute_group`, which
//! submits the whole group inside a single transaction.

use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::config::{DatabaseConfig, RefreshConfig};
use crate::error::{RefreshError, RefreshResult};

/// A live database session with operational safety settings applied
pub struct Session {
    client: Client,
}

impl Session {
    /// Connect and apply keepalive and statement-timeout settings.
    pub async fn connect(
        database: &DatabaseConfig,
        refresh: &RefreshConfig,
    ) -> RefreshResult<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&database.host)
            .port(database.port)
            .user(&database.user)
            .password(&database.password)
            .dbname(&database.database)
            .connect_timeout(std::time::Duration::from_secs(30));

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| RefreshError::Connection(format!("failed to connect: {}", e)))?;

        // The connection object drives the socket; it must be polled for
        // the client to make progress.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("database connection error: {}", e);
            }
        });

        let session = Self { client };
        session
            .client
            .batch_execute(&session_settings_sql(refresh))
            .await
            .map_err(|e| {
                RefreshError::Connection(format!("failed to apply session settings: {}", e))
            })?;

        info!(
            host = %database.host,
            database = %database.database,
            "database session established"
        );
        Ok(session)
    }

    /// Execute a group of statements as one transaction: all of them
    /// commit, or none do. Any leftover transaction state is rolled back
    /// first so the group starts clean.
    pub async fn execute_group(&mut self, label: &str, statements: &[String]) -> RefreshResult<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let script = statements.join("\n");
        debug!(label, "executing statement group: {:.100}...", script);

        self.client.batch_execute("ROLLBACK").await.ok();

        let transaction = self.client.transaction().await?;
        transaction.batch_execute(&script).await?;
        transaction.commit().await?;

        debug!(label, "statement group committed");
        Ok(())
    }

    /// Sum an expression over a relation's non-null values. A missing
    /// relation yields `None` rather than an error, so a first run against
    /// an empty database has no baseline instead of failing. A relation
    /// that exists but has no qualifying rows totals zero, so a collapse
    /// to an empty view still compares against its baseline.
    pub async fn sum_total(&self, relation: &str, expression: &str) -> RefreshResult<Option<f64>> {
        let query = format!(
            "SELECT SUM({expr})::float8 FROM {relation} WHERE ({expr}) IS NOT NULL",
            expr = expression,
            relation = relation,
        );
        match self.client.query_one(&query, &[]).await {
            Ok(row) => Ok(Some(total_from_sum(row.get(0)))),
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a materialized view currently exists
    pub async fn matview_exists(&self, schema: &str, name: &str) -> RefreshResult<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT FROM pg_matviews
                     WHERE schemaname = $1 AND matviewname = $2
                 )",
                &[&schema, &name],
            )
            .await?;
        Ok(row.get(0))
    }

    pub async fn row_count(&self, schema: &str, name: &str) -> RefreshResult<i64> {
        let row = self
            .client
            .query_one(&format!("SELECT COUNT(*) FROM {}.{}", schema, name), &[])
            .await?;
        Ok(row.get(0))
    }
}

/// `SUM` over zero rows is SQL NULL; the relation exists, so its total is
/// zero, not an absent baseline.
fn total_from_sum(sum: Option<f64>) -> f64 {
    sum.unwrap_or(0.0)
}

fn session_settings_sql(refresh: &RefreshConfig) -> String {
    format!(
        "SET tcp_keepalives_idle = {};\n\
         SET tcp_keepalives_interval = {};\n\
         SET statement_timeout = '{}';",
        refresh.keepalive_idle_secs,
        refresh.keepalive_interval_secs,
        refresh.statement_timeout.as_millis(),
    )
}

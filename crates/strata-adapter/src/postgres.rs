//! PostgreSQL backend adapter
//!
//! Materialises models and runs tests against PostgreSQL (or Redshift, which
//! speaks the same protocol).
//!
//! ## Features
//!
//! Requires the `postgres` feature:
//!
//! ```toml
//! strata-adapter = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! ## Materializations
//!
//! - `view`: `create or replace view`
//! - `table`: build into a temporary relation, then swap it in
//! - `incremental`: `insert into` when the relation exists, otherwise a table
//!   build; `full_refresh` always rebuilds
//!
//! Tests run their compiled body and read the first column of the first row
//! as the failure count.
//!
//! ## Target settings
//!
//! Read from the target in `profiles.toml`: `host` (default `localhost`),
//! `port` (default 5432), `user`, `password`, `dbname` (falls back to the
//! target `database`), `sslmode` (`require` enables TLS).

use crate::adapter::{AdapterError, BackendAdapter, ExecutionOutcome, ExecutionRequest};
use strata_core::{Materialization, Relation, TargetConfig};

#[cfg(feature = "postgres")]
use std::collections::HashMap;

#[cfg(feature = "postgres")]
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(feature = "postgres")]
use tokio_postgres::{CancelToken, Client, NoTls};

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

/// PostgreSQL connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub tls: bool,
}

impl PostgresSettings {
    /// Read settings from a profile target
    pub fn from_target(target: &TargetConfig) -> Result<Self, AdapterError> {
        let port = match target.setting("port") {
            Some(port) => port
                .parse()
                .map_err(|_| AdapterError::ConfigError(format!("invalid port '{}'", port)))?,
            None => 5432,
        };
        let dbname = target
            .setting("dbname")
            .or_else(|| target.database.clone())
            .ok_or_else(|| AdapterError::ConfigError("target has no 'dbname' or 'database'".to_string()))?;
        let user = target
            .setting("user")
            .ok_or_else(|| AdapterError::ConfigError("target has no 'user'".to_string()))?;

        Ok(Self {
            host: target.setting("host").unwrap_or_else(|| "localhost".to_string()),
            port,
            dbname,
            user,
            password: target.setting("password"),
            tls: target.setting("sslmode").as_deref() == Some("require"),
        })
    }

    /// libpq-style connection string
    pub fn connection_string(&self) -> String {
        let mut config = format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.dbname, self.user
        );
        if let Some(password) = &self.password {
            config.push_str(&format!(" password={}", password));
        }
        config
    }
}

/// Open PostgreSQL connection
pub struct PostgresConnection {
    #[cfg(feature = "postgres")]
    client: Client,
}

/// PostgreSQL backend adapter
pub struct PostgresAdapter {
    settings: PostgresSettings,

    /// Cancel tokens of in-flight executions, by node id
    #[cfg(feature = "postgres")]
    cancel_tokens: Mutex<HashMap<String, CancelToken>>,
}

impl PostgresAdapter {
    pub fn new(settings: PostgresSettings) -> Self {
        Self {
            settings,
            #[cfg(feature = "postgres")]
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create an adapter from a profile target
    pub fn from_target(target: &TargetConfig) -> Result<Self, AdapterError> {
        Ok(Self::new(PostgresSettings::from_target(target)?))
    }

    pub fn settings(&self) -> &PostgresSettings {
        &self.settings
    }

    #[cfg(feature = "postgres")]
    fn cancel_tokens(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        self.cancel_tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(feature = "postgres")]
    fn tls_connector(&self) -> Result<MakeTlsConnector, AdapterError> {
        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| AdapterError::ConfigError(format!("Failed to create TLS connector: {}", e)))?;
        Ok(MakeTlsConnector::new(connector))
    }

    #[cfg(feature = "postgres")]
    async fn run(&self, client: &Client, request: &ExecutionRequest) -> Result<ExecutionOutcome, AdapterError> {
        if request.is_test() {
            let row = client
                .query_one(request.compiled_body.as_str(), &[])
                .await
                .map_err(query_error)?;
            let failures: i64 = row
                .try_get(0)
                .map_err(|e| AdapterError::InvalidResponse(format!("test did not return a count: {}", e)))?;
            let failures = u64::try_from(failures).unwrap_or(0);
            return Ok(ExecutionOutcome::new(format!("SELECT {}", failures)).with_failures(failures));
        }

        let relation = request
            .relation
            .as_ref()
            .ok_or_else(|| AdapterError::ConfigError(format!("{} has no relation to build", request.unique_id)))?;

        let exists = if request.materialization() == Materialization::Incremental && !request.full_refresh {
            let row = client
                .query_one("select to_regclass($1) is not null", &[&quote_relation(relation)])
                .await
                .map_err(query_error)?;
            row.try_get::<_, bool>(0).map_err(|e| AdapterError::InvalidResponse(e.to_string()))?
        } else {
            false
        };

        let plan = build_plan(request, relation, exists)?;
        client
            .batch_execute(&format!("create schema if not exists {}", quote_schema(relation)))
            .await
            .map_err(query_error)?;
        client.batch_execute("begin").await.map_err(query_error)?;

        let mut rows = 0;
        for statement in &plan.statements {
            match client.execute(statement.as_str(), &[]).await {
                Ok(affected) => rows += affected,
                Err(e) => {
                    // Leave the session usable for the next node
                    let _ = client.batch_execute("rollback").await;
                    return Err(query_error(e));
                }
            }
        }
        client.batch_execute("commit").await.map_err(query_error)?;

        Ok(ExecutionOutcome::new(plan.message).with_rows(rows))
    }
}

#[cfg(feature = "postgres")]
fn query_error(error: tokio_postgres::Error) -> AdapterError {
    match error.as_db_error() {
        Some(db) => AdapterError::ExecutionError(format!("{} ({})", db.message(), db.code().code())),
        None if error.is_closed() => AdapterError::ConnectionError(error.to_string()),
        None => AdapterError::ExecutionError(error.to_string()),
    }
}

/// Statements that materialise one model, run inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializationPlan {
    pub statements: Vec<String>,
    pub message: &'static str,
}

/// Plan the statements for a model request
///
/// `exists` says whether an incremental model's relation is already built.
pub fn build_plan(
    request: &ExecutionRequest,
    relation: &Relation,
    exists: bool,
) -> Result<MaterializationPlan, AdapterError> {
    let target = quote_relation(relation);
    let body = request.compiled_body.trim().trim_end_matches(';');

    let plan = match request.materialization() {
        Materialization::View => MaterializationPlan {
            statements: vec![format!("create or replace view {} as (\n{}\n)", target, body)],
            message: "CREATE VIEW",
        },
        Materialization::Incremental if exists && !request.full_refresh => MaterializationPlan {
            statements: vec![format!(
                "insert into {} (\n    select * from (\n{}\n    ) as strata_incremental\n)",
                target, body
            )],
            message: "INSERT",
        },
        Materialization::Table | Materialization::Incremental => {
            let temp = Relation::new(
                relation.database.clone(),
                relation.schema.clone(),
                format!("{}__strata_tmp", relation.identifier),
            );
            let temp_name = quote_relation(&temp);
            MaterializationPlan {
                statements: vec![
                    format!("drop table if exists {} cascade", temp_name),
                    format!("create table {} as (\n{}\n)", temp_name, body),
                    format!("drop table if exists {} cascade", target),
                    format!("alter table {} rename to {}", temp_name, quote_ident(&relation.identifier)),
                ],
                message: "CREATE TABLE",
            }
        }
        Materialization::Ephemeral => {
            return Err(AdapterError::ConfigError(format!(
                "{} is ephemeral and cannot be executed",
                request.unique_id
            )))
        }
    };
    Ok(plan)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_schema(relation: &Relation) -> String {
    quote_ident(&relation.schema)
}

fn quote_relation(relation: &Relation) -> String {
    // The connection already selects the database
    format!("{}.{}", quote_ident(&relation.schema), quote_ident(&relation.identifier))
}

#[async_trait::async_trait]
impl BackendAdapter for PostgresAdapter {
    type Connection = PostgresConnection;

    fn name(&self) -> &'static str {
        "postgres"
    }

    #[cfg(feature = "postgres")]
    async fn open(&self) -> Result<PostgresConnection, AdapterError> {
        let config = self.settings.connection_string();
        let host = self.settings.host.clone();
        let port = self.settings.port;

        let client = if self.settings.tls {
            let (client, connection) = tokio_postgres::connect(&config, self.tls_connector()?)
                .await
                .map_err(|e| {
                    AdapterError::ConnectionError(format!(
                        "Failed to connect to PostgreSQL at {}:{} with TLS: {}",
                        host, port, e
                    ))
                })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(host = %host, port, error = %e, "PostgreSQL TLS connection error");
                }
            });
            client
        } else {
            let (client, connection) = tokio_postgres::connect(&config, NoTls).await.map_err(|e| {
                AdapterError::ConnectionError(format!("Failed to connect to PostgreSQL at {}:{}: {}", host, port, e))
            })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(host = %host, port, error = %e, "PostgreSQL connection error");
                }
            });
            client
        };

        Ok(PostgresConnection { client })
    }

    #[cfg(not(feature = "postgres"))]
    async fn open(&self) -> Result<PostgresConnection, AdapterError> {
        Err(AdapterError::ConfigError(
            "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres".to_string(),
        ))
    }

    #[cfg(feature = "postgres")]
    async fn execute(
        &self,
        connection: &mut PostgresConnection,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, AdapterError> {
        self.cancel_tokens()
            .insert(request.unique_id.clone(), connection.client.cancel_token());
        let result = self.run(&connection.client, request).await;
        self.cancel_tokens().remove(&request.unique_id);
        result
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute(
        &self,
        _connection: &mut PostgresConnection,
        _request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, AdapterError> {
        Err(AdapterError::ConfigError(
            "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres".to_string(),
        ))
    }

    async fn close(&self, connection: PostgresConnection) -> Result<(), AdapterError> {
        // Dropping the client ends the spawned connection task
        drop(connection);
        Ok(())
    }

    #[cfg(feature = "postgres")]
    async fn abort(&self, unique_id: &str) -> Result<(), AdapterError> {
        let token = self.cancel_tokens().remove(unique_id);
        let Some(token) = token else {
            return Ok(());
        };
        tracing::debug!(node = unique_id, "cancelling PostgreSQL query");

        let result = if self.settings.tls {
            token.cancel_query(self.tls_connector()?).await
        } else {
            token.cancel_query(NoTls).await
        };
        result.map_err(|e| AdapterError::ConnectionError(format!("Failed to cancel query: {}", e)))
    }
}

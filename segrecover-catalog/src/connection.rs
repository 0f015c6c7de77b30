//! Database connections
//!
//! Connections are opened per operation rather than pooled: recovery talks
//! to the coordinator a handful of times, and reconfiguration needs a fresh
//! session on every retry.

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Row};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Connection to {target} timed out after {secs} seconds")]
    ConnectTimeout { target: String, secs: u64 },

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Invalid data: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbUrl {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: Option<String>,
    /// Connect with `gp_role=utility`, bypassing the dispatcher
    pub utility: bool,
    pub connect_timeout: Duration,
}

impl DbUrl {
    pub fn new(host: impl Into<String>, port: u16, dbname: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            dbname: dbname.into(),
            user: None,
            utility: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn utility(mut self) -> Self {
        self.utility = true;
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl fmt::Display for DbUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.dbname)?;
        if self.utility {
            write!(f, " (utility)")?;
        }
        Ok(())
    }
}

// =============================================================================
// TRAITS FOR DEPENDENCY INJECTION
// =============================================================================

/// An open session
#[async_trait::async_trait]
pub trait DbConnection: Send {
    /// Run a statement, discarding any rows. Returns rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a query and return every column rendered as text
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>>;

    /// Close the session
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens sessions
#[async_trait::async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self, url: &DbUrl) -> Result<Box<dyn DbConnection>>;
}

/// Connect, run one statement, close
pub async fn run_statement(connector: &dyn DbConnector, url: &DbUrl, sql: &str) -> Result<()> {
    let mut conn = connector.connect(url).await?;
    let outcome = conn.execute(sql).await;
    let closed = conn.close().await;
    outcome?;
    closed
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

/// sqlx-backed connector
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    pub application_name: Option<String>,
}

impl PgConnector {
    pub fn new() -> Self {
        Self {
            application_name: Some("segrecover".to_string()),
        }
    }

    fn options(&self, url: &DbUrl) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&url.host)
            .port(url.port)
            .database(&url.dbname);
        if let Some(user) = &url.user {
            options = options.username(user);
        }
        if let Some(name) = &self.application_name {
            options = options.application_name(name);
        }
        if url.utility {
            options = options.options([("gp_role", "utility")]);
        }
        options
    }
}

#[async_trait::async_trait]
impl DbConnector for PgConnector {
    #[instrument(skip(self, url), fields(target = %url))]
    async fn connect(&self, url: &DbUrl) -> Result<Box<dyn DbConnection>> {
        let options = self.options(url);
        let conn = tokio::time::timeout(url.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| DbError::ConnectTimeout {
                target: url.to_string(),
                secs: url.connect_timeout.as_secs(),
            })??;
        debug!("Connected");
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait::async_trait]
impl DbConnection for PgSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        // A bare &str runs over the simple query protocol
        let done = Executor::execute(&mut self.conn, sql).await?;
        Ok(done.rows_affected())
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let rows = Executor::fetch_all(&mut self.conn, sql).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                // Simple-protocol results arrive in text format
                values.push(row.try_get_unchecked::<Option<String>, _>(idx)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

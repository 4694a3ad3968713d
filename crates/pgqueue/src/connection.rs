//! One database connection bound to one open transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;

use crate::error::TransportError;

/// Lifecycle of a [`PostgresConnection`]. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Committed,
    RolledBack,
}

/// Wraps a pooled connection together with the transaction every command
/// issued through it is enlisted in.
///
/// Call [`complete`](Self::complete) to commit and [`dispose`](Self::dispose)
/// to release. Disposing without completing rolls the transaction back. A unit
/// dropped without either is rolled back by sqlx when the connection returns
/// to the pool.
pub struct PostgresConnection {
    transaction: Option<Transaction<'static, Postgres>>,
    backend_pid: i32,
    state: ConnectionState,
    disposed: bool,
}

impl PostgresConnection {
    pub fn new(transaction: Transaction<'static, Postgres>, backend_pid: i32) -> Self {
        Self {
            transaction: Some(transaction),
            backend_pid,
            state: ConnectionState::Open,
            disposed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server process serving this connection, as reported by `pg_backend_pid()`.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Executor enlisted in the held transaction.
    pub fn create_command(&mut self) -> Result<&mut PgConnection, TransportError> {
        match (self.state, self.transaction.as_deref_mut()) {
            (ConnectionState::Open, Some(connection)) => Ok(connection),
            (state, _) => Err(TransportError::Persistence {
                reason: format!("cannot create a command on a connection in state {state:?}"),
                source: None,
            }),
        }
    }

    /// Commit the transaction. Later calls are no-ops.
    pub async fn complete(&mut self) -> Result<(), TransportError> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };

        match transaction.commit().await {
            Ok(()) => {
                self.state = ConnectionState::Committed;
                Ok(())
            }
            Err(e) => {
                // The server aborts a transaction whose commit fails.
                self.state = ConnectionState::RolledBack;
                Err(TransportError::Persistence {
                    reason: format!("commit transaction failed: {e}"),
                    source: Some(Box::new(e)),
                })
            }
        }
    }

    /// Roll back unless committed, then release the connection. Rollback
    /// errors are logged and swallowed. Idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(transaction) = self.transaction.take() {
            if let Err(e) = transaction.rollback().await {
                tracing::debug!(error = %e, "rollback during dispose failed");
            }
            self.state = ConnectionState::RolledBack;
        }
    }
}

const BACKEND_PID_SQL: &str = "SELECT pg_backend_pid()";
const CANCEL_BACKEND_SQL: &str = "SELECT pg_cancel_backend($1)";

/// Hands out ready-to-use connection units.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connection(&self) -> Result<PostgresConnection, TransportError>;

    /// Ask the server to cancel the statement running on `backend_pid`,
    /// using a connection other than the one being cancelled.
    async fn cancel_backend(&self, backend_pid: i32) -> Result<(), TransportError>;
}

/// [`ConnectionProvider`] backed by a sqlx pool; every unit begins a fresh
/// transaction.
#[derive(Clone)]
pub struct PgConnectionProvider {
    pool: PgPool,
}

impl PgConnectionProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with up to `max_connections` connections.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, TransportError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| TransportError::Persistence {
                reason: format!("failed to connect to PostgreSQL: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    async fn connection(&self) -> Result<PostgresConnection, TransportError> {
        let mut transaction = self
            .pool
            .begin()
            .await
            .map_err(|e| TransportError::Persistence {
                reason: format!("begin transaction failed: {e}"),
                source: Some(Box::new(e)),
            })?;
        let backend_pid: i32 = sqlx::query_scalar(BACKEND_PID_SQL)
            .fetch_one(&mut *transaction)
            .await
            .map_err(|e| TransportError::Command {
                sql: BACKEND_PID_SQL.to_string(),
                source: e,
            })?;
        Ok(PostgresConnection::new(transaction, backend_pid))
    }

    async fn cancel_backend(&self, backend_pid: i32) -> Result<(), TransportError> {
        let signalled: bool = sqlx::query_scalar(CANCEL_BACKEND_SQL)
            .bind(backend_pid)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TransportError::Command {
                sql: CANCEL_BACKEND_SQL.to_string(),
                source: e,
            })?;
        if !signalled {
            tracing::debug!(backend_pid, "no backend to cancel");
        }
        Ok(())
    }
}

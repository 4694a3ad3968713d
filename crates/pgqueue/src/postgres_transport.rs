//! PostgreSQL table-backed queue transport.
//!
//! All queues share one table. A row is addressed to a queue by `recipient`
//! and is claimed by deleting it: the claim query locks the first claimable
//! row with `FOR UPDATE SKIP LOCKED` and returns it from a `DELETE ...
//! RETURNING`, so concurrent receivers never see the same row. The claim is
//! undone if the caller's transaction rolls back.
//!
//! Visibility and expiration are computed from `clock_timestamp()` on the
//! server, so transports on hosts with skewed clocks agree on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::clock::{Clock, SystemClock};
use crate::config::TransportConfig;
use crate::connection::{ConnectionProvider, PgConnectionProvider, PostgresConnection};
use crate::error::TransportError;
use crate::header_serializer::{HeaderSerializer, JsonHeaderSerializer};
use crate::message::{
    message_priority, take_initial_visibility_delay, ttl_seconds, TransportMessage,
};
use crate::periodic_task::PeriodicTask;
use crate::schema::{self, TableName};
use crate::transaction_context::TransactionContext;
use crate::transport::Transport;

/// Context key under which the per-unit-of-work connection is cached.
pub const CURRENT_CONNECTION_KEY: &str = "postgresql-transport-current-connection";

/// SQLSTATE reported when a running statement is cancelled.
const QUERY_CANCELED_SQLSTATE: &str = "57014";

const CLEANUP_TASK_NAME: &str = "ExpiredMessagesCleanup";

type SharedConnection = Arc<Mutex<PostgresConnection>>;

/// Queue transport storing messages in a PostgreSQL table.
pub struct PostgresTransport {
    inner: Arc<TransportInner>,
    header_serializer: Arc<dyn HeaderSerializer>,
    clock: Arc<dyn Clock>,
    /// Sends are serialized to keep lock contention on the insert path low.
    send_gate: Semaphore,
    /// Bounds concurrent polling against the table.
    receive_gate: Semaphore,
    insert_sql: String,
    receive_sql: String,
    cleanup_task: PeriodicTask,
    shut_down: AtomicBool,
}

/// State shared with the background cleanup task.
struct TransportInner {
    provider: Arc<dyn ConnectionProvider>,
    table: TableName,
    input_queue_name: Option<String>,
    delete_expired_sql: String,
}

impl PostgresTransport {
    /// Create a transport with JSON headers and the system clock.
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        Self::with_collaborators(
            provider,
            config,
            Arc::new(JsonHeaderSerializer),
            Arc::new(SystemClock),
        )
    }

    /// Connect a pool of `config.max_connections` to `url` and create a transport on it.
    pub async fn connect(url: &str, config: TransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let provider = PgConnectionProvider::connect(url, config.max_connections).await?;
        Self::new(Arc::new(provider), config)
    }

    pub fn with_collaborators(
        provider: Arc<dyn ConnectionProvider>,
        config: TransportConfig,
        header_serializer: Arc<dyn HeaderSerializer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let table = TableName::parse(&config.table_name)?;

        let inner = Arc::new(TransportInner {
            provider,
            delete_expired_sql: schema::delete_expired_sql(
                &table,
                config.expired_messages_cleanup_batch_size,
            ),
            table,
            input_queue_name: config.input_queue_name,
        });

        let weak: Weak<TransportInner> = Arc::downgrade(&inner);
        let cleanup_task = PeriodicTask::new(
            CLEANUP_TASK_NAME,
            config.expired_messages_cleanup_interval,
            move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.perform_expired_messages_cleanup().await.map(|_| ()),
                        None => Ok(()),
                    }
                })
            },
        );

        Ok(Self {
            insert_sql: schema::insert_sql(&inner.table),
            receive_sql: schema::receive_sql(&inner.table),
            inner,
            header_serializer,
            clock,
            send_gate: Semaphore::new(config.send_concurrency),
            receive_gate: Semaphore::new(config.receive_concurrency),
            cleanup_task,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the expired message cleanup. Send-only transports have nothing
    /// to clean up and start nothing.
    pub fn initialize(&self) {
        if self.inner.input_queue_name.is_none() {
            return;
        }
        self.cleanup_task.start();
    }

    /// Stop the cleanup task and refuse further sends and receives. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send_gate.close();
        self.receive_gate.close();
        self.cleanup_task.stop().await;
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_task.is_running()
    }

    /// Delete every expired message addressed to this transport's queue.
    /// Returns the number of rows deleted.
    pub async fn perform_expired_messages_cleanup(&self) -> Result<u64, TransportError> {
        self.inner.perform_expired_messages_cleanup().await
    }

    /// Create the messages table and its receive index unless a table with
    /// the configured name already exists.
    pub async fn ensure_table_is_created(&self) -> Result<(), TransportError> {
        self.create_schema()
            .await
            .map_err(|e| TransportError::SchemaInitialization {
                table: self.inner.table.to_string(),
                source: Box::new(e),
            })
    }

    async fn create_schema(&self) -> Result<(), TransportError> {
        let mut connection = self.inner.provider.connection().await?;
        let result = self.create_schema_in(&mut connection).await;
        connection.dispose().await;
        result
    }

    async fn create_schema_in(
        &self,
        connection: &mut PostgresConnection,
    ) -> Result<(), TransportError> {
        let table = &self.inner.table;

        let rows = sqlx::query(schema::LIST_TABLES_SQL)
            .fetch_all(connection.create_command()?)
            .await
            .map_err(|e| command_error(schema::LIST_TABLES_SQL, e))?;

        for row in &rows {
            let table_schema: String = try_get_column(row, "table_schema")?;
            let table_name: String = try_get_column(row, "table_name")?;
            let current_schema: Option<String> = try_get_column(row, "current_schema")?;
            if table.matches(
                &table_schema,
                &table_name,
                current_schema.as_deref().unwrap_or_default(),
            ) {
                tracing::info!(
                    table = %table,
                    "database already contains a table named {table} - will not create anything"
                );
                return Ok(());
            }
        }

        tracing::info!(table = %table, "table {table} does not exist - it will be created now");

        for statement in schema::create_schema_sql(table) {
            sqlx::query(&statement)
                .execute(connection.create_command()?)
                .await
                .map_err(|e| command_error(&statement, e))?;
        }

        connection.complete().await
    }

    /// The connection enlisted in `context`, created and hooked up to the
    /// context's commit and dispose on first use.
    async fn connection(
        &self,
        context: &TransactionContext,
    ) -> Result<SharedConnection, TransportError> {
        context
            .get_or_add(CURRENT_CONNECTION_KEY, || async move {
                let connection: SharedConnection =
                    Arc::new(Mutex::new(self.inner.provider.connection().await?));

                let committed = Arc::clone(&connection);
                context.on_committed(move || async move { committed.lock().await.complete().await });

                let disposed = Arc::clone(&connection);
                context.on_disposed(move || async move { disposed.lock().await.dispose().await });

                Ok(connection)
            })
            .await
    }
}

#[async_trait]
impl Transport for PostgresTransport {
    /// Every recipient name is valid at send time, so there is nothing to create.
    fn create_queue(&self, address: &str) {
        tracing::debug!(address, "create_queue is a no-op for the PostgreSQL transport");
    }

    async fn send(
        &self,
        destination: &str,
        message: &TransportMessage,
        context: &TransactionContext,
    ) -> Result<(), TransportError> {
        if destination.is_empty() {
            return Err(TransportError::InvalidDestination);
        }

        let _permit = self
            .send_gate
            .acquire()
            .await
            .map_err(|_| TransportError::ShutDown)?;

        let mut headers = message.headers.clone();
        let priority = message_priority(&headers)?;
        let visibility_delay = take_initial_visibility_delay(&mut headers, self.clock.now())?;
        let ttl = ttl_seconds(&headers)?;
        // Last: the deferred-until header has been consumed above.
        let serialized_headers = self.header_serializer.serialize(&headers)?;

        let connection = self.connection(context).await?;
        let mut connection = connection.lock().await;

        sqlx::query(&self.insert_sql)
            .bind(destination)
            .bind(&serialized_headers)
            .bind(&message.body)
            .bind(priority)
            .bind(visibility_delay as f64)
            .bind(f64::from(ttl))
            .execute(connection.create_command()?)
            .await
            .map_err(|e| command_error(&self.insert_sql, e))?;

        Ok(())
    }

    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let recipient = self
            .inner
            .input_queue_name
            .as_deref()
            .ok_or(TransportError::NoInputQueue)?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            permit = self.receive_gate.acquire() => permit.map_err(|_| TransportError::ShutDown)?,
        };

        let connection = self.connection(context).await?;
        let mut connection = connection.lock().await;
        let backend_pid = connection.backend_pid();
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let claim = sqlx::query(&self.receive_sql)
            .bind(recipient)
            .fetch_optional(connection.create_command()?);
        tokio::pin!(claim);

        let claimed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            row = &mut claim => Some(row),
        };

        let row = match claimed {
            Some(row) => row.map_err(|e| command_error(&self.receive_sql, e))?,
            None => {
                // Stop the statement on the server, then let it report back so
                // the connection is idle again before the unit of work ends.
                if let Err(e) = self.inner.provider.cancel_backend(backend_pid).await {
                    tracing::warn!(backend_pid, error = %e, "failed to cancel receive statement");
                    return Err(TransportError::Cancelled);
                }
                match claim.await {
                    // Claimed before the cancel reached the server.
                    Ok(Some(row)) => Some(row),
                    Ok(None) => return Err(TransportError::Cancelled),
                    Err(e) => return Err(command_error(&self.receive_sql, e)),
                }
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let headers: Vec<u8> = try_get_column(&row, "headers")?;
        let body: Vec<u8> = try_get_column(&row, "body")?;
        let headers = self.header_serializer.deserialize(&headers)?;

        Ok(Some(TransportMessage::new(headers, body)))
    }

    fn address(&self) -> Option<&str> {
        self.inner.input_queue_name.as_deref()
    }
}

impl TransportInner {
    /// Delete expired rows for the input queue, one short transaction per
    /// statement, until a statement deletes nothing.
    #[instrument(skip(self), fields(table = %self.table))]
    async fn perform_expired_messages_cleanup(&self) -> Result<u64, TransportError> {
        let Some(recipient) = self.input_queue_name.as_deref() else {
            return Ok(0);
        };

        let started = Instant::now();
        let mut total = 0u64;

        loop {
            let mut connection = self.provider.connection().await?;
            let result = self.delete_expired_batch(&mut connection, recipient).await;
            connection.dispose().await;

            let deleted = result?;
            total += deleted;
            if deleted == 0 {
                break;
            }
        }

        if total > 0 {
            tracing::info!(
                recipient,
                deleted = total,
                elapsed = ?started.elapsed(),
                "performed expired messages cleanup"
            );
        }

        Ok(total)
    }

    async fn delete_expired_batch(
        &self,
        connection: &mut PostgresConnection,
        recipient: &str,
    ) -> Result<u64, TransportError> {
        let result = sqlx::query(&self.delete_expired_sql)
            .bind(recipient)
            .execute(connection.create_command()?)
            .await
            .map_err(|e| command_error(&self.delete_expired_sql, e))?;
        connection.complete().await?;
        Ok(result.rows_affected())
    }
}

/// Wrap a statement failure, turning server-side cancellation into
/// [`TransportError::Cancelled`].
fn command_error(sql: &str, error: sqlx::Error) -> TransportError {
    if is_query_canceled(&error) {
        return TransportError::Cancelled;
    }
    TransportError::Command {
        sql: sql.trim().to_string(),
        source: error,
    }
}

fn is_query_canceled(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(QUERY_CANCELED_SQLSTATE),
        _ => false,
    }
}

fn try_get_column<'r, T>(row: &'r PgRow, column: &str) -> Result<T, TransportError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| TransportError::Persistence {
            reason: format!("failed to read '{column}' column: {e}"),
            source: Some(Box::new(e)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct FakeDbError {
        code: &'static str,
    }

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake database error {}", self.code)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            "fake database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    /// Provider for tests that never reach the database.
    struct UnreachableProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ConnectionProvider for UnreachableProvider {
        async fn connection(&self) -> Result<PostgresConnection, TransportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(TransportError::Persistence {
                reason: "database unreachable".into(),
                source: None,
            })
        }

        async fn cancel_backend(&self, _backend_pid: i32) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn transport(config: TransportConfig) -> (PostgresTransport, Arc<UnreachableProvider>) {
        let provider = Arc::new(UnreachableProvider {
            calls: AtomicU32::new(0),
        });
        let transport = PostgresTransport::new(provider.clone(), config).unwrap();
        (transport, provider)
    }

    #[test]
    fn query_canceled_becomes_cancellation() {
        let err = command_error(
            "SELECT 1",
            sqlx::Error::Database(Box::new(FakeDbError { code: "57014" })),
        );
        assert!(err.is_cancellation());
    }

    #[test]
    fn other_faults_keep_statement_text() {
        let err = command_error(
            "\n  SELECT 1\n",
            sqlx::Error::Database(Box::new(FakeDbError { code: "23505" })),
        );
        match err {
            TransportError::Command { sql, .. } => assert_eq!(sql, "SELECT 1"),
            other => panic!("expected command error, got {other:?}"),
        }

        let err = command_error("SELECT 1", sqlx::Error::PoolTimedOut);
        assert!(!err.is_cancellation());
    }

    #[test]
    fn invalid_config_fails_construction() {
        let provider = Arc::new(UnreachableProvider {
            calls: AtomicU32::new(0),
        });
        let result = PostgresTransport::new(provider, TransportConfig::new("bad name"));
        assert!(matches!(result, Err(TransportError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn address_is_input_queue() {
        let (with_queue, _) = transport(TransportConfig::default().with_input_queue("queueA"));
        assert_eq!(with_queue.address(), Some("queueA"));

        let (send_only, _) = transport(TransportConfig::default());
        assert_eq!(send_only.address(), None);
    }

    #[tokio::test]
    async fn send_only_transport_cannot_receive() {
        let (transport, provider) = transport(TransportConfig::default());
        let ctx = TransactionContext::new();
        let err = transport
            .receive(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoInputQueue));
        assert_eq!(provider.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn receive_with_cancelled_token_is_cancelled() {
        let (transport, provider) = transport(TransportConfig::default().with_input_queue("q"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .receive(&TransactionContext::new(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(provider.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn send_rejects_empty_destination() {
        let (transport, _) = transport(TransportConfig::default());
        let err = transport
            .send("", &TransportMessage::default(), &TransactionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidDestination));
    }

    #[tokio::test]
    async fn malformed_priority_fails_before_connecting() {
        let (transport, provider) = transport(TransportConfig::default());
        let message = TransportMessage::new(
            [(
                crate::message::MESSAGE_PRIORITY_HEADER_KEY.to_string(),
                "urgent".to_string(),
            )]
            .into(),
            b"hello".to_vec(),
        );

        let err = transport
            .send("queueA", &message, &TransactionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Format { .. }));
        assert_eq!(provider.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn connection_failure_propagates_from_send() {
        let (transport, provider) = transport(TransportConfig::default());
        let ctx = TransactionContext::new();
        let err = transport
            .send("queueA", &TransportMessage::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Persistence { .. }));
        assert_eq!(provider.calls.load(Ordering::Relaxed), 1);
        assert!(!ctx.contains_key(CURRENT_CONNECTION_KEY));
    }

    #[tokio::test]
    async fn shutdown_refuses_further_operations() {
        let (transport, _) = transport(TransportConfig::default().with_input_queue("q"));
        transport.shutdown().await;
        transport.shutdown().await;

        let ctx = TransactionContext::new();
        let err = transport
            .send("queueA", &TransportMessage::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ShutDown));

        let err = transport
            .receive(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ShutDown));
    }

    #[tokio::test]
    async fn initialize_starts_cleanup_only_with_input_queue() {
        let (send_only, _) = transport(TransportConfig::default());
        send_only.initialize();
        assert!(!send_only.is_cleanup_running());

        let (receiving, _) = transport(TransportConfig::default().with_input_queue("q"));
        receiving.initialize();
        assert!(receiving.is_cleanup_running());
        receiving.shutdown().await;
        assert!(!receiving.is_cleanup_running());
    }

    #[tokio::test]
    async fn cleanup_without_input_queue_deletes_nothing() {
        let (transport, provider) = transport(TransportConfig::default());
        assert_eq!(transport.perform_expired_messages_cleanup().await.unwrap(), 0);
        assert_eq!(provider.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn schema_failure_names_the_table() {
        let (transport, _) = transport(TransportConfig::new("bus_messages"));
        let err = transport.ensure_table_is_created().await.unwrap_err();
        match err {
            TransportError::SchemaInitialization { table, .. } => assert_eq!(table, "bus_messages"),
            other => panic!("expected schema error, got {other:?}"),
        }
    }
}

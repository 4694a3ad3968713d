use crate::error::TransportError;
use crate::schema;
use std::time::Duration;

/// Default interval between expired message cleanup cycles.
pub const DEFAULT_EXPIRED_MESSAGES_CLEANUP_INTERVAL: Duration = Duration::from_secs(20);

/// Configuration for the PostgreSQL transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Name of the messages table. May be schema-qualified (`schema.table`).
    /// Default: "messages".
    pub table_name: String,
    /// Queue this transport receives from. `None` makes a send-only transport.
    pub input_queue_name: Option<String>,
    /// How often expired messages for the input queue are deleted. Default: 20s.
    pub expired_messages_cleanup_interval: Duration,
    /// Maximum rows deleted per cleanup statement. `None` deletes every
    /// expired row in one statement. Default: None.
    pub expired_messages_cleanup_batch_size: Option<u32>,
    /// Maximum number of concurrent sends. Default: 1.
    pub send_concurrency: usize,
    /// Maximum number of concurrent receives. Default: 20.
    pub receive_concurrency: usize,
    /// Pool size used by [`PgConnectionProvider::connect`](crate::connection::PgConnectionProvider::connect).
    /// Default: 10.
    pub max_connections: u32,
}

impl TransportConfig {
    /// Create a configuration for the given table with all other values defaulted.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    /// Set the queue this transport receives from.
    pub fn with_input_queue(mut self, input_queue_name: impl Into<String>) -> Self {
        self.input_queue_name = Some(input_queue_name.into());
        self
    }

    /// Set the expired message cleanup interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.expired_messages_cleanup_interval = interval;
        self
    }

    /// Validate configuration values.
    ///
    /// Checks:
    /// - `table_name` is a plain (optionally schema-qualified) SQL identifier
    /// - `input_queue_name`, when set, is not empty
    /// - concurrency limits, pool size and cleanup batch size are >= 1
    /// - `expired_messages_cleanup_interval > 0`
    pub fn validate(&self) -> Result<(), TransportError> {
        schema::validate_table_name(&self.table_name)?;
        if matches!(&self.input_queue_name, Some(name) if name.is_empty()) {
            return Err(TransportError::InvalidConfig {
                reason: "input_queue_name must not be empty when set".to_string(),
            });
        }
        if self.expired_messages_cleanup_interval.is_zero() {
            return Err(TransportError::InvalidConfig {
                reason: "expired_messages_cleanup_interval must be > 0".to_string(),
            });
        }
        if self.expired_messages_cleanup_batch_size == Some(0) {
            return Err(TransportError::InvalidConfig {
                reason: "expired_messages_cleanup_batch_size must be >= 1 when set".to_string(),
            });
        }
        if self.send_concurrency == 0 {
            return Err(TransportError::InvalidConfig {
                reason: "send_concurrency must be >= 1".to_string(),
            });
        }
        if self.receive_concurrency == 0 {
            return Err(TransportError::InvalidConfig {
                reason: "receive_concurrency must be >= 1".to_string(),
            });
        }
        if self.max_connections == 0 {
            return Err(TransportError::InvalidConfig {
                reason: "max_connections must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            table_name: "messages".to_string(),
            input_queue_name: None,
            expired_messages_cleanup_interval: DEFAULT_EXPIRED_MESSAGES_CLEANUP_INTERVAL,
            expired_messages_cleanup_batch_size: None,
            send_concurrency: 1,
            receive_concurrency: 20,
            max_connections: 10,
        }
    }
}

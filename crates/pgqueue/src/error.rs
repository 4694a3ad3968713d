/// Errors that can occur in the PostgreSQL transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("destination address must not be empty")]
    InvalidDestination,

    #[error("transport has no input queue and cannot receive")]
    NoInputQueue,

    #[error("format error: {reason}")]
    Format {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("error attempting to initialize SQL transport schema with messages table {table}")]
    SchemaInitialization {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("error executing SQL command\n{sql}")]
    Command {
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("persistence error: {reason}")]
    Persistence {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("header serialization error: {reason}")]
    Serialization {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("receive operation was cancelled")]
    Cancelled,

    #[error("transport is shut down")]
    ShutDown,
}

impl TransportError {
    /// Whether this error represents a cancelled operation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = TransportError::InvalidConfig {
            reason: "table_name must not be empty".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: table_name must not be empty"
        );

        let err = TransportError::Format {
            reason: "could not parse 'abc' into an i32".into(),
            source: None,
        };
        assert_eq!(
            err.to_string(),
            "format error: could not parse 'abc' into an i32"
        );

        let err = TransportError::Command {
            sql: "SELECT 1".into(),
            source: sqlx::Error::RowNotFound,
        };
        assert_eq!(err.to_string(), "error executing SQL command\nSELECT 1");
    }

    #[test]
    fn schema_error_names_table() {
        let err = TransportError::SchemaInitialization {
            table: "messages".into(),
            source: Box::new(sqlx::Error::PoolClosed),
        };
        assert!(err.to_string().contains("messages"));
    }

    #[test]
    fn only_cancelled_is_cancellation() {
        assert!(TransportError::Cancelled.is_cancellation());
        assert!(!TransportError::NoInputQueue.is_cancellation());
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransportError>();
    }
}

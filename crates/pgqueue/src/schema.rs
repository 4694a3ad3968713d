//! Table layout and statement text for the messages table.
//!
//! Table and index names are interpolated into SQL, so [`TableName`] only
//! accepts plain identifiers. Everything else is bound as a parameter.

use std::fmt;

use crate::error::TransportError;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

/// A validated, optionally schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    /// Parse `table` or `schema.table`.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let mut parts = raw.split('.');
        let (schema, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => (None, name),
            (Some(schema), Some(name), None) => (Some(schema), name),
            _ => {
                return Err(TransportError::InvalidConfig {
                    reason: format!("table_name '{raw}' has too many '.'-separated parts"),
                })
            }
        };
        if let Some(schema) = schema {
            validate_identifier(raw, schema)?;
        }
        validate_identifier(raw, name)?;
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Schema part, if the name was qualified.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Unqualified table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the receive index. Indexes always live in their table's schema,
    /// so this is never qualified.
    pub fn receive_index_name(&self) -> String {
        format!("idx_receive_{}", self.name)
    }

    /// Whether `(schema, table)` from the catalog refers to this table.
    ///
    /// Names compare case-insensitively. An unqualified name matches only
    /// tables in `current_schema`.
    pub fn matches(&self, table_schema: &str, table_name: &str, current_schema: &str) -> bool {
        let wanted_schema = self.schema.as_deref().unwrap_or(current_schema);
        wanted_schema.eq_ignore_ascii_case(table_schema)
            && self.name.eq_ignore_ascii_case(table_name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn validate_identifier(raw: &str, ident: &str) -> Result<(), TransportError> {
    let mut chars = ident.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest {
        return Err(TransportError::InvalidConfig {
            reason: format!(
                "table_name '{raw}' must consist of identifiers matching [A-Za-z_][A-Za-z0-9_]*"
            ),
        });
    }
    // The receive index prefixes the table name, so leave room for it.
    if ident.len() + "idx_receive_".len() > MAX_IDENTIFIER_LEN {
        return Err(TransportError::InvalidConfig {
            reason: format!("table_name '{raw}' is too long"),
        });
    }
    Ok(())
}

/// Validate a configured table name.
pub fn validate_table_name(raw: &str) -> Result<(), TransportError> {
    TableName::parse(raw).map(|_| ())
}

/// Lists user tables together with the session's current schema.
pub const LIST_TABLES_SQL: &str = r#"
SELECT table_schema::text AS table_schema,
       table_name::text AS table_name,
       current_schema()::text AS current_schema
FROM information_schema.tables
WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
"#;

/// DDL statements creating the table and its receive index, in execution order.
pub fn create_schema_sql(table: &TableName) -> Vec<String> {
    vec![
        format!(
            r#"
CREATE TABLE {table}
(
    id bigserial NOT NULL,
    recipient text NOT NULL,
    priority int NOT NULL,
    expiration timestamp with time zone NOT NULL,
    visible timestamp with time zone NOT NULL,
    headers bytea NOT NULL,
    body bytea NOT NULL,
    PRIMARY KEY (recipient, priority, id)
)
"#
        ),
        format!(
            r#"
CREATE INDEX {index} ON {table}
(
    recipient ASC,
    visible ASC,
    expiration ASC
)
"#,
            index = table.receive_index_name()
        ),
    ]
}

/// Insert statement. Parameters: recipient, headers, body, priority,
/// visibility delay seconds, time-to-live seconds.
pub fn insert_sql(table: &TableName) -> String {
    format!(
        r#"
INSERT INTO {table}
    (recipient, headers, body, priority, visible, expiration)
VALUES
    ($1, $2, $3, $4,
     clock_timestamp() + make_interval(secs => $5::double precision),
     clock_timestamp() + make_interval(secs => $6::double precision))
"#
    )
}

/// Claim-and-delete statement. Parameter: recipient.
pub fn receive_sql(table: &TableName) -> String {
    format!(
        r#"
DELETE FROM {table}
WHERE recipient = $1
  AND id =
(
    SELECT id FROM {table}
    WHERE recipient = $1
      AND visible < clock_timestamp()
      AND expiration > clock_timestamp()
    ORDER BY priority ASC, id ASC
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
RETURNING id, headers, body
"#
    )
}

/// Expired row deletion. Parameter: recipient. With a batch size, each
/// statement removes at most that many rows.
pub fn delete_expired_sql(table: &TableName, batch_size: Option<u32>) -> String {
    match batch_size {
        None => format!(
            r#"
DELETE FROM {table}
WHERE recipient = $1
  AND expiration < clock_timestamp()
"#
        ),
        Some(limit) => format!(
            r#"
DELETE FROM {table}
WHERE ctid IN
(
    SELECT ctid FROM {table}
    WHERE recipient = $1
      AND expiration < clock_timestamp()
    LIMIT {limit}
)
"#
        ),
    }
}

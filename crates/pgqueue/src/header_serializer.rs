use std::collections::HashMap;

use crate::error::TransportError;

/// Converts a header map to and from the bytes stored in the `headers` column.
pub trait HeaderSerializer: Send + Sync {
    fn serialize(&self, headers: &HashMap<String, String>) -> Result<Vec<u8>, TransportError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<HashMap<String, String>, TransportError>;
}

/// Stores headers as a UTF-8 JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHeaderSerializer;

impl HeaderSerializer for JsonHeaderSerializer {
    fn serialize(&self, headers: &HashMap<String, String>) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(headers).map_err(|e| TransportError::Serialization {
            reason: format!("failed to serialize headers: {e}"),
            source: Some(Box::new(e)),
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<HashMap<String, String>, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Serialization {
            reason: format!("failed to deserialize headers: {e}"),
            source: Some(Box::new(e)),
        })
    }
}

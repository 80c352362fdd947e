//! Error types for the editor

use grove_crdt::{CrdtError, TreeId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditorError {
    #[error("Node not found: {0}")]
    NotFound(TreeId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("CRDT error: {0}")]
    Crdt(CrdtError),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<CrdtError> for EditorError {
    fn from(e: CrdtError) -> Self {
        match e {
            CrdtError::NodeNotFound(id) => EditorError::NotFound(id),
            CrdtError::InvalidOperation(message) => EditorError::InvalidOperation(message),
            CrdtError::InvalidId(id) => EditorError::Validation(format!("invalid node id: {}", id)),
            other => EditorError::Crdt(other),
        }
    }
}

impl From<serde_json::Error> for EditorError {
    fn from(e: serde_json::Error) -> Self {
        EditorError::Json(e.to_string())
    }
}

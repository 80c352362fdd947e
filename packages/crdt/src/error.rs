//! Error types for the replicated tree

use crate::TreeId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrdtError {
    #[error("Node not found: {0}")]
    NodeNotFound(TreeId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid node id: {0}")]
    InvalidId(String),

    #[error("Failed to decode: {0}")]
    Decode(String),

    #[error("Failed to encode: {0}")]
    Encode(String),

    #[error("Loro error: {0}")]
    Loro(String),
}

impl From<loro::LoroError> for CrdtError {
    fn from(e: loro::LoroError) -> Self {
        CrdtError::Loro(e.to_string())
    }
}

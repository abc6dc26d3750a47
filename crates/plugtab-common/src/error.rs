//! Error definitions for the plugtab bridge

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents errors that can occur on either side of the plugin bridge.
///
/// # Example
/// ```rust
/// use plugtab_common::PlugError;
///
/// fn example() -> plugtab_common::Result<()> {
///     Err(PlugError::UnknownTable(7))
/// }
///
/// match example() {
///     Ok(_) => println!("Success"),
///     Err(e) => println!("Error occurred: {e}"),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlugError {
    /// The plugin executable could not be started.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Version or cookie mismatch during the connect-time handshake.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The process boundary failed: broken pipe, unexpected exit, bad frame
    /// sizes. Fatal for every open cursor of the plugin.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame arrived that could not be decoded or was out of protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Initialize was called for a table index the plugin never registered.
    #[error("unknown table index {0}")]
    UnknownTable(usize),

    /// The table implementation rejected its user configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The plugin reported a failure while producing rows.
    #[error("query error: {0}")]
    Query(String),

    /// A buffered write batch was rejected by the plugin.
    #[error("write batch error: {0}")]
    WriteBatch(String),

    /// A write was attempted against a table that never declared the
    /// corresponding capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A required parameter column is missing from the statement, or the
    /// constraint set cannot be planned at all.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("type error: expected {expected}, got {actual}")]
    Type { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, PlugError>;

impl PlugError {
    /// Get a short error kind name, stable across the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            PlugError::Spawn(_) => "spawn_error",
            PlugError::Handshake(_) => "handshake_error",
            PlugError::Transport(_) => "transport_error",
            PlugError::Protocol(_) => "protocol_error",
            PlugError::UnknownTable(_) => "unknown_table",
            PlugError::Config(_) => "config_error",
            PlugError::Query(_) => "query_error",
            PlugError::WriteBatch(_) => "write_batch_error",
            PlugError::Unsupported(_) => "unsupported",
            PlugError::Constraint(_) => "constraint_violation",
            PlugError::Type { .. } => "type_error",
        }
    }

    /// Rebuild an error from its wire representation,
    /// see [`kind`](Self::kind).
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "spawn_error" => PlugError::Spawn(message),
            "handshake_error" => PlugError::Handshake(message),
            "transport_error" => PlugError::Transport(message),
            "protocol_error" => PlugError::Protocol(message),
            "unknown_table" => PlugError::UnknownTable(
                message.parse().unwrap_or(usize::MAX),
            ),
            "config_error" => PlugError::Config(message),
            "write_batch_error" => PlugError::WriteBatch(message),
            "unsupported" => PlugError::Unsupported(message),
            "constraint_violation" => PlugError::Constraint(message),
            // Anything unrecognised came from the plugin's row production.
            _ => PlugError::Query(message),
        }
    }

    /// Get the inner message without the kind prefix.
    /// Useful when re-wrapping errors to avoid "query error: query error: ..."
    pub fn message(&self) -> String {
        match self {
            PlugError::Spawn(msg)
            | PlugError::Handshake(msg)
            | PlugError::Transport(msg)
            | PlugError::Protocol(msg)
            | PlugError::Config(msg)
            | PlugError::Query(msg)
            | PlugError::WriteBatch(msg)
            | PlugError::Unsupported(msg)
            | PlugError::Constraint(msg) => msg.clone(),
            PlugError::UnknownTable(index) => index.to_string(),
            PlugError::Type { expected, actual } => {
                format!("expected {expected}, got {actual}")
            }
        }
    }
}

/// Convert std::io::Error to PlugError
///
/// Shortcut as every I/O failure on an established channel is,
/// by definition, a transport failure.
impl From<std::io::Error> for PlugError {
    fn from(err: std::io::Error) -> Self {
        PlugError::Transport(err.to_string())
    }
}

//! Wire protocol between the host and a plugin subprocess.
//!
//! All calls are synchronous request/response over the subprocess pipes:
//! one frame out, one frame back, no server-initiated push. A frame is a
//! 4-byte big-endian length followed by a JSON-encoded message.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::constraint::QueryConstraint;
use crate::schema::TableDescriptor;
use crate::value::Value;
use crate::{PlugError, Result};

/// Current protocol version. Any mismatch at handshake is fatal, never
/// silently downgraded.
pub const PROTOCOL_VERSION: u32 = 1;

/// Cookie pair exchanged during the handshake. Its only purpose is to reject
/// an executable that is not a plugtab plugin before any table call.
pub const COOKIE_KEY: &str = "PLUGTAB_PLUGIN";
pub const COOKIE_VALUE: &str = "efea5034-bbd6-4b93-ab04-1661ba01d108";

/// 16 MiB max frame size; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// User-supplied configuration handed to a table at initialization.
pub type PluginConfig = BTreeMap<String, Value>;

/// Wire protocol request messages (host to plugin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// First frame on the channel; anything before a valid handshake is
    /// rejected.
    Handshake {
        protocol_version: u32,
        cookie_key: String,
        cookie_value: String,
    },

    /// Ask a table to construct itself and describe its schema.
    ///
    /// `connection` identifies one host-side attach of the table. The same
    /// table index may be attached many times over one channel (one per
    /// SQL statement or connection); each attach gets its own instance and
    /// its own cursors on the plugin side.
    Initialize {
        connection: u64,
        table: usize,
        #[serde(default)]
        config: PluginConfig,
    },

    /// Request the next batch of rows for a cursor.
    Query {
        connection: u64,
        table: usize,
        cursor: u64,
        constraint: QueryConstraint,
    },

    Insert {
        connection: u64,
        table: usize,
        rows: Vec<Vec<Value>>,
    },

    /// Each row is `[old_key, new_col_0, .., new_col_n]`. The key column
    /// appears again inside the new values, so a table can detect key
    /// changes by comparing the two.
    Update {
        connection: u64,
        table: usize,
        rows: Vec<Vec<Value>>,
    },

    Delete {
        connection: u64,
        table: usize,
        keys: Vec<Value>,
    },

    /// Release one attach's table instance and all of its cursors.
    CloseTable {
        connection: u64,
        table: usize,
    },

    /// Graceful end of the session; the plugin exits after acknowledging.
    Shutdown,
}

/// Wire protocol response messages (plugin to host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Welcome {
        protocol_version: u32,
        /// Table indices the plugin serves.
        tables: Vec<usize>,
    },

    Schema {
        descriptor: TableDescriptor,
    },

    Rows {
        rows: Vec<Vec<Value>>,
        /// Sticky: once true, further queries on the cursor return no rows
        /// and true again.
        no_more_rows: bool,
    },

    /// Generic success acknowledgment for writes, close and shutdown.
    Ack,

    Error {
        kind: String,
        message: String,
    },
}

impl Response {
    pub fn error(err: &PlugError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            message: err.message(),
        }
    }

    /// Turn an `Error` response back into the typed error it carried.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { kind, message } => Err(PlugError::from_kind(&kind, message)),
            other => Ok(other),
        }
    }
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload =
        serde_json::to_vec(message).map_err(|e| PlugError::Protocol(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(PlugError::Protocol(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// stream cleanly at a frame boundary.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(PlugError::Protocol(format!(
            "frame too large: {frame_len} bytes"
        )));
    }

    let mut payload = vec![0u8; frame_len];
    reader.read_exact(&mut payload)?;

    let message =
        serde_json::from_slice(&payload).map_err(|e| PlugError::Protocol(e.to_string()))?;
    Ok(Some(message))
}

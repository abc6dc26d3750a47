//! Request dispatch inside the plugin process.

use std::collections::HashMap;

use parking_lot::Mutex;
use plugtab_common::protocol::PluginConfig;
use plugtab_common::{PlugError, QueryConstraint, Result, TableDescriptor, Value};
use tracing::{debug, warn};

use crate::{Table, TableCreator, TableCreatorArgs, TableReader};

/// A live table instance together with the schema it declared.
struct LiveTable {
    table: Box<dyn Table>,
    descriptor: TableDescriptor,
}

/// One reader session, keyed by `(connection, table, cursor)`.
struct ReaderSession {
    reader: Box<dyn TableReader>,
    /// Sticky: set when the reader reports no more rows; further queries on
    /// this cursor answer `(no rows, true)` without touching the reader.
    exhausted: bool,
}

#[derive(Default)]
struct EndpointState {
    creators: HashMap<usize, TableCreator>,
    /// The same table index can be live once per host-side attach; each
    /// attach identifies itself by a connection id, so two statements
    /// scanning one table never share an instance or a cursor.
    live: HashMap<(u64, usize), LiveTable>,
    sessions: HashMap<(u64, usize, u64), ReaderSession>,
}

/// Server-side dispatcher: owns the registered table creators, the live
/// table instances and every cursor's reader session.
///
/// All maps sit behind one mutex; calls arrive serialized from the request
/// loop, but table implementations may also be driven from tests directly.
#[derive(Default)]
pub struct Endpoint {
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table creator under a manifest index. Fails if the index
    /// is already taken.
    pub fn register(&self, table_index: usize, creator: TableCreator) -> Result<()> {
        let mut state = self.state.lock();
        if state.creators.contains_key(&table_index) {
            return Err(PlugError::Config(format!(
                "table index {table_index} is already registered"
            )));
        }
        state.creators.insert(table_index, creator);
        Ok(())
    }

    /// Table indices registered so far, sorted.
    pub fn table_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.state.lock().creators.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Construct a table instance for one attach and return its declared
    /// schema.
    pub fn initialize(
        &self,
        connection: u64,
        table: usize,
        config: PluginConfig,
    ) -> Result<TableDescriptor> {
        let mut state = self.state.lock();
        let creator = state
            .creators
            .get(&table)
            .ok_or(PlugError::UnknownTable(table))?;

        let (instance, descriptor) = creator(TableCreatorArgs {
            table_index: table,
            config,
        })?;
        descriptor.validate()?;

        debug!(connection, table, columns = descriptor.columns.len(), "table initialized");

        // Re-initializing the same attach replaces its instance; that
        // attach's stale sessions go with it. Other attaches of the table
        // are untouched.
        let replaced = state
            .live
            .insert((connection, table), LiveTable { table: instance, descriptor: descriptor.clone() })
            .is_some();
        if replaced {
            state.sessions.retain(|(c, t, _), _| (*c, *t) != (connection, table));
            warn!(connection, table, "table re-initialized, previous sessions dropped");
        }

        Ok(descriptor)
    }

    /// Produce the next batch of rows for a cursor, creating its reader
    /// session on first use.
    pub fn query(
        &self,
        connection: u64,
        table: usize,
        cursor: u64,
        constraint: &QueryConstraint,
    ) -> Result<(Vec<Vec<Value>>, bool)> {
        let mut state = self.state.lock();
        if !state.creators.contains_key(&table) {
            return Err(PlugError::UnknownTable(table));
        }

        let key = (connection, table, cursor);
        if !state.sessions.contains_key(&key) {
            let live = state.live.get_mut(&(connection, table)).ok_or_else(|| {
                PlugError::Query("table was queried before it was initialized".into())
            })?;
            let reader = live.table.create_reader();
            state.sessions.insert(key, ReaderSession { reader, exhausted: false });
        }

        let session = state.sessions.get_mut(&key).expect("session just ensured");
        if session.exhausted {
            return Ok((Vec::new(), true));
        }

        let (rows, no_more_rows) = session.reader.query(constraint)?;
        if no_more_rows {
            session.exhausted = true;
        }
        Ok((rows, no_more_rows))
    }

    pub fn insert(&self, connection: u64, table: usize, rows: Vec<Vec<Value>>) -> Result<()> {
        let mut state = self.state.lock();
        let live = Self::writable(&mut state, connection, table)?;
        if !live.descriptor.handles_insert {
            return Err(PlugError::Unsupported("insert".into()));
        }
        live.table.insert(rows)
    }

    pub fn update(&self, connection: u64, table: usize, rows: Vec<Vec<Value>>) -> Result<()> {
        let mut state = self.state.lock();
        let live = Self::writable(&mut state, connection, table)?;
        if !live.descriptor.handles_update {
            return Err(PlugError::Unsupported("update".into()));
        }
        live.table.update(rows)
    }

    pub fn delete(&self, connection: u64, table: usize, keys: Vec<Value>) -> Result<()> {
        let mut state = self.state.lock();
        let live = Self::writable(&mut state, connection, table)?;
        if !live.descriptor.handles_delete {
            return Err(PlugError::Unsupported("delete".into()));
        }
        live.table.delete(keys)
    }

    /// Release one attach's table instance and every session it owns.
    pub fn close_table(&self, connection: u64, table: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.sessions.retain(|(c, t, _), _| (*c, *t) != (connection, table));
        if let Some(mut live) = state.live.remove(&(connection, table)) {
            live.table.close()?;
        }
        Ok(())
    }

    /// Release everything, chaining through close failures so every table
    /// still gets its shutdown call.
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.sessions.clear();
        for ((connection, table), mut live) in state.live.drain() {
            if let Err(e) = live.table.close() {
                warn!(connection, table, error = %e, "table close failed during shutdown");
            }
        }
    }

    fn writable<'a>(
        state: &'a mut EndpointState,
        connection: u64,
        table: usize,
    ) -> Result<&'a mut LiveTable> {
        if !state.creators.contains_key(&table) {
            return Err(PlugError::UnknownTable(table));
        }
        state.live.get_mut(&(connection, table)).ok_or_else(|| {
            PlugError::Query("table was written before it was initialized".into())
        })
    }
}

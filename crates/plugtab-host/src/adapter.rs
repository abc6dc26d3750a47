//! The virtual-table adapter: [`PluginTable`] and [`PluginCursor`].
//!
//! This is where the engine's callback contract meets the plugin channel:
//! schema negotiation at connect time, the cursor state machine over
//! batched row fetches, value coercion to the declared column types, and
//! write batching.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use plugtab_common::protocol::PluginConfig;
use plugtab_common::{PlugError, QueryConstraint, Result, TableDescriptor, Value};
use tracing::debug;

use crate::transport::{ChannelPool, PluginRpc};
use crate::translator;
use crate::vtab::{IndexInfo, IndexPlan, VTab, VTabCursor};

/// A plugin may answer a fetch with an empty non-final batch while it waits
/// on upstream data; the cursor retries with a short backoff and fails the
/// scan after this many consecutive empty answers.
const EMPTY_BATCH_RETRIES: u32 = 16;
const EMPTY_BATCH_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Default)]
struct WriteBuffers {
    inserts: Vec<Vec<Value>>,
    updates: Vec<Vec<Value>>,
    deletes: Vec<Value>,
}

/// State shared between a table and all of its cursors.
struct TableCore {
    rpc: Arc<dyn PluginRpc>,
    /// This attach's connection id, carried on every call so the plugin
    /// keeps our instance and cursors apart from other attaches of the
    /// same table index.
    connection: u64,
    table_index: usize,
    descriptor: TableDescriptor,
    /// Schema column index to position in a plugin row. Plugin rows omit
    /// parameter columns, so positions shift left past each one; `None`
    /// marks a parameter column whose value lives in the constraint.
    row_positions: Vec<Option<usize>>,
    /// Cursor identities are never reused within an attach; a plugin can
    /// therefore key per-scan state by `(connection, table, cursor)`.
    next_cursor: AtomicU64,
    buffers: Mutex<WriteBuffers>,
}

impl TableCore {
    // The flush methods hold the buffer lock across the call. The channel
    // serializes requests anyway, and a writer queueing rows during a
    // flush must not have them wiped by the post-flush clear.

    fn flush_inserts(&self) -> Result<()> {
        let mut buffers = self.buffers.lock();
        if buffers.inserts.is_empty() {
            return Ok(());
        }
        self.rpc
            .insert(self.connection, self.table_index, buffers.inserts.clone())
            .map_err(batch_error)?;
        buffers.inserts.clear();
        Ok(())
    }

    fn flush_updates(&self) -> Result<()> {
        let mut buffers = self.buffers.lock();
        if buffers.updates.is_empty() {
            return Ok(());
        }
        self.rpc
            .update(self.connection, self.table_index, buffers.updates.clone())
            .map_err(batch_error)?;
        buffers.updates.clear();
        Ok(())
    }

    fn flush_deletes(&self) -> Result<()> {
        let mut buffers = self.buffers.lock();
        if buffers.deletes.is_empty() {
            return Ok(());
        }
        self.rpc
            .delete(self.connection, self.table_index, buffers.deletes.clone())
            .map_err(batch_error)?;
        buffers.deletes.clear();
        Ok(())
    }

    /// Push every pending write to the plugin. A scan must never observe
    /// the table without its own earlier writes.
    fn flush_all(&self) -> Result<()> {
        self.flush_inserts()?;
        self.flush_updates()?;
        self.flush_deletes()
    }
}

/// A batch the plugin rejects stays buffered; the caller decides whether
/// to retry or drop the table. Transport failures keep their own kind
/// since they invalidate the whole channel, not just the batch.
fn batch_error(err: PlugError) -> PlugError {
    match err {
        PlugError::Transport(_) | PlugError::Protocol(_) => err,
        other => PlugError::WriteBatch(other.message()),
    }
}

/// One attached plugin table.
pub struct PluginTable {
    core: Arc<TableCore>,
    /// Set when the table came out of a [`ChannelPool`]; released on
    /// disconnect.
    pool: Option<(Arc<ChannelPool>, PathBuf)>,
    disconnected: bool,
}

impl PluginTable {
    /// Negotiate the schema for `table_index` over an existing channel.
    ///
    /// Configuration rejections from the table creator come back verbatim
    /// as `Config` errors; they are never retried.
    pub fn create(
        rpc: Arc<dyn PluginRpc>,
        table_index: usize,
        config: PluginConfig,
    ) -> Result<Self> {
        let connection = rpc.open_connection();
        let descriptor = rpc.initialize(connection, table_index, config)?;
        descriptor.validate()?;

        let mut row_positions = Vec::with_capacity(descriptor.columns.len());
        let mut position = 0usize;
        for column in &descriptor.columns {
            if column.is_parameter {
                row_positions.push(None);
            } else {
                row_positions.push(Some(position));
                position += 1;
            }
        }

        debug!(
            connection,
            table = table_index,
            columns = descriptor.columns.len(),
            writable = descriptor.supports_writes(),
            "table attached"
        );

        Ok(Self {
            core: Arc::new(TableCore {
                rpc,
                connection,
                table_index,
                descriptor,
                row_positions,
                next_cursor: AtomicU64::new(1),
                buffers: Mutex::new(WriteBuffers::default()),
            }),
            pool: None,
            disconnected: false,
        })
    }

    /// Check a channel out of `pool` (spawning the plugin on first use)
    /// and attach `table_index` over it. The pooled reference is released
    /// when the table disconnects.
    pub fn connect(
        pool: &Arc<ChannelPool>,
        path: &Path,
        args: &[String],
        table_index: usize,
        config: PluginConfig,
    ) -> Result<Self> {
        let channel = pool.checkout(path, args)?;
        let mut table = match Self::create(channel, table_index, config) {
            Ok(table) => table,
            Err(err) => {
                pool.release(path);
                return Err(err);
            }
        };
        table.pool = Some((Arc::clone(pool), path.to_path_buf()));
        Ok(table)
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.core.descriptor
    }

    /// The `CREATE TABLE` declaration the engine registers for this table.
    pub fn schema_sql(&self) -> String {
        self.core.descriptor.create_table_sql()
    }

    /// Queue one row for insertion. The row is in schema column order; the
    /// batch is forwarded once it reaches the declared threshold (a
    /// threshold of zero forwards immediately).
    pub fn insert(&self, row: Vec<Value>) -> Result<()> {
        if !self.core.descriptor.handles_insert {
            return Err(PlugError::Unsupported("insert".into()));
        }
        let threshold = self.core.descriptor.buffer_insert as usize;
        let pending = {
            let mut buffers = self.core.buffers.lock();
            buffers.inserts.push(row);
            buffers.inserts.len()
        };
        if pending >= threshold.max(1) {
            self.core.flush_inserts()?;
        }
        Ok(())
    }

    /// Queue one row update. `old_key` identifies the row being changed;
    /// `row` carries the new values for every schema column, key included,
    /// so the plugin can detect key changes.
    pub fn update(&self, old_key: Value, row: Vec<Value>) -> Result<()> {
        if !self.core.descriptor.handles_update {
            return Err(PlugError::Unsupported("update".into()));
        }
        let mut wire_row = Vec::with_capacity(row.len() + 1);
        wire_row.push(old_key);
        wire_row.extend(row);

        let threshold = self.core.descriptor.buffer_update as usize;
        let pending = {
            let mut buffers = self.core.buffers.lock();
            buffers.updates.push(wire_row);
            buffers.updates.len()
        };
        if pending >= threshold.max(1) {
            self.core.flush_updates()?;
        }
        Ok(())
    }

    /// Queue one row deletion by key.
    pub fn delete(&self, key: Value) -> Result<()> {
        if !self.core.descriptor.handles_delete {
            return Err(PlugError::Unsupported("delete".into()));
        }
        let threshold = self.core.descriptor.buffer_delete as usize;
        let pending = {
            let mut buffers = self.core.buffers.lock();
            buffers.deletes.push(key);
            buffers.deletes.len()
        };
        if pending >= threshold.max(1) {
            self.core.flush_deletes()?;
        }
        Ok(())
    }

    /// Flush any pending writes without waiting for a threshold.
    pub fn flush(&self) -> Result<()> {
        self.core.flush_all()
    }

    /// Detach the table: flush pending writes, release the instance on the
    /// plugin side, and drop the pooled channel reference. Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.disconnected {
            return Ok(());
        }
        self.disconnected = true;

        let flushed = self.core.flush_all();
        let closed = self
            .core
            .rpc
            .close_table(self.core.connection, self.core.table_index);
        if let Some((pool, path)) = self.pool.take() {
            pool.release(&path);
        }
        flushed?;
        closed
    }
}

impl Drop for PluginTable {
    fn drop(&mut self) {
        // Pending writes were the caller's to flush; the pooled channel
        // reference must not leak regardless.
        if !self.disconnected
            && let Some((pool, path)) = self.pool.take()
        {
            pool.release(&path);
        }
    }
}

impl VTab for PluginTable {
    type Cursor = PluginCursor;

    fn best_index(&self, info: &IndexInfo) -> Result<IndexPlan> {
        translator::plan_scan(&self.core.descriptor, info)
    }

    fn open(&mut self) -> Result<PluginCursor> {
        Ok(PluginCursor {
            core: Arc::clone(&self.core),
            cursor_id: 0,
            constraint: QueryConstraint::default(),
            wire: QueryConstraint::default(),
            rows: VecDeque::new(),
            exhausted: false,
            row_serial: 0,
            filtered: false,
        })
    }
}

/// One scan over a [`PluginTable`].
///
/// `filter` arms the cursor under a fresh cursor id and fetches the first
/// batch eagerly; `next`/`column`/`eof` then drain the local buffer,
/// fetching more whenever it runs dry and the plugin has not reported
/// exhaustion. Exhaustion is sticky: once the plugin says `no_more_rows`
/// the cursor never calls out again.
pub struct PluginCursor {
    core: Arc<TableCore>,
    cursor_id: u64,
    /// Constraint as planned, used for re-filtering and parameter values.
    constraint: QueryConstraint,
    /// Constraint as sent to the plugin (LIKE rewritten to GLOB).
    wire: QueryConstraint,
    rows: VecDeque<Vec<Value>>,
    exhausted: bool,
    row_serial: i64,
    filtered: bool,
}

impl PluginCursor {
    /// Fetch batches until the buffer holds at least one row or the plugin
    /// reports exhaustion.
    fn fill(&mut self) -> Result<()> {
        let mut empty_answers = 0u32;
        while self.rows.is_empty() && !self.exhausted {
            let (batch, no_more_rows) = self.core.rpc.query(
                self.core.connection,
                self.core.table_index,
                self.cursor_id,
                &self.wire,
            )?;

            if no_more_rows {
                self.exhausted = true;
            }

            let remote_empty = batch.is_empty();
            for row in batch {
                if self.row_survives(&row) {
                    self.rows.push_back(row);
                }
            }

            if self.rows.is_empty() && !self.exhausted {
                if remote_empty {
                    // No remote progress either; back off, and fail the
                    // scan once the plugin has stalled for long enough.
                    // Ending it quietly would present a truncated result
                    // as a complete one.
                    empty_answers += 1;
                    if empty_answers >= EMPTY_BATCH_RETRIES {
                        return Err(PlugError::Query(format!(
                            "plugin returned {EMPTY_BATCH_RETRIES} empty batches in a row, \
                             max retries reached"
                        )));
                    }
                    std::thread::sleep(EMPTY_BATCH_BACKOFF);
                } else {
                    empty_answers = 0;
                }
            }
        }
        Ok(())
    }

    /// Re-apply the WHERE predicates locally. Pushdown is advisory, so a
    /// plugin may return rows the constraint excludes.
    fn row_survives(&self, row: &[Value]) -> bool {
        self.constraint.row_matches(|column| {
            match self.core.row_positions.get(column).copied().flatten() {
                Some(position) => row.get(position),
                // Parameter column: its value is whatever the constraint
                // pinned it to, which trivially satisfies the predicate.
                None => self.constraint.value_for(column),
            }
        })
    }

    fn current(&self) -> Option<&Vec<Value>> {
        self.rows.front()
    }
}

impl VTabCursor for PluginCursor {
    fn filter(&mut self, plan: &str, args: Vec<Value>) -> Result<()> {
        // A scan must observe earlier writes from this statement batch.
        self.core.flush_all()?;

        self.constraint = translator::load_plan(plan, &args)?;
        self.wire = translator::wire_constraint(&self.constraint);
        self.cursor_id = self.core.next_cursor.fetch_add(1, Ordering::SeqCst);
        self.rows.clear();
        self.exhausted = false;
        self.row_serial = 0;
        self.filtered = true;

        self.fill()
    }

    fn next(&mut self) -> Result<()> {
        self.rows.pop_front();
        self.row_serial += 1;
        if self.rows.is_empty() && !self.exhausted {
            self.fill()?;
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        !self.filtered || (self.rows.is_empty() && self.exhausted)
    }

    /// Read one column of the current row, coerced to its declared type.
    /// Parameter columns echo the constraint value; positions the plugin
    /// did not produce read as NULL.
    fn column(&self, index: usize) -> Result<Value> {
        let spec = self
            .core
            .descriptor
            .columns
            .get(index)
            .ok_or_else(|| PlugError::Query(format!("no column at index {index}")))?;

        let raw = match self.core.row_positions[index] {
            Some(position) => self
                .current()
                .and_then(|row| row.get(position))
                .cloned()
                .unwrap_or(Value::Null),
            None => self
                .constraint
                .value_for(index)
                .cloned()
                .unwrap_or(Value::Null),
        };
        Ok(raw.coerce_to(spec.column_type))
    }

    /// The key column's value when the table declared an integer key;
    /// otherwise a synthetic id, unique within the scan.
    fn rowid(&self) -> Result<i64> {
        if let Some(pk) = self.core.descriptor.primary_key
            && let Some(position) = self.core.row_positions[pk]
            && let Some(Value::Int(id)) = self.current().and_then(|row| row.get(position))
        {
            return Ok(*id);
        }
        Ok(self.row_serial)
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        self.exhausted = true;
        Ok(())
    }
}

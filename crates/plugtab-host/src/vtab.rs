//! Abstract virtual-table callback contract.
//!
//! This is the shape of the host engine's table extension interface with
//! the engine specifics stripped out: the planner describes a scan through
//! [`IndexInfo`], the table answers with an [`IndexPlan`], then a cursor is
//! opened, filtered and drained column by column. Tables are eponymous, so
//! create and connect collapse into construction and disconnect and destroy
//! collapse into [`PluginTable::disconnect`](crate::PluginTable::disconnect).

use plugtab_common::{Result, Value};

/// Planner-level constraint operators.
///
/// Superset of the wire operators: the planner also reports null tests and
/// LIMIT/OFFSET as pseudo constraints, which never cross the process
/// boundary in that form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
    Match,
    Like,
    Glob,
    Regexp,
    Is,
    IsNot,
    IsNull,
    IsNotNull,
    /// Pseudo constraint carrying the LIMIT value.
    Limit,
    /// Pseudo constraint carrying the OFFSET value.
    Offset,
}

/// One constraint as reported by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Schema column index. Negative for the engine's row id.
    pub column: i32,
    pub op: RawOp,
    /// Unusable constraints must not be planned; their values are never
    /// supplied to `filter`.
    pub usable: bool,
}

/// One ORDER BY term as reported by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOrderBy {
    pub column: i32,
    pub descending: bool,
}

/// Everything the planner tells a table about a prospective scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexInfo {
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<IndexOrderBy>,
}

/// The table's answer to [`VTab::best_index`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPlan {
    /// For each input constraint, the 0-based slot of its value in the
    /// argument vector later passed to `filter`, or `None` when the value
    /// is not requested.
    pub used: Vec<Option<usize>>,
    /// Opaque plan handed back verbatim to `filter`.
    pub plan: String,
    /// Whether the scan will produce rows in the requested order. Always
    /// false here since pushdown is advisory.
    pub order_by_consumed: bool,
}

/// A connected virtual table.
pub trait VTab {
    type Cursor: VTabCursor;

    /// Plan a scan. Failing here fails statement preparation.
    fn best_index(&self, info: &IndexInfo) -> Result<IndexPlan>;

    /// Open a new cursor over this table.
    fn open(&mut self) -> Result<Self::Cursor>;
}

/// An open cursor. The engine drives it as
/// `filter, (column*, next)*` until [`eof`](Self::eof), and may call
/// `filter` again at any point to restart the scan with new values.
pub trait VTabCursor {
    fn filter(&mut self, plan: &str, args: Vec<Value>) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn eof(&self) -> bool;
    fn column(&self, index: usize) -> Result<Value>;
    fn rowid(&self) -> Result<i64>;
    fn close(&mut self) -> Result<()>;
}

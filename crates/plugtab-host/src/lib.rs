//! Host side of the plugtab bridge.
//!
//! A plugin table lives in a separate process; this crate owns everything
//! on the near side of that boundary: spawning and pooling plugin
//! subprocesses ([`transport`]), translating the engine planner's view of
//! a scan into wire constraints ([`translator`]), and the virtual-table
//! adapter that drives cursors, coerces values and batches writes
//! ([`adapter`]).
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use plugtab_common::protocol::PluginConfig;
//! use plugtab_host::{ChannelPool, PluginTable, VTab, VTabCursor};
//!
//! # fn main() -> plugtab_common::Result<()> {
//! let pool = Arc::new(ChannelPool::new());
//! let mut table = PluginTable::connect(
//!     &pool,
//!     Path::new("./my-plugin"),
//!     &[],
//!     0,
//!     PluginConfig::new(),
//! )?;
//!
//! let plan = table.best_index(&Default::default())?;
//! let mut cursor = table.open()?;
//! cursor.filter(&plan.plan, vec![])?;
//! while !cursor.eof() {
//!     println!("{:?}", cursor.column(0)?);
//!     cursor.next()?;
//! }
//! table.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod translator;
pub mod transport;
pub mod vtab;

pub use adapter::{PluginCursor, PluginTable};
pub use transport::{ChannelPool, PluginChannel, PluginRpc};
pub use vtab::{IndexConstraint, IndexInfo, IndexOrderBy, IndexPlan, RawOp, VTab, VTabCursor};

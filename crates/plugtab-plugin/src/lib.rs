//! Plugin-side runtime for plugtab.
//!
//! A plugin registers one [`TableCreator`] per table index and calls
//! [`Plugin::serve`], which answers the host's handshake and then dispatches
//! table calls until the host closes the channel.
//!
//! ```no_run
//! use plugtab_common::{ColumnSpec, ColumnType, TableDescriptor};
//! use plugtab_plugin::{Plugin, Table, TableCreatorArgs, TableReader};
//!
//! struct Numbers;
//! struct NumbersReader(i64);
//!
//! impl Table for Numbers {
//!     fn create_reader(&mut self) -> Box<dyn TableReader> {
//!         Box::new(NumbersReader(0))
//!     }
//! }
//!
//! impl TableReader for NumbersReader {
//!     fn query(
//!         &mut self,
//!         _constraint: &plugtab_common::QueryConstraint,
//!     ) -> plugtab_common::Result<(Vec<Vec<plugtab_common::Value>>, bool)> {
//!         let batch = (self.0..self.0 + 10).map(|i| vec![i.into()]).collect();
//!         self.0 += 10;
//!         Ok((batch, self.0 >= 100))
//!     }
//! }
//!
//! let mut plugin = Plugin::new();
//! plugin
//!     .register(0, |_args: TableCreatorArgs| {
//!         let descriptor =
//!             TableDescriptor::new(vec![ColumnSpec::new("n", ColumnType::Int)]);
//!         Ok((Box::new(Numbers) as Box<dyn Table>, descriptor))
//!     })
//!     .unwrap();
//! plugin.serve().unwrap();
//! ```

mod endpoint;
mod serve;

pub use endpoint::Endpoint;
pub use serve::Plugin;

use plugtab_common::protocol::PluginConfig;
use plugtab_common::{PlugError, QueryConstraint, Result, TableDescriptor, Value};

/// Arguments passed to a [`TableCreator`].
///
/// Kept as a struct so fields can be added without breaking old plugins.
#[derive(Debug, Clone)]
pub struct TableCreatorArgs {
    /// Index of the table in the manifest (0-based).
    pub table_index: usize,
    /// Configuration supplied by the user when the table was attached.
    pub config: PluginConfig,
}

/// Builds a live table instance and declares its schema.
///
/// Rejecting the configuration (for example a missing credential) must
/// return a [`PlugError::Config`]; the host surfaces it verbatim to the SQL
/// caller and never retries.
pub type TableCreator =
    Box<dyn Fn(TableCreatorArgs) -> Result<(Box<dyn Table>, TableDescriptor)> + Send>;

/// One logical scan over a table. A table can have several concurrent
/// readers; each sees its own position.
pub trait TableReader: Send {
    /// Produce the next batch of rows.
    ///
    /// The constraint is advisory: a reader may use it to fetch less, but
    /// the host re-filters every row it receives, so ignoring it is always
    /// correct. The second return value signals exhaustion; once returned
    /// the runtime never calls this reader again.
    fn query(&mut self, constraint: &QueryConstraint) -> Result<(Vec<Vec<Value>>, bool)>;
}

/// A live table instance inside the plugin process.
///
/// Whether the write methods are ever invoked is decided by the capability
/// flags in the descriptor the creator returned, not by probing: a table
/// that leaves `handles_insert` unset will never see `insert`.
pub trait Table: Send {
    /// Start a new scan.
    fn create_reader(&mut self) -> Box<dyn TableReader>;

    fn insert(&mut self, _rows: Vec<Vec<Value>>) -> Result<()> {
        Err(PlugError::Unsupported("insert".into()))
    }

    /// Each row is `[old_key, new_col_0, .., new_col_n]`; compare the old
    /// key with the new value of the key column to detect key changes.
    fn update(&mut self, _rows: Vec<Vec<Value>>) -> Result<()> {
        Err(PlugError::Unsupported("update".into()))
    }

    fn delete(&mut self, _keys: Vec<Value>) -> Result<()> {
        Err(PlugError::Unsupported("delete".into()))
    }

    /// Called when the host releases the table. Free connections here.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

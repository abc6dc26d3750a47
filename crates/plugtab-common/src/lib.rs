//! Shared types for the plugtab virtual-table bridge.
//!
//! Both sides of the process boundary depend on this crate: the host links
//! it into its virtual-table adapter, plugins link it through the plugin
//! runtime. Everything here is wire-stable; breaking changes must bump
//! [`protocol::PROTOCOL_VERSION`].

pub mod constraint;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod value;

pub use constraint::{ColumnConstraint, ConstraintOp, OrderConstraint, QueryConstraint};
pub use error::{PlugError, Result};
pub use protocol::{PROTOCOL_VERSION, Request, Response};
pub use schema::{ColumnSpec, PluginManifest, TableDescriptor};
pub use value::{ColumnType, Value};

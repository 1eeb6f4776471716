#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
#![cfg_attr(feature = "nightly", allow(internal_features))]
//! In-memory hash joins over byte-packed tuples, with hash tables cached and
//! reused across range-filtered join passes.

pub mod cache;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hash;
pub mod hashtable;
pub mod loader;
pub mod page;
pub mod range;
pub mod schema;
pub mod table;

pub use cache::{CacheConfig, CacheEntry, EntryId, ReuseCache};
pub use engine::{BuildStats, EngineConfig, Execution, JoinEngine, JoinSpec, ProbeMode, ProbeResult, Storage};
pub use error::{JoinError, Result};
pub use hashtable::HashTable;
pub use range::{KeyRange, KeySet};
pub use schema::{ColumnType, Schema, SchemaRef};
pub use table::{Table, TableCursor, TupleRef, TupleSource};

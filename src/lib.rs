//! Storage-engine core for a columnar OLAP database node.
//!
//! The engine owns a set of storage volumes and the tablets on them. Each
//! tablet keeps a versioned history of immutable rowsets; loads commit
//! rowsets under a transaction until the control plane publishes them, and
//! background threads keep the node healthy: disk monitoring, cumulative and
//! base compaction scheduling, garbage collection of retired artifacts, and
//! expiry of trash and snapshot directories.
//!
//! ```no_run
//! use lithos::{Engine, EngineOptions, StorePath};
//!
//! # fn main() -> Result<(), lithos::EngineError> {
//! let options = EngineOptions::new(vec![StorePath::new("/data/lithos", 1 << 40)]);
//! let engine = Engine::open(options)?;
//! // ... serve control-plane requests ...
//! engine.close();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod compaction;
mod engine;
pub mod error;
pub mod gc;
pub mod meta;
pub mod option;
mod recover;
pub mod rowset;
pub mod store;
mod sweep;
pub mod tablet;
pub mod task;
pub mod txn;

pub use crate::{
    engine::{Engine, IndexCache},
    error::EngineError,
    option::{EngineOptions, StorePath},
    store::{DataDirInfo, DiskSpace, StorageMedium},
    tablet::{CompactionKind, CreateTabletRequest, TabletInfo},
    task::EngineTask,
};

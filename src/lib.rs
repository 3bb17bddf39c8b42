//! Symbol cache for AL / C/AL application packages.
//!
//! Packages are unpacked by short-lived worker processes, their object
//! metadata and procedure signatures are merged into JSON snapshots, and a
//! field index over extracted sources answers table/page lookups.

pub mod cli;
pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod logging;
pub mod query;
pub mod refresh;

pub use config::Config;
pub use error::{CacheIoError, ExtractionError, WorkerError};
pub use index::store::CacheStore;
pub use query::QueryEngine;
pub use refresh::{RefreshCoordinator, RefreshOutcome};

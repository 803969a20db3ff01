//! Synchronisation engine between a remote table service and a local store
//! of actors, affiliations, roles, evidence and sources.
//!
//! Remote access lives under [`io::remote`] (with the HTTP transport in
//! [`io::http`] and workbook snapshots in [`io::workbook_read`]), the local
//! store under [`io::store`], row translation in [`mapping`] and [`resolve`],
//! the per-kind diff in [`reconcile`], run orchestration and failure regimes
//! in [`sync`] and [`policy`], and the push of local changes in [`export`].

pub mod config;
pub mod error;
pub mod export;
pub mod io;
pub mod mapping;
pub mod model;
pub mod policy;
pub mod reconcile;
pub mod resolve;
pub mod snapshot;
pub mod sync;

pub use error::{ErrorKind, Result, SyncError};

// ABOUTME: Library root for entity-replicator
// ABOUTME: Exposes the reconciliation core, lock coordination, and connector surface

pub mod connector;
pub mod connector_file;
pub mod error;
pub mod job;
pub mod locks;
pub mod remote;
pub mod report;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};

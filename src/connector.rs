// ABOUTME: ConnectorCallbacks - per-source-format hooks invoked at phase boundaries
// ABOUTME: The core defines when each hook runs, never what it does

use async_trait::async_trait;

use crate::error::Result;
use crate::store::{EntityId, EntityStore};
use crate::sync::tracker::ChangeTracker;

/// Identity of the source document produced by `open_source`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    /// Stable code; becomes the job-subject entity's code.
    pub code: String,
    pub name: String,
}

/// Which schema pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// Fixed domain schema shared by every job.
    Domain,
    /// Schema derived from the source document itself.
    Dynamic,
}

/// Everything a connector may touch during a data-bearing phase.
pub struct PhaseContext<'a> {
    pub store: &'a mut dyn EntityStore,
    pub tracker: &'a mut ChangeTracker,
    /// The job-subject entity items are parented under.
    pub subject: EntityId,
}

/// Hooks a data-source adapter implements, resolved once per job and
/// invoked by the orchestrator at fixed phase boundaries.
#[async_trait]
pub trait ConnectorCallbacks: Send {
    /// Open the external source and identify the document it carries.
    async fn open_source(&mut self) -> Result<SourceDocument>;

    /// Import schema under the repository root. Called twice, once per
    /// `SchemaKind`, both under an exclusive root lock.
    async fn import_schema(&mut self, store: &mut dyn EntityStore, kind: SchemaKind)
        -> Result<()>;

    /// Import shared definitions referenced by the data.
    async fn import_definitions(&mut self, ctx: PhaseContext<'_>) -> Result<()>;

    /// Synchronize the source items through `ctx.tracker`.
    async fn update_data(&mut self, ctx: PhaseContext<'_>) -> Result<()>;
}

// ABOUTME: JobOrchestrator drives the strictly-sequential phase machine
// ABOUTME: Every phase body runs inside a TransactionRunner call; failures clean up

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::connector::{ConnectorCallbacks, PhaseContext, SchemaKind, SourceDocument};
use crate::error::{Result, SyncError};
use crate::job::JobSpec;
use crate::locks::{ChannelGuard, LockCoordinator, LockRequest};
use crate::report::ErrorSink;
use crate::store::{
    entity_lock_name, Channel, EntityId, EntityProps, EntityStore, RecordKey, Scope, ScopePolicy,
    TrackedRecord,
};
use crate::sync::runner::{StoreMode, SyncTask, TransactionRunner};
use crate::sync::scanner::DeletionScanner;
use crate::sync::tracker::{version_checksum, ChangeTracker};

/// Phases of one synchronization run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Init,
    DomainSchema,
    DynamicSchema,
    JobSubject,
    Definitions,
    Data,
    DeletionDetection,
    Finalize,
    Done,
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Init => "init",
            JobPhase::DomainSchema => "domain-schema",
            JobPhase::DynamicSchema => "dynamic-schema",
            JobPhase::JobSubject => "job-subject",
            JobPhase::Definitions => "definitions",
            JobPhase::Data => "data",
            JobPhase::DeletionDetection => "deletion-detection",
            JobPhase::Finalize => "finalize",
            JobPhase::Done => "done",
            JobPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one run did, by item state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub duration_ms: u64,
}

/// Per-run session state: the lock bookkeeping and the single write channel.
/// Explicit fields instead of ambient globals so sequencing violations are
/// unit-testable.
pub struct Session {
    pub id: Uuid,
    pub coordinator: LockCoordinator,
    pub channel: ChannelGuard,
}

impl Session {
    pub fn new(mode: &StoreMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            coordinator: mode.coordinator(),
            channel: ChannelGuard::new(),
        }
    }
}

struct SchemaTask<'a> {
    connector: &'a mut dyn ConnectorCallbacks,
    kind: SchemaKind,
}

#[async_trait]
impl SyncTask for SchemaTask<'_> {
    type Output = ();

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<()> {
        self.connector.import_schema(store, self.kind).await
    }
}

/// Resolves or creates the job's write-channel root under the repository
/// root. Requires shared ownership of the root to insert beneath it.
struct ChannelRootTask {
    code: String,
}

#[async_trait]
impl SyncTask for ChannelRootTask {
    type Output = EntityId;

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<EntityId> {
        let root = store.root();
        match store.query_id_by_code(root, &self.code).await? {
            Some(id) => Ok(id),
            None => {
                let mut props = EntityProps::new(root, &self.code, "channel");
                props.name = format!("Channel {}", self.code);
                store.insert(props).await
            }
        }
    }
}

/// Resolves or creates the job-subject entity and registers the deletion
/// scope according to the job's scope policy.
struct SubjectTask {
    channel_root: EntityId,
    doc: SourceDocument,
    policy: ScopePolicy,
}

#[async_trait]
impl SyncTask for SubjectTask {
    type Output = (EntityId, EntityId);

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<(EntityId, EntityId)> {
        let subject = match store
            .query_id_by_code(self.channel_root, &self.doc.code)
            .await?
        {
            Some(id) => id,
            None => {
                let mut props = EntityProps::new(self.channel_root, &self.doc.code, "document");
                props.name = self.doc.name.clone();
                store.insert(props).await?
            }
        };
        let scope_root = match self.policy {
            ScopePolicy::Document => subject,
            ScopePolicy::Channel => self.channel_root,
        };
        store.register_scope(scope_root).await?;
        if self.policy == ScopePolicy::Channel {
            // In a channel-rooted scope the subject sits between the scope
            // root and every item, so the deletion scanner's ancestor walk
            // needs a record for it.
            store
                .upsert_record(TrackedRecord {
                    scope_id: scope_root,
                    kind: "document".to_string(),
                    source_id: self.doc.code.clone(),
                    entity_id: subject,
                    aspect_id: None,
                    version_checksum: version_checksum(&self.doc.code),
                })
                .await?;
        }
        Ok((subject, scope_root))
    }
}

struct HookTask<'a> {
    connector: &'a mut dyn ConnectorCallbacks,
    tracker: &'a mut ChangeTracker,
    subject: EntityId,
    data: bool,
}

#[async_trait]
impl SyncTask for HookTask<'_> {
    type Output = ();

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<()> {
        let ctx = PhaseContext {
            store,
            tracker: self.tracker,
            subject: self.subject,
        };
        if self.data {
            self.connector.update_data(ctx).await
        } else {
            self.connector.import_definitions(ctx).await
        }
    }
}

struct ScanTask {
    scope: Scope,
    touched: HashSet<RecordKey>,
}

#[async_trait]
impl SyncTask for ScanTask {
    type Output = Vec<EntityId>;

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<Vec<EntityId>> {
        DeletionScanner::scan(store, &self.scope, &self.touched).await
    }
}

struct FinalizeTask {
    job: String,
}

#[async_trait]
impl SyncTask for FinalizeTask {
    type Output = ();

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<()> {
        store.put_sync_config(&self.job, chrono::Utc::now()).await
    }
}

/// Drives one job through the phase sequence, single-use.
///
/// Init -> DomainSchema -> DynamicSchema -> JobSubject -> Definitions ->
/// Data -> DeletionDetection -> Finalize -> Done, or Failed from anywhere.
/// The unmap variant replaces Data + DeletionDetection with a full-scope
/// scan and exits without the later phases.
pub struct JobOrchestrator {
    job: JobSpec,
    store: Box<dyn EntityStore>,
    connector: Box<dyn ConnectorCallbacks>,
    reporter: Arc<dyn ErrorSink>,
    session: Session,
    runner: TransactionRunner,
    phase: JobPhase,
    tracker: Option<ChangeTracker>,
}

impl JobOrchestrator {
    pub fn new(
        job: JobSpec,
        store: Box<dyn EntityStore>,
        connector: Box<dyn ConnectorCallbacks>,
        mode: StoreMode,
        reporter: Arc<dyn ErrorSink>,
    ) -> Self {
        let runner = TransactionRunner::new(job.retry_policy(), &mode);
        let session = Session::new(&mode);
        Self {
            job,
            store,
            connector,
            reporter,
            session,
            runner,
            phase: JobPhase::Init,
            tracker: None,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// Hand the store back, e.g. to run a follow-up job against it.
    pub fn into_store(self) -> Box<dyn EntityStore> {
        self.store
    }

    /// Run every phase of the job.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.drive(false).await
    }

    /// Retract the source document: the definitions and data import hooks
    /// are skipped (a retraction must not import anything), a full-scope
    /// deletion scan runs instead, and the run exits without finalizing.
    pub async fn run_unmap(&mut self) -> Result<RunSummary> {
        self.drive(true).await
    }

    async fn drive(&mut self, unmap: bool) -> Result<RunSummary> {
        if self.phase != JobPhase::Init {
            return Err(SyncError::usage(format!(
                "job '{}' already ran (phase {}); orchestrators are single-use",
                self.job.name, self.phase
            )));
        }
        let started = Instant::now();
        match self.execute(unmap).await {
            Ok(mut summary) => {
                self.phase = JobPhase::Done;
                summary.duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    "job '{}' finished: {} new, {} changed, {} unchanged, {} deleted in {}ms",
                    self.job.name,
                    summary.new,
                    summary.changed,
                    summary.unchanged,
                    summary.deleted,
                    summary.duration_ms
                );
                Ok(summary)
            }
            Err(err) => {
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    async fn execute(&mut self, unmap: bool) -> Result<RunSummary> {
        let root = self.store.root();
        let root_lock = entity_lock_name(root);

        // Init: open the source and learn which document it carries.
        let doc = self.connector.open_source().await?;
        tracing::info!(
            "session {} opened source document '{}'",
            self.session.id,
            doc.code
        );

        // Schema phases run under an exclusive repository-root lock.
        let schema_request = LockRequest::exclusive([root_lock.clone()]);
        for (phase, kind) in [
            (JobPhase::DomainSchema, SchemaKind::Domain),
            (JobPhase::DynamicSchema, SchemaKind::Dynamic),
        ] {
            self.phase = phase;
            let comment = self.job.comment(phase.as_str());
            let mut task = SchemaTask {
                connector: self.connector.as_mut(),
                kind,
            };
            self.runner
                .run(
                    self.store.as_mut(),
                    &mut self.session.coordinator,
                    &schema_request,
                    &comment,
                    &mut task,
                )
                .await?;
        }
        // The exclusive root lock must not outlive the schema phases; data
        // phases only need shared root ownership.
        self.session.coordinator.release(&root_lock).await?;

        // JobSubject: resolve the write channel, then the subject under it.
        self.phase = JobPhase::JobSubject;
        let comment = self.job.comment(JobPhase::JobSubject.as_str());
        let shared_root = LockRequest::default().with_shared([root_lock.clone()]);
        let mut task = ChannelRootTask {
            code: self.job.channel_code().to_string(),
        };
        let channel_root = self
            .runner
            .run(
                self.store.as_mut(),
                &mut self.session.coordinator,
                &shared_root,
                &comment,
                &mut task,
            )
            .await?;

        let channel = Channel::new(channel_root);
        let channel_request =
            LockRequest::exclusive([channel.lock_name()]).with_shared([root_lock.clone()]);
        let mut task = SubjectTask {
            channel_root,
            doc: doc.clone(),
            policy: self.job.scope_policy,
        };
        let (subject, scope_root) = self
            .runner
            .run(
                self.store.as_mut(),
                &mut self.session.coordinator,
                &channel_request,
                &comment,
                &mut task,
            )
            .await?;
        self.session
            .channel
            .enter(&mut self.session.coordinator, channel)
            .await?;

        let scope = Scope::new(scope_root, &self.job.name);
        let mut tracker = ChangeTracker::new(scope.clone());
        if self.job.scope_policy == ScopePolicy::Channel {
            // Confirm the subject's record; an unmap leaves it unconfirmed
            // so the full-scope scan retracts the subject too.
            tracker.touch(RecordKey::new("document", &doc.code));
        }
        self.tracker = Some(tracker);

        if !unmap {
            for (phase, data) in [(JobPhase::Definitions, false), (JobPhase::Data, true)] {
                self.phase = phase;
                let comment = self.job.comment(phase.as_str());
                let tracker = self
                    .tracker
                    .as_mut()
                    .ok_or_else(|| SyncError::usage("change tracker missing"))?;
                let mut task = HookTask {
                    connector: self.connector.as_mut(),
                    tracker,
                    subject,
                    data,
                };
                self.runner
                    .run(
                        self.store.as_mut(),
                        &mut self.session.coordinator,
                        &channel_request,
                        &comment,
                        &mut task,
                    )
                    .await?;
            }
        } else {
            tracing::info!(
                "unmapping document '{}': forcing a full-scope deletion scan",
                doc.code
            );
        }

        self.phase = JobPhase::DeletionDetection;
        let comment = self.job.comment(JobPhase::DeletionDetection.as_str());
        let touched = if unmap {
            HashSet::new()
        } else {
            self.tracker
                .as_ref()
                .map(|t| t.touched().clone())
                .unwrap_or_default()
        };
        let mut task = ScanTask {
            scope: scope.clone(),
            touched,
        };
        let removed = self
            .runner
            .run(
                self.store.as_mut(),
                &mut self.session.coordinator,
                &channel_request,
                &comment,
                &mut task,
            )
            .await?;

        let counts = self.tracker.as_ref().map(|t| t.counts()).unwrap_or_default();
        let summary = RunSummary {
            new: counts.new,
            changed: counts.changed,
            unchanged: counts.unchanged,
            deleted: removed.len(),
            duration_ms: 0,
        };

        if unmap {
            self.session
                .channel
                .leave(&mut self.session.coordinator)
                .await?;
            self.session.coordinator.release_all().await?;
            return Ok(summary);
        }

        self.phase = JobPhase::Finalize;
        let comment = self.job.comment(JobPhase::Finalize.as_str());
        let mut task = FinalizeTask {
            job: self.job.name.clone(),
        };
        self.runner
            .run(
                self.store.as_mut(),
                &mut self.session.coordinator,
                &channel_request,
                &comment,
                &mut task,
            )
            .await?;
        self.session
            .channel
            .leave(&mut self.session.coordinator)
            .await?;
        self.session.coordinator.release_all().await?;
        Ok(summary)
    }

    /// Failure cleanup: discard, unlock, report. The store is never left
    /// half-locked; the previous phase's commit stays the durable
    /// high-water mark.
    async fn fail(&mut self, err: &SyncError) {
        let phase = self.phase;
        tracing::error!(
            "job '{}' failed during {}: {err}",
            self.job.name,
            phase.as_str()
        );
        if let Err(cleanup) = self.store.discard().await {
            tracing::warn!("failed to discard local changes: {cleanup}");
        }
        if let Err(cleanup) = self
            .session
            .channel
            .leave(&mut self.session.coordinator)
            .await
        {
            tracing::warn!("failed to leave write channel: {cleanup}");
        }
        if let Err(cleanup) = self.session.coordinator.release_all().await {
            tracing::warn!("failed to release locks: {cleanup}");
        }
        if let Err(report_err) = self
            .reporter
            .record(err.kind(), &err.to_string(), phase.as_str())
            .await
        {
            tracing::error!("failed to persist failure report: {report_err}");
        }
        self.phase = JobPhase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{RetryConfig, SourceConfig, StoreConfig};
    use crate::store::{MemoryStore, SourceItem};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Connector that syncs a fixed list of flat items under the subject.
    struct ScriptedConnector {
        items: Vec<(String, String)>,
        fail_in_data: bool,
    }

    impl ScriptedConnector {
        fn new(items: &[(&str, &str)]) -> Self {
            Self {
                items: items
                    .iter()
                    .map(|(id, v)| (id.to_string(), v.to_string()))
                    .collect(),
                fail_in_data: false,
            }
        }
    }

    #[async_trait]
    impl ConnectorCallbacks for ScriptedConnector {
        async fn open_source(&mut self) -> Result<SourceDocument> {
            Ok(SourceDocument {
                code: "catalog".into(),
                name: "Fruit catalog".into(),
            })
        }

        async fn import_schema(
            &mut self,
            _store: &mut dyn EntityStore,
            _kind: SchemaKind,
        ) -> Result<()> {
            Ok(())
        }

        async fn import_definitions(&mut self, _ctx: PhaseContext<'_>) -> Result<()> {
            Ok(())
        }

        async fn update_data(&mut self, ctx: PhaseContext<'_>) -> Result<()> {
            for (id, version) in self.items.clone() {
                let props = EntityProps::new(ctx.subject, &id, "item");
                ctx.tracker
                    .sync_item(ctx.store, "item", &SourceItem::new(&id, &version), props)
                    .await?;
            }
            if self.fail_in_data {
                return Err(SyncError::external("source went away mid-pass"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl ErrorSink for MemorySink {
        async fn record(&self, kind: &str, message: &str, phase: &str) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .push((kind.into(), message.into(), phase.into()));
            Ok(())
        }
    }

    fn test_job() -> JobSpec {
        JobSpec {
            name: "fruit".into(),
            channel: None,
            scope_policy: ScopePolicy::Document,
            store: StoreConfig::Ephemeral,
            retry: RetryConfig::default(),
            source: SourceConfig {
                kind: "scripted".into(),
                path: PathBuf::from("unused"),
            },
            comment_prefix: None,
            error_report: None,
        }
    }

    fn channel_job() -> JobSpec {
        JobSpec {
            scope_policy: ScopePolicy::Channel,
            ..test_job()
        }
    }

    fn orchestrator(
        store: Box<dyn EntityStore>,
        connector: ScriptedConnector,
        sink: Arc<MemorySink>,
    ) -> JobOrchestrator {
        JobOrchestrator::new(
            test_job(),
            store,
            Box::new(connector),
            StoreMode::Ephemeral,
            sink,
        )
    }

    #[tokio::test]
    async fn test_full_run_then_idempotent_rerun() {
        let sink = Arc::new(MemorySink::default());
        let items = [("apple", "v1"), ("pear", "v1")];
        let mut first = orchestrator(
            Box::new(MemoryStore::new()),
            ScriptedConnector::new(&items),
            sink.clone(),
        );
        let summary = first.run().await.unwrap();
        assert_eq!(summary.new, 2);
        assert_eq!(summary.deleted, 0);
        assert_eq!(first.phase(), JobPhase::Done);

        let store = first.into_store();
        let mut second = orchestrator(store, ScriptedConnector::new(&items), sink);
        let summary = second.run().await.unwrap();
        assert_eq!(summary.new, 0);
        assert_eq!(summary.changed, 0);
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.deleted, 0);
    }

    #[tokio::test]
    async fn test_changed_version_propagates() {
        let sink = Arc::new(MemorySink::default());
        let mut first = orchestrator(
            Box::new(MemoryStore::new()),
            ScriptedConnector::new(&[("apple", "v1")]),
            sink.clone(),
        );
        first.run().await.unwrap();

        let mut second = orchestrator(
            first.into_store(),
            ScriptedConnector::new(&[("apple", "v2")]),
            sink,
        );
        let summary = second.run().await.unwrap();
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.unchanged, 0);
    }

    #[tokio::test]
    async fn test_vanished_item_is_deleted() {
        let sink = Arc::new(MemorySink::default());
        let mut first = orchestrator(
            Box::new(MemoryStore::new()),
            ScriptedConnector::new(&[("apple", "v1"), ("pear", "v1")]),
            sink.clone(),
        );
        first.run().await.unwrap();

        let mut second = orchestrator(
            first.into_store(),
            ScriptedConnector::new(&[("apple", "v1")]),
            sink,
        );
        let summary = second.run().await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.deleted, 1);
    }

    #[tokio::test]
    async fn test_channel_scope_drops_vanished_items() {
        let sink = Arc::new(MemorySink::default());
        let mut first = JobOrchestrator::new(
            channel_job(),
            Box::new(MemoryStore::new()),
            Box::new(ScriptedConnector::new(&[("apple", "v1"), ("pear", "v1")])),
            StoreMode::Ephemeral,
            sink.clone(),
        );
        first.run().await.unwrap();

        let mut second = JobOrchestrator::new(
            channel_job(),
            first.into_store(),
            Box::new(ScriptedConnector::new(&[("apple", "v1")])),
            StoreMode::Ephemeral,
            sink,
        );
        let summary = second.run().await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.deleted, 1);

        // The subject sits inside the scanned scope but is confirmed every
        // pass, so it survives along with the remaining item.
        let store = second.into_store();
        let root = store.root();
        let channel_root = store.query_id_by_code(root, "fruit").await.unwrap().unwrap();
        let subject = store
            .query_id_by_code(channel_root, "catalog")
            .await
            .unwrap()
            .unwrap();
        assert!(store.query_id_by_code(subject, "apple").await.unwrap().is_some());
        assert_eq!(store.query_id_by_code(subject, "pear").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_reports_discards_and_unlocks() {
        let sink = Arc::new(MemorySink::default());
        let mut connector = ScriptedConnector::new(&[("apple", "v1")]);
        connector.fail_in_data = true;
        let mut orch = orchestrator(Box::new(MemoryStore::new()), connector, sink.clone());

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, SyncError::External(_)));
        assert_eq!(orch.phase(), JobPhase::Failed);
        assert_eq!(orch.session.coordinator.held_count(), 0);
        assert_eq!(orch.session.channel.active(), None);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "external");
        assert_eq!(records[0].2, "data");
        drop(records);

        // The data phase was discarded; the job-subject commit is the
        // durable high-water mark.
        let store = orch.into_store();
        let root = store.root();
        let channel_root = store.query_id_by_code(root, "fruit").await.unwrap().unwrap();
        let subject = store
            .query_id_by_code(channel_root, "catalog")
            .await
            .unwrap();
        assert!(subject.is_some());
        assert_eq!(
            store
                .query_id_by_code(subject.unwrap(), "apple")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_orchestrator_is_single_use() {
        let sink = Arc::new(MemorySink::default());
        let mut orch = orchestrator(
            Box::new(MemoryStore::new()),
            ScriptedConnector::new(&[("apple", "v1")]),
            sink,
        );
        orch.run().await.unwrap();
        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, SyncError::Usage(_)));
    }

    #[tokio::test]
    async fn test_unmap_clears_the_scope() {
        let sink = Arc::new(MemorySink::default());
        let mut first = orchestrator(
            Box::new(MemoryStore::new()),
            ScriptedConnector::new(&[("apple", "v1"), ("pear", "v1")]),
            sink.clone(),
        );
        first.run().await.unwrap();

        let mut unmap = orchestrator(
            first.into_store(),
            ScriptedConnector::new(&[("apple", "v1"), ("pear", "v1")]),
            sink,
        );
        let summary = unmap.run_unmap().await.unwrap();
        // Nothing was synced, everything previously recorded is gone.
        assert_eq!(summary.new, 0);
        assert_eq!(summary.deleted, 2);
        assert_eq!(unmap.phase(), JobPhase::Done);

        let store = unmap.into_store();
        let root = store.root();
        let channel_root = store.query_id_by_code(root, "fruit").await.unwrap().unwrap();
        let subject = store
            .query_id_by_code(channel_root, "catalog")
            .await
            .unwrap()
            .unwrap();
        assert!(store.records_in_scope(subject).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_run_timestamp_is_stamped() {
        let sink = Arc::new(MemorySink::default());
        let mut orch = orchestrator(
            Box::new(MemoryStore::new()),
            ScriptedConnector::new(&[("apple", "v1")]),
            sink,
        );
        orch.run().await.unwrap();
        let store = orch.into_store();
        assert!(store.get_sync_config("fruit").await.unwrap().is_some());
    }
}

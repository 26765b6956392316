pub mod cast;
pub mod catalog;
pub mod config;
pub mod ddl;
pub mod error;
pub mod job;
pub mod meta;
pub mod publisher;
pub mod session;
pub mod storage;
pub mod table;
pub mod wal;

pub use crate::config::{ShiftConfig, SqlMode};
pub use crate::ddl::{ColumnSpec, DdlRequest, IndexSpec, TableSpec};
pub use crate::error::{ShiftError, ShiftErrorCode};
pub use crate::job::{Job, JobId, JobState, JobStatus};
pub use crate::session::Session;

use crate::cast::{CastMatrix, SqlCoercion, TypeCoercion};
use crate::catalog::Catalog;
use crate::ddl::lease::{LeaseService, LocalLeaseService};
use crate::ddl::observer::{self, DdlObserver};
use crate::ddl::owner::DdlOwner;
use crate::ddl::reorg::ReorgInfo;
use crate::ddl::DdlContext;
use crate::meta::Meta;
use crate::publisher::{SchemaSyncer, SchemaVersionPublisher};
use crate::session::SessionEnv;
use crate::storage::kv::{KvStore, MemKvStore};
use crate::storage::txn::Transaction;
use crate::table::HandleAllocator;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Collaborators shared by every node of one cluster: the transactional
/// store, the owner lease, the schema-sync registry and the job signal.
#[derive(Clone)]
pub struct ClusterServices {
    pub store: Arc<dyn KvStore>,
    pub lease: Arc<dyn LeaseService>,
    pub syncer: Arc<SchemaSyncer>,
    pub job_events: Arc<Notify>,
}

impl ClusterServices {
    pub fn local(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            lease: Arc::new(LocalLeaseService::new()),
            syncer: Arc::new(SchemaSyncer::new()),
            job_events: Arc::new(Notify::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::local(Arc::new(MemKvStore::new()))
    }

    /// A cluster over a store logged under `dir`, replaying earlier commits.
    pub fn open_dir(dir: &Path, config: &ShiftConfig) -> Result<Self, ShiftError> {
        let store = MemKvStore::open_dir(dir, config.sync_wal_commits)?;
        Ok(Self::local(Arc::new(store)))
    }
}

/// Per-node options beyond [`ShiftConfig`].
#[derive(Clone)]
pub struct NodeOptions {
    pub node_id: String,
    pub observer: Arc<dyn DdlObserver>,
    pub coercion: Arc<dyn TypeCoercion>,
}

impl NodeOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            observer: observer::noop(),
            coercion: Arc::new(SqlCoercion::new(CastMatrix::default())),
        }
    }

    pub fn observer(mut self, observer: Arc<dyn DdlObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn coercion(mut self, coercion: Arc<dyn TypeCoercion>) -> Self {
        self.coercion = coercion;
        self
    }
}

/// One node of a cluster. Every node accepts DDL and DML; the node holding
/// the owner lease also executes queued jobs.
///
/// Constructors spawn the owner loop and must run inside a Tokio runtime.
pub struct ShiftDb {
    ctx: Arc<DdlContext>,
    cluster: ClusterServices,
    node_id: String,
    handles: Arc<HandleAllocator>,
    next_session_id: AtomicU64,
    is_owner: Arc<AtomicBool>,
    shutdown: CancellationToken,
    owner_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShiftDb {
    /// A single-node cluster over an in-memory store.
    pub fn open(config: ShiftConfig) -> Result<Self, ShiftError> {
        Self::join(config, &ClusterServices::in_memory(), NodeOptions::new("node-1"))
    }

    /// A single-node cluster whose store is logged under `dir`.
    pub fn open_dir(config: ShiftConfig, dir: &Path) -> Result<Self, ShiftError> {
        let cluster = ClusterServices::open_dir(dir, &config)?;
        Self::join(config, &cluster, NodeOptions::new("node-1"))
    }

    /// Adds a node to `cluster` and starts campaigning for ownership.
    pub fn join(
        config: ShiftConfig,
        cluster: &ClusterServices,
        options: NodeOptions,
    ) -> Result<Self, ShiftError> {
        config.validate()?;
        let config = Arc::new(config);
        let publisher = Arc::new(SchemaVersionPublisher::new(
            Arc::clone(&cluster.store),
            config.max_cached_schema_versions,
        ));
        let catalog = publisher.reload()?;
        let ctx = Arc::new(DdlContext {
            store: Arc::clone(&cluster.store),
            config: Arc::clone(&config),
            publisher,
            syncer: Arc::clone(&cluster.syncer),
            coercion: options.coercion,
            observer: options.observer,
            job_events: Arc::clone(&cluster.job_events),
        });
        let is_owner = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let owner = DdlOwner::new(
            Arc::clone(&ctx),
            Arc::clone(&cluster.lease),
            options.node_id.clone(),
            Arc::clone(&is_owner),
            shutdown.clone(),
        );
        info!(
            node = %options.node_id,
            version = catalog.version,
            tables = catalog.table_count(),
            "shiftdb node joined"
        );
        Ok(Self {
            handles: Arc::new(HandleAllocator::new(
                Arc::clone(&cluster.store),
                config.auto_id_step,
            )),
            ctx,
            cluster: cluster.clone(),
            node_id: options.node_id,
            next_session_id: AtomicU64::new(1),
            is_owner,
            shutdown,
            owner_task: Mutex::new(Some(owner.spawn())),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ShiftConfig {
        &self.ctx.config
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner.load(Ordering::Acquire)
    }

    /// Opens a DML session registered with the schema-sync barrier.
    pub fn session(&self) -> Session {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            SessionEnv {
                store: Arc::clone(&self.ctx.store),
                publisher: Arc::clone(&self.ctx.publisher),
                coercion: Arc::clone(&self.ctx.coercion),
                handles: Arc::clone(&self.handles),
            },
        );
        self.cluster.syncer.register(session.subscriber());
        session
    }

    /// Enqueues a DDL job without waiting for it.
    pub async fn submit_job(&self, request: &DdlRequest) -> Result<JobId, ShiftError> {
        ddl::submit(&self.ctx, request).await
    }

    /// Waits for an archived outcome. A job that did not finish `Done` or
    /// `Synced` yields its persisted error.
    pub async fn wait_job(&self, job_id: JobId, timeout: Option<Duration>) -> Result<Job, ShiftError> {
        let job = ddl::wait_archived(&self.ctx, job_id, timeout).await?;
        ddl::outcome(job)
    }

    /// Submits `request` and waits for its outcome.
    pub async fn execute(&self, request: &DdlRequest) -> Result<Job, ShiftError> {
        let job_id = self.submit_job(request).await?;
        let job = self.wait_job(job_id, None).await?;
        self.ctx.publisher.reload()?;
        Ok(job)
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), ShiftError> {
        ddl::cancel(&self.ctx, job_id).await
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, ShiftError> {
        ddl::find_job(&self.ctx, job_id)
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatus, ShiftError> {
        ddl::status(&self.ctx, job_id)
    }

    /// Archived jobs in id order, at most `limit`.
    pub fn history(&self, limit: usize) -> Result<Vec<Job>, ShiftError> {
        let mut txn = Transaction::begin(&self.ctx.store);
        Meta::new(&mut txn).list_history(limit)
    }

    /// Unfinished jobs in queue order.
    pub fn queued_jobs(&self) -> Result<Vec<Job>, ShiftError> {
        let mut txn = Transaction::begin(&self.ctx.store);
        Meta::new(&mut txn).list_queue()
    }

    pub fn reorg_info(&self, job_id: JobId) -> Result<Option<ReorgInfo>, ShiftError> {
        let mut txn = Transaction::begin(&self.ctx.store);
        Meta::new(&mut txn).reorg(job_id)
    }

    /// The newest published catalog.
    pub fn catalog(&self) -> Result<Arc<Catalog>, ShiftError> {
        self.ctx.publisher.reload()
    }

    /// Stops the owner loop and releases the lease if held.
    pub async fn shutdown(&self) -> Result<(), ShiftError> {
        self.shutdown.cancel();
        let task = self.owner_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(node = %self.node_id, error = %e, "ddl owner task ended abnormally");
            }
        }
        info!(node = %self.node_id, "shiftdb node shut down");
        Ok(())
    }
}

impl Drop for ShiftDb {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#![allow(dead_code)]

use parking_lot::Mutex;
use shiftdb::catalog::schema::{SchemaState, TableSchema};
use shiftdb::ddl::observer::{ChunkRange, DdlObserver};
use shiftdb::ddl::reorg::ReorgInfo;
use shiftdb::error::ShiftError;
use shiftdb::job::{Job, JobKind, JobState};
use shiftdb::{ColumnSpec, DdlRequest, ShiftConfig, ShiftDb, TableSpec};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

pub const SCHEMA: &str = "test";

pub fn test_config() -> ShiftConfig {
    init_tracing();
    ShiftConfig::development()
}

/// Routes engine logs through the test harness; `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub async fn wait_for_owner(db: &ShiftDb) {
    for _ in 0..1_000 {
        if db.is_owner() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node {} never became owner", db.node_id());
}

pub async fn create_schema(db: &ShiftDb) {
    db.execute(&DdlRequest::CreateSchema { name: SCHEMA.into() })
        .await
        .expect("create schema");
}

pub async fn create_table(db: &ShiftDb, spec: TableSpec) {
    db.execute(&DdlRequest::CreateTable {
        schema: SCHEMA.into(),
        table: spec,
    })
    .await
    .expect("create table");
}

/// A fresh single node with schema `test` and table `t(a <col_type>)`.
pub async fn node_with_table(config: ShiftConfig, column: ColumnSpec) -> ShiftDb {
    let db = ShiftDb::open(config).expect("open");
    create_schema(&db).await;
    create_table(&db, TableSpec::new("t", vec![column])).await;
    db
}

pub fn modify(table: &str, column: ColumnSpec) -> DdlRequest {
    DdlRequest::modify_column(SCHEMA, table, column)
}

pub fn table(db: &ShiftDb, name: &str) -> TableSchema {
    let catalog = db.catalog().expect("catalog");
    catalog
        .resolve_table(SCHEMA, name)
        .map(|t| t.as_ref().clone())
        .expect("table")
}

pub fn history_job(db: &ShiftDb, job_id: i64) -> Job {
    db.history(usize::MAX)
        .expect("history")
        .into_iter()
        .find(|j| j.id == job_id)
        .expect("archived job")
}

/// `(code, message)` of a failed job outcome.
pub fn failure(err: ShiftError) -> (String, String) {
    match err {
        ShiftError::JobFailed { code, message, .. } => (code.as_str().to_string(), message),
        other => panic!("expected a failed job, got {other}"),
    }
}

/// Where a [`GateObserver`] stops the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePoint {
    /// After the step that moved a running job into this schema state.
    AtState(SchemaState),
    /// After the first backfill round's checkpoint.
    AfterRound,
}

/// Holds the owner at one point of one job until the test releases it.
///
/// The observer runs on an owner task and blocks that thread, so tests using
/// it need the multi-thread runtime.
pub struct GateObserver {
    point: GatePoint,
    armed: AtomicBool,
    hits: UnboundedSender<Job>,
    release: Mutex<mpsc::Receiver<()>>,
    checkpoints: Mutex<Vec<u64>>,
    chunks: AtomicUsize,
}

pub struct Gate {
    pub hits: UnboundedReceiver<Job>,
    release: mpsc::Sender<()>,
}

impl Gate {
    pub async fn reached(&mut self) -> Job {
        tokio::time::timeout(Duration::from_secs(10), self.hits.recv())
            .await
            .expect("gate reached in time")
            .expect("observer alive")
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

impl GateObserver {
    pub fn new(point: GatePoint) -> (Arc<Self>, Gate) {
        let (hits_tx, hits_rx) = unbounded_channel();
        let (release_tx, release_rx) = mpsc::channel();
        let observer = Arc::new(Self {
            point,
            armed: AtomicBool::new(true),
            hits: hits_tx,
            release: Mutex::new(release_rx),
            checkpoints: Mutex::new(Vec::new()),
            chunks: AtomicUsize::new(0),
        });
        (
            observer,
            Gate {
                hits: hits_rx,
                release: release_tx,
            },
        )
    }

    /// Scanned-row totals seen at every backfill checkpoint.
    pub fn checkpoints(&self) -> Vec<u64> {
        self.checkpoints.lock().clone()
    }

    /// Chunks handed to backfill tasks so far.
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::Acquire)
    }

    fn hold(&self, job: &Job) {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.hits.send(job.clone());
        let _ = self.release.lock().recv_timeout(Duration::from_secs(10));
    }
}

impl DdlObserver for GateObserver {
    fn on_job_updated(&self, job: &Job) {
        if self.point == GatePoint::AtState(job.schema_state)
            && job.state == JobState::Running
            && !matches!(job.kind, JobKind::CreateSchema { .. } | JobKind::CreateTable { .. })
        {
            self.hold(job);
        }
    }

    fn before_backfill_chunk(&self, _job: &Job, _chunk: &ChunkRange) {
        self.chunks.fetch_add(1, Ordering::AcqRel);
    }

    fn after_backfill_round(&self, job: &Job, reorg: &ReorgInfo) {
        self.checkpoints.lock().push(reorg.scanned_rows);
        if self.point == GatePoint::AfterRound {
            self.hold(job);
        }
    }
}

/// Fails every forward step of a job from `from_state` on, with an error or
/// by panicking. Rollback steps pass.
pub struct FaultObserver {
    pub panic: bool,
    pub from_state: SchemaState,
}

impl DdlObserver for FaultObserver {
    fn before_step(&self, job: &Job) -> Result<(), ShiftError> {
        let target = !matches!(job.kind, JobKind::CreateSchema { .. } | JobKind::CreateTable { .. });
        if !target || job.state.is_reverting() || job.schema_state < self.from_state {
            return Ok(());
        }
        if self.panic {
            panic!("injected failure in job {}", job.id);
        }
        Err(ShiftError::Timeout(format!("injected failure in job {}", job.id)))
    }
}

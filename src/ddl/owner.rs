//! Owner election and the scheduler loop.
//!
//! Every node campaigns for the owner lease. The winner opens a new term by
//! advancing the persisted owner fence, which makes any commit of a deposed
//! owner fail, then runs the general and reorg workers until the lease is
//! lost, the fence moves, or the node shuts down.

use super::DdlContext;
use super::delete_range;
use super::lease::{LeaseGrant, LeaseService};
use super::worker::{DdlWorker, WorkerKind};
use crate::error::ShiftError;
use crate::meta::Meta;
use crate::storage::txn::run_in_new_txn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) struct DdlOwner {
    ctx: Arc<DdlContext>,
    lease: Arc<dyn LeaseService>,
    node_id: String,
    is_owner: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl DdlOwner {
    pub(crate) fn new(
        ctx: Arc<DdlContext>,
        lease: Arc<dyn LeaseService>,
        node_id: String,
        is_owner: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            lease,
            node_id,
            is_owner,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let ttl = Duration::from_millis(self.ctx.config.owner_lease_ttl_ms);
        let interval = Duration::from_millis(self.ctx.config.owner_campaign_interval_ms);
        while !self.shutdown.is_cancelled() {
            if let Some(grant) = self.lease.campaign(&self.node_id, ttl) {
                self.serve(grant, ttl).await;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(node = %self.node_id, "ddl owner loop stopped");
    }

    /// Opens a new owner term in the store and returns it.
    async fn take_over(&self) -> Result<u64, ShiftError> {
        run_in_new_txn(&self.ctx.store, self.ctx.retry_policy(), |txn| {
            let mut meta = Meta::new(txn);
            let term = meta.owner_epoch()? + 1;
            meta.set_owner_epoch(term)?;
            Ok(term)
        })
        .await
    }

    async fn serve(&self, grant: LeaseGrant, ttl: Duration) {
        let term = match self.take_over().await {
            Ok(term) => term,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "failed to open ddl owner term");
                self.lease.release(&self.node_id, grant.epoch);
                return;
            }
        };
        self.is_owner.store(true, Ordering::Release);
        info!(node = %self.node_id, lease_epoch = grant.epoch, term, "became ddl owner");

        let token = self.shutdown.child_token();
        let renew = tokio::spawn(renew_lease(
            Arc::clone(&self.lease),
            self.node_id.clone(),
            grant.epoch,
            ttl,
            token.clone(),
        ));

        if let Err(e) = delete_range::drain(
            &self.ctx.store,
            self.ctx.retry_policy(),
            self.ctx.config.gc_batch_size,
        )
        .await
        {
            warn!(error = %e, "delete range drain failed");
        }

        let step_lock = Arc::new(Mutex::new(()));
        let workers = [WorkerKind::General, WorkerKind::Reorg].map(|kind| {
            tokio::spawn(
                DdlWorker::new(
                    Arc::clone(&self.ctx),
                    kind,
                    term,
                    token.clone(),
                    Arc::clone(&step_lock),
                )
                .run(),
            )
        });
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "ddl worker task failed");
            }
        }

        token.cancel();
        let _ = renew.await;
        self.is_owner.store(false, Ordering::Release);
        self.lease.release(&self.node_id, grant.epoch);
        info!(node = %self.node_id, term, "ddl owner stepped down");
    }
}

async fn renew_lease(
    lease: Arc<dyn LeaseService>,
    node_id: String,
    epoch: u64,
    ttl: Duration,
    token: CancellationToken,
) {
    let interval = ttl / 3;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if !lease.renew(&node_id, epoch, ttl) {
            warn!(node = %node_id, lease_epoch = epoch, "ddl owner lease lost");
            token.cancel();
            return;
        }
    }
}

//! Schema version publication.
//!
//! Each node owns a [`SchemaVersionPublisher`] that turns the persisted schema
//! version and diffs into immutable [`Catalog`] snapshots. The cluster shares
//! one [`SchemaSyncer`], the barrier the DDL owner waits on after every
//! version bump until every live session reads at least that version.

pub mod info_cache;

use crate::catalog::{Catalog, CatalogChange};
use crate::error::ShiftError;
use crate::meta::Meta;
use crate::storage::kv::KvStore;
use crate::storage::txn::Transaction;
use info_cache::InfoCache;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SchemaVersionPublisher {
    store: Arc<dyn KvStore>,
    cache: RwLock<InfoCache>,
}

impl SchemaVersionPublisher {
    pub fn new(store: Arc<dyn KvStore>, max_cached_versions: usize) -> Self {
        Self {
            store,
            cache: RwLock::new(InfoCache::new(max_cached_versions)),
        }
    }

    /// Newest snapshot this node has loaded. Empty before the first reload.
    pub fn latest(&self) -> Arc<Catalog> {
        self.cache
            .read()
            .latest()
            .cloned()
            .unwrap_or_else(|| Arc::new(Catalog::empty()))
    }

    pub fn cached(&self, version: u64) -> Result<Arc<Catalog>, ShiftError> {
        self.cache.read().get(version)
    }

    /// Loads the persisted schema version. Version, diffs and table records
    /// are all read from one snapshot, so the result never mixes versions.
    pub fn reload(&self) -> Result<Arc<Catalog>, ShiftError> {
        let mut txn = Transaction::begin(&self.store);
        let meta = Meta::new(&mut txn);
        let version = meta.schema_version()?;
        let base = self.cache.read().latest().cloned();
        if let Some(base) = &base {
            if base.version >= version {
                return Ok(Arc::clone(base));
            }
        }

        let next = match base {
            Some(base) => match apply_diffs(&meta, &base, version)? {
                Some(next) => next,
                None => full_load(&meta, version)?,
            },
            None => full_load(&meta, version)?,
        };
        let next = Arc::new(next);
        let mut cache = self.cache.write();
        cache.publish(Arc::clone(&next));
        Ok(cache.latest().cloned().unwrap_or(next))
    }
}

/// Folds diffs `base.version + 1 ..= version` into one snapshot. Returns
/// `None` when a diff is missing and a full load is required.
fn apply_diffs(meta: &Meta<'_>, base: &Catalog, version: u64) -> Result<Option<Catalog>, ShiftError> {
    let mut changes = Vec::new();
    for v in base.version + 1..=version {
        let Some(diff) = meta.schema_diff(v)? else {
            debug!(version = v, "schema diff missing, falling back to full load");
            return Ok(None);
        };
        if diff.schema_id != 0 {
            match meta.schema(diff.schema_id)? {
                Some(info) => changes.push(CatalogChange::PutSchema(info)),
                None => changes.push(CatalogChange::DropSchema(diff.schema_id)),
            }
        }
        for table_id in diff.table_ids {
            match meta.table(diff.schema_id, table_id)? {
                Some(table) => changes.push(CatalogChange::PutTable(table)),
                None => changes.push(CatalogChange::DropTable(table_id)),
            }
        }
    }
    debug!(from = base.version, to = version, changes = changes.len(), "schema reloaded from diffs");
    Ok(Some(base.apply(version, changes)))
}

fn full_load(meta: &Meta<'_>, version: u64) -> Result<Catalog, ShiftError> {
    let mut changes = Vec::new();
    for info in meta.list_schemas()? {
        let schema_id = info.id;
        changes.push(CatalogChange::PutSchema(info));
        for table in meta.list_tables(schema_id)? {
            changes.push(CatalogChange::PutTable(table));
        }
    }
    info!(version, objects = changes.len(), "schema fully reloaded");
    Ok(Catalog::empty().apply(version, changes))
}

/// A reader of catalog snapshots that the sync barrier can observe and nudge.
pub trait SchemaSubscriber: Send + Sync {
    /// Version of the snapshot this subscriber currently reads through.
    fn pinned_version(&self) -> u64;

    /// Moves to the node's newest snapshot unless an open transaction holds
    /// the current one. Returns the version pinned afterwards.
    fn try_refresh(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// The lease ran out while `lagging` subscribers were still behind.
    LeaseExpired { lagging: usize },
}

/// Cluster-wide registry of live subscribers.
#[derive(Default)]
pub struct SchemaSyncer {
    subscribers: Mutex<Vec<Weak<dyn SchemaSubscriber>>>,
}

impl SchemaSyncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Weak<dyn SchemaSubscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    /// Live subscribers. Dropped ones are pruned.
    pub fn live(&self) -> Vec<Arc<dyn SchemaSubscriber>> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.strong_count() > 0);
        subscribers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Lowest version any live subscriber is pinned to.
    pub fn min_pinned_version(&self) -> Option<u64> {
        self.live().iter().map(|s| s.pinned_version()).min()
    }

    /// Blocks until every live subscriber reads `version` or newer.
    ///
    /// Idle subscribers are refreshed directly; subscribers inside a
    /// transaction are polled until they finish or the lease expires, after
    /// which they are assumed to fail their commit on the changed schema.
    pub async fn wait_synced(
        &self,
        version: u64,
        lease: Duration,
        poll: Duration,
        token: &CancellationToken,
    ) -> Result<SyncOutcome, ShiftError> {
        let deadline = Instant::now() + lease;
        loop {
            if token.is_cancelled() {
                return Err(ShiftError::OwnershipLost);
            }
            let lagging = self
                .live()
                .iter()
                .filter(|s| s.pinned_version() < version && s.try_refresh() < version)
                .count();
            if lagging == 0 {
                return Ok(SyncOutcome::Synced);
            }
            if Instant::now() >= deadline {
                warn!(version, lagging, lease_ms = lease.as_millis() as u64, "schema sync lease expired");
                return Ok(SyncOutcome::LeaseExpired { lagging });
            }
            tokio::select! {
                _ = token.cancelled() => return Err(ShiftError::OwnershipLost),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SchemaSubscriber, SchemaSyncer, SchemaVersionPublisher, SyncOutcome};
    use crate::catalog::schema::{SchemaInfo, SchemaState};
    use crate::error::ShiftError;
    use crate::meta::{Meta, SchemaDiff};
    use crate::storage::kv::{KvStore, MemKvStore};
    use crate::storage::txn::Transaction;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FakeSession {
        pinned: AtomicU64,
        busy: AtomicBool,
        target: u64,
    }

    impl SchemaSubscriber for FakeSession {
        fn pinned_version(&self) -> u64 {
            self.pinned.load(Ordering::Acquire)
        }

        fn try_refresh(&self) -> u64 {
            if !self.busy.load(Ordering::Acquire) {
                self.pinned.store(self.target, Ordering::Release);
            }
            self.pinned_version()
        }
    }

    fn create_schema(store: &Arc<dyn KvStore>, id: i64, name: &str) {
        let mut txn = Transaction::begin(store);
        let mut meta = Meta::new(&mut txn);
        meta.put_schema(&SchemaInfo {
            id,
            name: name.into(),
            state: SchemaState::Public,
        })
        .expect("schema");
        let version = meta.bump_schema_version().expect("bump");
        meta.put_schema_diff(&SchemaDiff {
            version,
            job_id: 0,
            schema_id: id,
            table_ids: Vec::new(),
        })
        .expect("diff");
        txn.commit().expect("commit");
    }

    #[test]
    fn reload_applies_diffs_on_top_of_cache() {
        let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let publisher = SchemaVersionPublisher::new(Arc::clone(&store), 8);
        create_schema(&store, 1, "a");
        let first = publisher.reload().expect("full");
        assert_eq!(first.version, 1);
        create_schema(&store, 2, "b");
        let second = publisher.reload().expect("diff");
        assert_eq!(second.version, 2);
        assert!(second.schema_by_name("a").is_some());
        assert!(second.schema_by_name("b").is_some());
        assert!(first.schema_by_name("b").is_none());
        assert!(Arc::ptr_eq(&second, &publisher.reload().expect("noop")));
    }

    #[tokio::test]
    async fn barrier_waits_for_busy_subscriber() {
        let syncer = SchemaSyncer::new();
        let session = Arc::new(FakeSession {
            pinned: AtomicU64::new(1),
            busy: AtomicBool::new(true),
            target: 2,
        });
        let weak: std::sync::Weak<dyn SchemaSubscriber> =
            Arc::downgrade(&(Arc::clone(&session) as Arc<dyn SchemaSubscriber>));
        syncer.register(weak);

        let token = CancellationToken::new();
        let outcome = syncer
            .wait_synced(2, Duration::from_millis(30), Duration::from_millis(1), &token)
            .await
            .expect("lease bounded");
        assert_eq!(outcome, SyncOutcome::LeaseExpired { lagging: 1 });

        session.busy.store(false, Ordering::Release);
        let outcome = syncer
            .wait_synced(2, Duration::from_secs(1), Duration::from_millis(1), &token)
            .await
            .expect("synced");
        assert_eq!(outcome, SyncOutcome::Synced);
        assert_eq!(syncer.min_pinned_version(), Some(2));

        token.cancel();
        let err = syncer
            .wait_synced(3, Duration::from_secs(1), Duration::from_millis(1), &token)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, ShiftError::OwnershipLost));

        drop(session);
        assert!(syncer.live().is_empty());
    }
}

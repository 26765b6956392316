//! Ownership lease collaborator.
//!
//! At most one node holds the DDL owner lease at a time. Each grant carries
//! an epoch that increases with every new holder.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub node_id: String,
    pub epoch: u64,
    pub expires_at: Instant,
}

pub trait LeaseService: Send + Sync {
    /// Grants the lease to `node_id` if it is free, expired, or already held
    /// by `node_id`.
    fn campaign(&self, node_id: &str, ttl: Duration) -> Option<LeaseGrant>;

    /// Extends a held lease. `false` means the lease is lost.
    fn renew(&self, node_id: &str, epoch: u64, ttl: Duration) -> bool;

    fn release(&self, node_id: &str, epoch: u64);

    fn current_owner(&self) -> Option<LeaseGrant>;
}

#[derive(Debug, Default)]
struct LeaseState {
    holder: Option<LeaseGrant>,
    last_epoch: u64,
}

/// In-process lease shared by every node of a local cluster.
#[derive(Debug, Default)]
pub struct LocalLeaseService {
    state: Mutex<LeaseState>,
}

impl LocalLeaseService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires the current holder immediately, as if it stopped renewing.
    pub fn expire_now(&self) {
        let mut state = self.state.lock();
        if let Some(holder) = state.holder.take() {
            info!(node = %holder.node_id, epoch = holder.epoch, "owner lease force-expired");
        }
    }
}

impl LeaseService for LocalLeaseService {
    fn campaign(&self, node_id: &str, ttl: Duration) -> Option<LeaseGrant> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(holder) = &state.holder {
            if holder.expires_at > now {
                if holder.node_id == node_id {
                    return Some(holder.clone());
                }
                return None;
            }
        }
        state.last_epoch += 1;
        let grant = LeaseGrant {
            node_id: node_id.to_string(),
            epoch: state.last_epoch,
            expires_at: now + ttl,
        };
        state.holder = Some(grant.clone());
        Some(grant)
    }

    fn renew(&self, node_id: &str, epoch: u64, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.holder.as_mut() {
            Some(holder) if holder.node_id == node_id && holder.epoch == epoch && holder.expires_at > now => {
                holder.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    fn release(&self, node_id: &str, epoch: u64) {
        let mut state = self.state.lock();
        if state
            .holder
            .as_ref()
            .is_some_and(|h| h.node_id == node_id && h.epoch == epoch)
        {
            state.holder = None;
        }
    }

    fn current_owner(&self) -> Option<LeaseGrant> {
        let state = self.state.lock();
        state
            .holder
            .as_ref()
            .filter(|h| h.expires_at > Instant::now())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{LeaseService, LocalLeaseService};
    use std::time::Duration;

    #[test]
    fn one_holder_until_expiry() {
        let lease = LocalLeaseService::new();
        let ttl = Duration::from_secs(10);
        let a = lease.campaign("a", ttl).expect("free lease");
        assert!(lease.campaign("b", ttl).is_none());
        assert_eq!(lease.campaign("a", ttl).map(|g| g.epoch), Some(a.epoch));
        assert!(lease.renew("a", a.epoch, ttl));

        lease.expire_now();
        assert!(!lease.renew("a", a.epoch, ttl));
        let b = lease.campaign("b", ttl).expect("expired lease");
        assert!(b.epoch > a.epoch);
        assert_eq!(lease.current_owner().map(|g| g.node_id), Some("b".to_string()));

        lease.release("a", a.epoch);
        assert!(lease.current_owner().is_some());
        lease.release("b", b.epoch);
        assert!(lease.current_owner().is_none());
    }
}

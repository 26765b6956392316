use std::sync::atomic::{AtomicU64, Ordering};

pub type Timestamp = u64;

/// Hands out strictly increasing timestamps for snapshots and commits.
pub trait TimestampOracle: Send + Sync {
    /// Allocates a fresh timestamp greater than every earlier one.
    fn next_ts(&self) -> Timestamp;
    /// Latest allocated timestamp; a snapshot at this point sees every commit so far.
    fn current_ts(&self) -> Timestamp;
    /// Moves the oracle forward after recovery.
    fn advance_to(&self, ts: Timestamp);
}

#[derive(Debug, Default)]
pub struct LocalOracle {
    last: AtomicU64,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampOracle for LocalOracle {
    fn next_ts(&self) -> Timestamp {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn current_ts(&self) -> Timestamp {
        self.last.load(Ordering::Acquire)
    }

    fn advance_to(&self, ts: Timestamp) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::{LocalOracle, TimestampOracle};
    use std::sync::Arc;

    #[test]
    fn timestamps_are_unique_across_threads() {
        let oracle = Arc::new(LocalOracle::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let oracle = Arc::clone(&oracle);
                std::thread::spawn(move || (0..1000).map(|_| oracle.next_ts()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(oracle.current_ts(), 4000);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let oracle = LocalOracle::new();
        oracle.advance_to(50);
        oracle.advance_to(10);
        assert_eq!(oracle.next_ts(), 51);
    }
}

use crate::catalog::Catalog;
use crate::error::ShiftError;
use std::collections::VecDeque;
use std::sync::Arc;

/// Recently published catalog snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct InfoCache {
    versions: VecDeque<Arc<Catalog>>,
    max_versions: usize,
}

impl InfoCache {
    pub fn new(max_versions: usize) -> Self {
        Self {
            versions: VecDeque::new(),
            max_versions: max_versions.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn latest(&self) -> Option<&Arc<Catalog>> {
        self.versions.back()
    }

    pub fn latest_version(&self) -> u64 {
        self.versions.back().map(|c| c.version).unwrap_or(0)
    }

    pub fn oldest_version(&self) -> u64 {
        self.versions.front().map(|c| c.version).unwrap_or(0)
    }

    /// Adds a snapshot. Older or equal versions are ignored so the cache never
    /// goes backwards.
    pub fn publish(&mut self, catalog: Arc<Catalog>) {
        if !self.versions.is_empty() && catalog.version <= self.latest_version() {
            return;
        }
        self.versions.push_back(catalog);
        while self.versions.len() > self.max_versions {
            self.versions.pop_front();
        }
    }

    pub fn get(&self, version: u64) -> Result<Arc<Catalog>, ShiftError> {
        if let Some(found) = self.versions.iter().find(|c| c.version == version) {
            return Ok(Arc::clone(found));
        }
        let oldest = self.oldest_version();
        let newest = self.latest_version();
        if version < oldest {
            return Err(ShiftError::Validation(format!(
                "schema version {version} has been evicted (oldest cached version: {oldest})"
            )));
        }
        Err(ShiftError::Validation(format!(
            "schema version {version} is not cached (latest cached version: {newest})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::InfoCache;
    use crate::catalog::Catalog;
    use std::sync::Arc;

    fn at(version: u64) -> Arc<Catalog> {
        Arc::new(Catalog::empty().apply(version, Vec::new()))
    }

    #[test]
    fn evicts_oldest_and_never_regresses() {
        let mut cache = InfoCache::new(2);
        cache.publish(at(1));
        cache.publish(at(2));
        cache.publish(at(3));
        assert_eq!(cache.oldest_version(), 2);
        assert!(cache.get(1).is_err());
        assert_eq!(cache.get(3).expect("cached").version, 3);

        cache.publish(at(2));
        assert_eq!(cache.latest_version(), 3);
        assert!(cache.get(9).is_err());
    }
}

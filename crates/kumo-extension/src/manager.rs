//! Registry of runtime pools, one per extension.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::ExtensionError;
use crate::pool::{Pool, PoolStats};
use crate::runtime::RuntimeInstance;

/// Owns every extension pool. Created once at startup and shared as
/// `Arc<RuntimeManager>`.
#[derive(Debug)]
pub struct RuntimeManager {
    pool_size: usize,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl RuntimeManager {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Return the pool for `extension_id`, creating it with `initializer`
    /// if none exists. Concurrent callers for the same id all get the same
    /// pool; the initializer of a losing caller is dropped unused.
    pub fn get_or_create_pool<F>(&self, extension_id: &str, initializer: F) -> Arc<Pool>
    where
        F: Fn() -> Result<RuntimeInstance, ExtensionError> + Send + Sync + 'static,
    {
        if let Some(pool) = self.pools.read().get(extension_id) {
            return Arc::clone(pool);
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(extension_id) {
            return Arc::clone(pool);
        }
        let pool = Arc::new(Pool::new(
            extension_id,
            self.pool_size,
            Box::new(initializer),
        ));
        pools.insert(extension_id.to_string(), Arc::clone(&pool));
        debug!(extension = %extension_id, capacity = self.pool_size, "runtime pool created");
        pool
    }

    pub fn pool(&self, extension_id: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(extension_id).cloned()
    }

    /// Tear down and forget one pool.
    pub fn remove_pool(&self, extension_id: &str) -> bool {
        let removed = self.pools.write().remove(extension_id);
        match removed {
            Some(pool) => {
                pool.teardown();
                true
            }
            None => false,
        }
    }

    /// Tear down every pool.
    pub fn teardown_all(&self) {
        let drained: Vec<_> = self.pools.write().drain().collect();
        for (_, pool) in &drained {
            pool.teardown();
        }
        info!(pools = drained.len(), "all runtime pools torn down");
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    /// Per-extension metrics, sorted by id. Each entry is also logged.
    pub fn report(&self) -> Vec<(String, PoolStats)> {
        let mut entries: Vec<(String, PoolStats)> = self
            .pools
            .read()
            .iter()
            .map(|(id, pool)| (id.clone(), pool.stats()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, stats) in &entries {
            info!(
                extension = %id,
                created = stats.created,
                reused = stats.reused,
                errors = stats.errors,
                timeouts = stats.timeouts,
                idle = stats.idle,
                checked_out = stats.checked_out,
                capacity = stats.capacity,
                "extension pool metrics"
            );
        }
        entries
    }
}

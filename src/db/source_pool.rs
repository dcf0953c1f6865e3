use crate::config::DataSourceConfig;
use crate::db::db_pool::{build_pool, DuckDbConnectionManager};
use r2d2::Pool;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Registry handing out one connection pool per data source, keyed by the
/// source id so repeat requests against the same source share connections.
pub struct SourcePoolManager {
    pools: Mutex<HashMap<String, Pool<DuckDbConnectionManager>>>,
}

impl SourcePoolManager {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool_for(
        &self,
        source: &DataSourceConfig,
    ) -> Result<Pool<DuckDbConnectionManager>, r2d2::Error> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(&source.id) {
            return Ok(pool.clone());
        }

        debug!("Creating connection pool for source '{}' at {}", source.id, source.path);
        let pool = build_pool(&source.path, source.pool_size)?;
        pools.insert(source.id.clone(), pool.clone());
        Ok(pool)
    }
}

impl Default for SourcePoolManager {
    fn default() -> Self {
        Self::new()
    }
}

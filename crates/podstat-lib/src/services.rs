//! Shared state of the aggregation engine
//!
//! Built once by the hosting process and handed to the supervisor and every
//! event processor. Readers hold a clone and query the ledger and label
//! index directly.

use crate::cache::ClusterCaches;
use crate::labels::LabelIndex;
use crate::ledger::StatsLedger;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AggregationServices {
    pub cache: Arc<ClusterCaches>,
    pub ledger: Arc<StatsLedger>,
    pub labels: Arc<LabelIndex>,
}

impl AggregationServices {
    /// Fresh services with the given usage cache TTL
    pub fn new(cache_ttl: Duration) -> Self {
        let cache = Arc::new(ClusterCaches::new(cache_ttl));
        Self {
            ledger: Arc::new(StatsLedger::new(cache.clone())),
            labels: Arc::new(LabelIndex::new()),
            cache,
        }
    }
}

impl Default for AggregationServices {
    fn default() -> Self {
        Self::new(crate::cache::DEFAULT_TTL)
    }
}

pub mod limiter;
pub mod store;

pub use limiter::{QuotaConfig, QuotaMetrics, QuotaTracker};
pub use store::{CounterStore, CounterUpdate, InMemoryCounterStore, RedisCounterStore};

/// Outcome of a daily quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub within_quota: bool,
    /// Questions counted for today, including this one when it was admitted
    pub used: u32,
    /// `None` for unlimited plans
    pub limit: Option<u32>,
}

impl QuotaDecision {
    pub fn unlimited() -> Self {
        Self {
            within_quota: true,
            used: 0,
            limit: None,
        }
    }

    pub fn remaining(&self) -> Option<u32> {
        self.limit.map(|limit| limit.saturating_sub(self.used))
    }
}

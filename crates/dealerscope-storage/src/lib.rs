//! Dealer persistence gateway + rate-limited geocoding for DealerScope.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub mod geocode;
pub mod postgres;
pub mod store;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use geocode::{
    CoordinateResolver, GeocodeBackend, GeocodeError, GeocoderConfig, NominatimBackend,
    ResolverStats,
};
pub use postgres::PgDealerStore;
pub use store::{ApplyOutcome, DealerQuery, DealerStore, MemoryDealerStore, StoreError};

pub const CRATE_NAME: &str = "dealerscope-storage";

/// Fixed-delay retry schedule for a failing search term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Whether a failure on zero-based `attempt` may be retried.
    pub fn allows_retry(&self, attempt: usize) -> bool {
        attempt < self.max_retries
    }

    pub fn total_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }
}

/// Enforces a minimum gap between consecutive upstream calls.
///
/// Callers queue on the internal lock, so concurrent callers are spaced out
/// one after another rather than all released at once.
#[derive(Debug)]
pub struct RequestSpacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

//! Persistence gateway contract and the in-memory implementation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealerscope_core::{DealerKey, DealerRecord, ScrapeRunState, Source};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dealer store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("dealer store query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    /// Rows inserted or changed; identical re-upserts count zero.
    pub upserted: u64,
    /// Active rows flipped to inactive.
    pub retired: u64,
    /// Items rejected by the store without aborting the batch.
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DealerQuery {
    pub source: Option<Source>,
    /// Case-insensitive exact match.
    pub city: Option<String>,
    pub with_coordinates_only: bool,
}

#[async_trait]
pub trait DealerStore: Send + Sync {
    /// Creates tables and the identity unique index when missing.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn active_keys(&self, source: Source) -> Result<BTreeSet<DealerKey>, StoreError>;

    /// Upserts `to_upsert` (reactivating them) and soft-retires `to_retire`.
    /// Re-applying the same sets is a no-op.
    async fn apply(
        &self,
        source: Source,
        to_upsert: &[DealerRecord],
        to_retire: &[DealerKey],
    ) -> Result<ApplyOutcome, StoreError>;

    async fn record_run_completed(&self, source: Source, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn run_states(&self) -> Result<Vec<ScrapeRunState>, StoreError>;

    async fn find(&self, query: &DealerQuery) -> Result<Vec<DealerRecord>, StoreError>;

    async fn get(&self, source: Source, key: &DealerKey) -> Result<Option<DealerRecord>, StoreError>;
}

/// Records the store refuses to write: the identity fields must be present.
pub(crate) fn is_writable(record: &DealerRecord) -> bool {
    !record.name.trim().is_empty() && !record.postal_code.trim().is_empty()
}

#[derive(Debug, Default)]
struct MemoryState {
    dealers: BTreeMap<(Source, DealerKey), DealerRecord>,
    runs: BTreeMap<Source, DateTime<Utc>>,
}

/// Store with the same upsert/retire semantics as Postgres, kept in a map.
#[derive(Debug, Default)]
pub struct MemoryDealerStore {
    state: Mutex<MemoryState>,
}

impl MemoryDealerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.dealers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DealerStore for MemoryDealerStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn active_keys(&self, source: Source) -> Result<BTreeSet<DealerKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dealers
            .iter()
            .filter(|((s, _), record)| *s == source && !record.inactive)
            .map(|((_, key), _)| key.clone())
            .collect())
    }

    async fn apply(
        &self,
        source: Source,
        to_upsert: &[DealerRecord],
        to_retire: &[DealerKey],
    ) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let mut outcome = ApplyOutcome::default();

        for record in to_upsert {
            if !is_writable(record) {
                warn!(%source, name = %record.name, "rejecting dealer without identity fields");
                outcome.failed += 1;
                continue;
            }
            let mut incoming = record.clone();
            incoming.source = source;
            incoming.inactive = false;

            let slot = (source, incoming.key());
            if state.dealers.get(&slot) == Some(&incoming) {
                continue;
            }
            state.dealers.insert(slot, incoming);
            outcome.upserted += 1;
        }

        for key in to_retire {
            if let Some(existing) = state.dealers.get_mut(&(source, key.clone())) {
                if !existing.inactive {
                    existing.inactive = true;
                    outcome.retired += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn record_run_completed(&self, source: Source, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.state.lock().await.runs.insert(source, at);
        Ok(())
    }

    async fn run_states(&self) -> Result<Vec<ScrapeRunState>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .map(|(source, at)| ScrapeRunState {
                source: *source,
                last_updated: *at,
            })
            .collect())
    }

    async fn find(&self, query: &DealerQuery) -> Result<Vec<DealerRecord>, StoreError> {
        let state = self.state.lock().await;
        let city = query.city.as_deref().map(|c| c.trim().to_lowercase());
        Ok(state
            .dealers
            .values()
            .filter(|r| query.source.map_or(true, |s| r.source == s))
            .filter(|r| {
                city.as_deref()
                    .map_or(true, |c| r.city.trim().to_lowercase() == c)
            })
            .filter(|r| !query.with_coordinates_only || r.coordinates().is_some())
            .cloned()
            .collect())
    }

    async fn get(&self, source: Source, key: &DealerKey) -> Result<Option<DealerRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .dealers
            .get(&(source, key.clone()))
            .cloned())
    }
}

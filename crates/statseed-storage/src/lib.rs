//! Relational store contract, its PostgreSQL and in-memory backends, and shared HTTP fetch
//! utilities.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use statseed_core::{
    EntityType, Event, Follower, ParseEnumError, PendingDelivery, PercentileCounts, PercentilePair,
    Sport, StatRecord,
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchedResponse, HttpClient,
    HttpClientConfig, HttpError, RetryDisposition,
};
pub use memory::MemorySeedStore;
pub use postgres::PgSeedStore;

pub const CRATE_NAME: &str = "statseed-storage";

/// Exclusive hold on one (sport, season) percentile scope.
///
/// Archive, recalculate and change detection all read or rewrite the season's single
/// snapshot, so callers hold this for the whole sequence. Dropping without `release`
/// still frees it: a local guard unlocks and an open transaction rolls back.
pub enum SeasonLock {
    Local(OwnedMutexGuard<()>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

impl SeasonLock {
    pub async fn release(self) -> Result<(), StoreError> {
        match self {
            SeasonLock::Local(_) => Ok(()),
            SeasonLock::Postgres(tx) => {
                tx.commit().await?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for SeasonLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeasonLock::Local(_) => f.write_str("SeasonLock::Local"),
            SeasonLock::Postgres(_) => f.write_str("SeasonLock::Postgres"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("decoding stored value: {0}")]
    Decode(#[from] ParseEnumError),
    #[error("{0}")]
    Message(String),
}

/// Every store operation the seeding and notification pipeline depends on.
///
/// Implementations must make `claim_due_deliveries` safe under concurrent callers,
/// including callers in other processes: a row handed to one caller is not handed
/// to another until its lease expires.
#[async_trait]
pub trait SeedStore: Send + Sync {
    /// Events not yet seeded, below the retry ceiling, that started at or before `started_before`.
    /// Oldest first, at most `limit` rows.
    async fn find_pending_events(
        &self,
        sport: Option<Sport>,
        limit: usize,
        max_retries: u32,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError>;

    async fn load_event(&self, id: i64) -> Result<Option<Event>, StoreError>;

    /// Sets status `seeded` and clears retry bookkeeping.
    async fn mark_seeded(&self, id: i64) -> Result<(), StoreError>;

    /// Sets status `failed`, increments the retry counter and stores the error text.
    async fn record_failure(&self, id: i64, error: &str) -> Result<(), StoreError>;

    /// Overwrite-safe write of one entity's statistic line. Returns statistic rows written.
    async fn upsert_stat_record(&self, record: &StatRecord) -> Result<usize, StoreError>;

    /// Waits until no other caller, in this process or another, holds the season.
    async fn lock_season(&self, sport: Sport, season: &str) -> Result<SeasonLock, StoreError>;

    async fn archive_percentile_snapshot(&self, sport: Sport, season: &str)
        -> Result<u64, StoreError>;

    async fn recalculate_percentiles(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<PercentileCounts, StoreError>;

    async fn percentile_pairs(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<Vec<PercentilePair>, StoreError>;

    async fn find_followers(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
    ) -> Result<Vec<Follower>, StoreError>;

    async fn insert_pending_delivery(&self, delivery: &PendingDelivery) -> Result<(), StoreError>;

    /// Reserve up to `limit` due, unclaimed `pending` deliveries for `lease`.
    async fn claim_due_deliveries(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingDelivery>, StoreError>;

    async fn active_device_tokens(&self, subscriber_id: Uuid) -> Result<Vec<String>, StoreError>;

    async fn deactivate_device_tokens(&self, tokens: &[String]) -> Result<u64, StoreError>;

    /// Returns false when the delivery had already left `pending`.
    async fn mark_delivery_sent(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Returns false when the delivery had already left `pending`.
    async fn mark_delivery_failed(&self, id: Uuid, reason: &str) -> Result<bool, StoreError>;
}

/// `PERCENT_RANK() * 100` of `value` within `sorted`: share of the other values strictly below it.
pub fn percent_rank(sorted: &[f64], value: f64) -> f64 {
    if sorted.len() <= 1 {
        return 0.0;
    }
    let below = sorted.partition_point(|v| *v < value);
    below as f64 * 100.0 / (sorted.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rank_matches_postgres_semantics() {
        let values = [1.0, 2.0, 2.0, 3.0, 5.0];
        assert_eq!(percent_rank(&values, 1.0), 0.0);
        assert_eq!(percent_rank(&values, 2.0), 25.0);
        assert_eq!(percent_rank(&values, 3.0), 75.0);
        assert_eq!(percent_rank(&values, 5.0), 100.0);
        assert_eq!(percent_rank(&[4.0], 4.0), 0.0);
    }
}

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use statseed_adapters::{AdapterError, AdapterRegistry, ProviderAdapter, StatVisitor};
use statseed_core::{
    EntityType, Event, Follower, PendingDelivery, PercentileCounts, PercentilePair, SeasonType,
    SeedStatus, Sport, StatRecord,
};
use statseed_notify::{PushError, PushGateway, PushReport};
use statseed_storage::{MemorySeedStore, SeasonLock, SeedStore, StoreError};
use statseed_sync::{ProcessRequest, SeedConfig, SeedRuntime};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Wraps the in-memory store. Yields before every call, the way a networked database
/// suspends, and fails `mark_seeded` for chosen events.
struct FaultyStore {
    inner: Arc<MemorySeedStore>,
    mark_seeded_fails_for: HashSet<i64>,
}

impl FaultyStore {
    fn new(inner: Arc<MemorySeedStore>) -> Self {
        Self {
            inner,
            mark_seeded_fails_for: HashSet::new(),
        }
    }

    fn failing_mark_seeded(mut self, event_id: i64) -> Self {
        self.mark_seeded_fails_for.insert(event_id);
        self
    }
}

#[async_trait]
impl SeedStore for FaultyStore {
    async fn find_pending_events(
        &self,
        sport: Option<Sport>,
        limit: usize,
        max_retries: u32,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        tokio::task::yield_now().await;
        self.inner
            .find_pending_events(sport, limit, max_retries, started_before)
            .await
    }

    async fn load_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.load_event(id).await
    }

    async fn mark_seeded(&self, id: i64) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        if self.mark_seeded_fails_for.contains(&id) {
            return Err(StoreError::Message("connection reset by peer".into()));
        }
        self.inner.mark_seeded(id).await
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.record_failure(id, error).await
    }

    async fn upsert_stat_record(&self, record: &StatRecord) -> Result<usize, StoreError> {
        tokio::task::yield_now().await;
        self.inner.upsert_stat_record(record).await
    }

    async fn lock_season(&self, sport: Sport, season: &str) -> Result<SeasonLock, StoreError> {
        tokio::task::yield_now().await;
        self.inner.lock_season(sport, season).await
    }

    async fn archive_percentile_snapshot(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        self.inner.archive_percentile_snapshot(sport, season).await
    }

    async fn recalculate_percentiles(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<PercentileCounts, StoreError> {
        tokio::task::yield_now().await;
        self.inner.recalculate_percentiles(sport, season).await
    }

    async fn percentile_pairs(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<Vec<PercentilePair>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.percentile_pairs(sport, season).await
    }

    async fn find_followers(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
    ) -> Result<Vec<Follower>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.find_followers(entity_type, entity_id, sport).await
    }

    async fn insert_pending_delivery(&self, delivery: &PendingDelivery) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.insert_pending_delivery(delivery).await
    }

    async fn claim_due_deliveries(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingDelivery>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.claim_due_deliveries(limit, lease).await
    }

    async fn active_device_tokens(&self, subscriber_id: Uuid) -> Result<Vec<String>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.active_device_tokens(subscriber_id).await
    }

    async fn deactivate_device_tokens(&self, tokens: &[String]) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        self.inner.deactivate_device_tokens(tokens).await
    }

    async fn mark_delivery_sent(&self, id: Uuid) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner.mark_delivery_sent(id).await
    }

    async fn mark_delivery_failed(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner.mark_delivery_failed(id, reason).await
    }
}

const LEBRON: i64 = 23;

/// 100 other players at 1..=100 points per 36 and LeBron at 91.5, which ranks him at 91.
struct SeasonAdapter;

#[async_trait]
impl ProviderAdapter for SeasonAdapter {
    fn sport(&self) -> Sport {
        Sport::Nba
    }

    async fn fetch_player_stats(
        &self,
        season: &str,
        season_type: SeasonType,
        visitor: &mut dyn StatVisitor,
    ) -> Result<(), AdapterError> {
        let line = |id: i64, name: String, value: f64| StatRecord {
            entity_type: EntityType::Player,
            entity_id: id,
            entity_name: name,
            team_id: None,
            sport: Sport::Nba,
            season: season.to_string(),
            season_type,
            stats: BTreeMap::from([("points_per_36".to_string(), value)]),
        };
        for i in 1..=100 {
            visitor
                .visit(line(1000 + i, format!("Player {i}"), i as f64))
                .await?;
        }
        visitor
            .visit(line(LEBRON, "LeBron James".into(), 91.5))
            .await
    }

    async fn fetch_team_stats(
        &self,
        _season: &str,
        _season_type: SeasonType,
    ) -> Result<Vec<StatRecord>, AdapterError> {
        Ok(Vec::new())
    }
}

struct NoopGateway;

#[async_trait]
impl PushGateway for NoopGateway {
    async fn send_multi(
        &self,
        tokens: &[String],
        _title: &str,
        _body: &str,
    ) -> Result<PushReport, PushError> {
        Ok(PushReport {
            sent: tokens.len(),
            invalid_tokens: Vec::new(),
        })
    }
}

fn event(id: i64, league: &str) -> Event {
    Event {
        id,
        sport: Sport::Nba,
        season: "2025".into(),
        season_type: SeasonType::Regular,
        league: league.into(),
        home_team_id: 14,
        away_team_id: 10,
        starts_at: Utc::now() - chrono::Duration::hours(12),
        status: SeedStatus::Pending,
        retry_count: 0,
        last_error: None,
    }
}

fn runtime(store: FaultyStore) -> SeedRuntime {
    SeedRuntime::assemble(
        SeedConfig::default(),
        Arc::new(store),
        AdapterRegistry::new().with_adapter(Arc::new(SeasonAdapter)),
        Arc::new(NoopGateway),
    )
}

fn request(workers: usize) -> ProcessRequest {
    ProcessRequest {
        sport: Some(Sport::Nba),
        limit: 100,
        max_retries: 3,
        workers,
        recalc_percentiles: true,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_leagues_in_one_season_notify_each_follower_once() {
    let inner = Arc::new(MemorySeedStore::new());
    inner.insert_event(event(1, "standard")).await;
    inner.insert_event(event(2, "summer")).await;
    inner
        .set_percentile(
            EntityType::Player,
            LEBRON,
            Sport::Nba,
            "2025",
            "points_per_36",
            85.0,
        )
        .await;
    inner
        .insert_follower(
            EntityType::Player,
            LEBRON,
            Sport::Nba,
            Follower {
                subscriber_id: Uuid::new_v4(),
                timezone: "UTC".into(),
            },
        )
        .await;

    let runtime = runtime(FaultyStore::new(inner.clone()));
    let outcome = runtime
        .fanout
        .process_pending(&request(2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, 2, "{:?}", outcome.errors);
    assert_eq!(
        inner
            .percentile(
                EntityType::Player,
                LEBRON,
                Sport::Nba,
                "2025",
                "points_per_36",
            )
            .await,
        Some(91.0)
    );
    let deliveries = inner.deliveries().await;
    assert_eq!(deliveries.len(), 1, "{deliveries:?}");
    assert_eq!(
        deliveries[0].message,
        "LeBron James reached the 91st percentile in Points/36"
    );
}

#[tokio::test]
async fn failing_to_mark_seeded_counts_a_retry() {
    let inner = Arc::new(MemorySeedStore::new());
    inner.insert_event(event(1, "standard")).await;
    let runtime = runtime(FaultyStore::new(inner.clone()).failing_mark_seeded(1));

    let outcome = runtime.orchestrator.seed_event(1, true).await;
    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("marking seeded: connection reset by peer")
    );

    let stored = inner.event(1).await.unwrap();
    assert_eq!(stored.status, SeedStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("marking seeded: connection reset by peer")
    );
}

#[tokio::test]
async fn failing_to_mark_seeded_stops_at_the_retry_ceiling() {
    let inner = Arc::new(MemorySeedStore::new());
    inner.insert_event(event(1, "standard")).await;
    let runtime = runtime(FaultyStore::new(inner.clone()).failing_mark_seeded(1));
    let cancel = CancellationToken::new();

    let mut found = Vec::new();
    for _ in 0..4 {
        found.push(
            runtime
                .fanout
                .process_pending(&request(1), &cancel)
                .await
                .unwrap()
                .events_found,
        );
    }

    assert_eq!(found, vec![1, 1, 1, 0]);
    assert_eq!(inner.event(1).await.unwrap().retry_count, 3);
}

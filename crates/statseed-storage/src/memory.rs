use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use statseed_core::{
    DeliveryStatus, EntityType, Event, Follower, PendingDelivery, PercentileCounts,
    PercentilePair, PercentileSnapshot, SeedStatus, Sport, StatRecord,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{percent_rank, SeasonLock, SeedStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct StatKey {
    entity_type: EntityType,
    entity_id: i64,
    sport: Sport,
    season: String,
    stat_name: String,
}

#[derive(Debug, Clone)]
struct DeliveryRow {
    delivery: PendingDelivery,
    claim_token: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<i64, Event>,
    entity_names: HashMap<(EntityType, i64, Sport), String>,
    stat_values: BTreeMap<StatKey, f64>,
    percentiles: BTreeMap<StatKey, f64>,
    snapshots: BTreeMap<StatKey, PercentileSnapshot>,
    followers: Vec<(EntityType, i64, Sport, Follower)>,
    device_tokens: Vec<(Uuid, String, bool)>,
    deliveries: Vec<DeliveryRow>,
}

/// In-process store with the same semantics as [`crate::PgSeedStore`].
///
/// Used by tests and dry runs. Every operation takes the single state lock, which also
/// makes delivery claiming exclusive between concurrent callers in this process.
#[derive(Debug, Default)]
pub struct MemorySeedStore {
    state: Mutex<MemoryState>,
    seasons: Mutex<HashMap<(Sport, String), Arc<Mutex<()>>>>,
}

impl MemorySeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: Event) {
        self.state.lock().await.events.insert(event.id, event);
    }

    pub async fn event(&self, id: i64) -> Option<Event> {
        self.state.lock().await.events.get(&id).cloned()
    }

    pub async fn insert_follower(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
        follower: Follower,
    ) {
        self.state
            .lock()
            .await
            .followers
            .push((entity_type, entity_id, sport, follower));
    }

    pub async fn insert_device_token(&self, subscriber_id: Uuid, token: impl Into<String>) {
        self.state
            .lock()
            .await
            .device_tokens
            .push((subscriber_id, token.into(), true));
    }

    /// Writes a current percentile directly, as a previous recalculation would have.
    pub async fn set_percentile(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
        season: &str,
        stat_name: &str,
        percentile: f64,
    ) {
        let key = StatKey {
            entity_type,
            entity_id,
            sport,
            season: season.to_string(),
            stat_name: stat_name.to_string(),
        };
        self.state.lock().await.percentiles.insert(key, percentile);
    }

    pub async fn percentile(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
        season: &str,
        stat_name: &str,
    ) -> Option<f64> {
        let key = StatKey {
            entity_type,
            entity_id,
            sport,
            season: season.to_string(),
            stat_name: stat_name.to_string(),
        };
        self.state.lock().await.percentiles.get(&key).copied()
    }

    pub async fn stat_row_count(&self) -> usize {
        self.state.lock().await.stat_values.len()
    }

    pub async fn deliveries(&self) -> Vec<PendingDelivery> {
        self.state
            .lock()
            .await
            .deliveries
            .iter()
            .map(|row| row.delivery.clone())
            .collect()
    }

    pub async fn active_token_count(&self) -> usize {
        self.state
            .lock()
            .await
            .device_tokens
            .iter()
            .filter(|(_, _, active)| *active)
            .count()
    }
}

#[async_trait]
impl SeedStore for MemorySeedStore {
    async fn find_pending_events(
        &self,
        sport: Option<Sport>,
        limit: usize,
        max_retries: u32,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        let mut events = state
            .events
            .values()
            .filter(|e| e.status != SeedStatus::Seeded)
            .filter(|e| e.retry_count < max_retries)
            .filter(|e| e.starts_at <= started_before)
            .filter(|e| sport.map_or(true, |s| e.sport == s))
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by_key(|e| (e.starts_at, e.id));
        events.truncate(limit);
        Ok(events)
    }

    async fn load_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        Ok(self.state.lock().await.events.get(&id).cloned())
    }

    async fn mark_seeded(&self, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("event {id}")))?;
        event.status = SeedStatus::Seeded;
        event.retry_count = 0;
        event.last_error = None;
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("event {id}")))?;
        event.status = SeedStatus::Failed;
        event.retry_count += 1;
        event.last_error = Some(error.to_string());
        Ok(())
    }

    async fn upsert_stat_record(&self, record: &StatRecord) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.entity_names.insert(
            (record.entity_type, record.entity_id, record.sport),
            record.entity_name.clone(),
        );
        for (stat_name, value) in &record.stats {
            let key = StatKey {
                entity_type: record.entity_type,
                entity_id: record.entity_id,
                sport: record.sport,
                season: record.season.clone(),
                stat_name: stat_name.clone(),
            };
            state.stat_values.insert(key, *value);
        }
        Ok(record.stats.len())
    }

    async fn lock_season(&self, sport: Sport, season: &str) -> Result<SeasonLock, StoreError> {
        let lock = self
            .seasons
            .lock()
            .await
            .entry((sport, season.to_string()))
            .or_default()
            .clone();
        Ok(SeasonLock::Local(lock.lock_owned().await))
    }

    async fn archive_percentile_snapshot(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let current = state
            .percentiles
            .iter()
            .filter(|(key, _)| key.sport == sport && key.season == season)
            .map(|(key, value)| (key.clone(), *value))
            .collect::<Vec<_>>();
        let archived = current.len() as u64;
        for (key, percentile) in current {
            let snapshot = PercentileSnapshot {
                entity_type: key.entity_type,
                entity_id: key.entity_id,
                sport: key.sport,
                stat_name: key.stat_name.clone(),
                season: key.season.clone(),
                percentile,
                archived_at: now,
            };
            state.snapshots.insert(key, snapshot);
        }
        Ok(archived)
    }

    async fn recalculate_percentiles(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<PercentileCounts, StoreError> {
        let mut state = self.state.lock().await;

        let mut groups: BTreeMap<(EntityType, String), Vec<(StatKey, f64)>> = BTreeMap::new();
        for (key, value) in &state.stat_values {
            if key.sport == sport && key.season == season {
                groups
                    .entry((key.entity_type, key.stat_name.clone()))
                    .or_default()
                    .push((key.clone(), *value));
            }
        }

        let mut players = HashSet::new();
        let mut teams = HashSet::new();
        for rows in groups.into_values() {
            let mut sorted = rows.iter().map(|(_, v)| *v).collect::<Vec<_>>();
            sorted.sort_by(|a, b| a.total_cmp(b));
            for (key, value) in rows {
                match key.entity_type {
                    EntityType::Player => players.insert(key.entity_id),
                    EntityType::Team => teams.insert(key.entity_id),
                };
                state.percentiles.insert(key, percent_rank(&sorted, value));
            }
        }

        Ok(PercentileCounts {
            players_updated: players.len(),
            teams_updated: teams.len(),
        })
    }

    async fn percentile_pairs(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<Vec<PercentilePair>, StoreError> {
        let state = self.state.lock().await;
        let pairs = state
            .percentiles
            .iter()
            .filter(|(key, _)| key.sport == sport && key.season == season)
            .map(|(key, current)| PercentilePair {
                entity_type: key.entity_type,
                entity_id: key.entity_id,
                entity_name: state
                    .entity_names
                    .get(&(key.entity_type, key.entity_id, key.sport))
                    .cloned()
                    .unwrap_or_else(|| format!("{} {}", key.entity_type, key.entity_id)),
                sport: key.sport,
                season: key.season.clone(),
                stat_name: key.stat_name.clone(),
                previous: state.snapshots.get(key).map(|s| s.percentile),
                current: *current,
            })
            .collect();
        Ok(pairs)
    }

    async fn find_followers(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
    ) -> Result<Vec<Follower>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .followers
            .iter()
            .filter(|(t, id, s, _)| *t == entity_type && *id == entity_id && *s == sport)
            .map(|(_, _, _, follower)| follower.clone())
            .collect())
    }

    async fn insert_pending_delivery(&self, delivery: &PendingDelivery) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.deliveries.iter().any(|row| row.delivery.id == delivery.id) {
            return Err(StoreError::Message(format!(
                "delivery {} already exists",
                delivery.id
            )));
        }
        state.deliveries.push(DeliveryRow {
            delivery: delivery.clone(),
            claim_token: None,
            claimed_until: None,
        });
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingDelivery>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Message(format!("invalid claim lease: {e}")))?;
        let token = Uuid::new_v4();

        let mut due = state
            .deliveries
            .iter_mut()
            .filter(|row| row.delivery.status == DeliveryStatus::Pending)
            .filter(|row| row.delivery.deliver_at <= now)
            .filter(|row| row.claimed_until.map_or(true, |until| until < now))
            .collect::<Vec<_>>();
        due.sort_by_key(|row| row.delivery.deliver_at);

        let mut claimed = Vec::new();
        for row in due.into_iter().take(limit) {
            row.claim_token = Some(token);
            row.claimed_until = Some(now + lease);
            claimed.push(row.delivery.clone());
        }
        Ok(claimed)
    }

    async fn active_device_tokens(&self, subscriber_id: Uuid) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .device_tokens
            .iter()
            .filter(|(owner, _, active)| *owner == subscriber_id && *active)
            .map(|(_, token, _)| token.clone())
            .collect())
    }

    async fn deactivate_device_tokens(&self, tokens: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for (_, token, active) in state.device_tokens.iter_mut() {
            if *active && tokens.contains(token) {
                *active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_delivery_sent(&self, id: Uuid) -> Result<bool, StoreError> {
        self.finalize_delivery(id, DeliveryStatus::Sent, None).await
    }

    async fn mark_delivery_failed(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
        self.finalize_delivery(id, DeliveryStatus::Failed, Some(reason))
            .await
    }
}

impl MemorySeedStore {
    async fn finalize_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .deliveries
            .iter_mut()
            .find(|row| row.delivery.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {id}")))?;
        if row.delivery.status != DeliveryStatus::Pending {
            return Ok(false);
        }
        row.delivery.status = status;
        row.delivery.failure_reason = reason.map(str::to_string);
        row.claim_token = None;
        row.claimed_until = None;
        Ok(true)
    }
}

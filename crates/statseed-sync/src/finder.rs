use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use statseed_core::{Event, Sport};
use statseed_storage::{SeedStore, StoreError};
use tracing::debug;

/// Read-only lookup of events whose statistics are due for a refresh.
#[derive(Clone)]
pub struct PendingWorkFinder {
    store: Arc<dyn SeedStore>,
    min_delay: Duration,
}

impl PendingWorkFinder {
    pub fn new(store: Arc<dyn SeedStore>, min_delay_minutes: i64) -> Self {
        Self {
            store,
            min_delay: Duration::minutes(min_delay_minutes.max(0)),
        }
    }

    pub async fn find_pending(
        &self,
        sport: Option<Sport>,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<Event>, StoreError> {
        self.find_pending_at(sport, limit, max_retries, Utc::now()).await
    }

    /// Events not yet seeded, below `max_retries`, whose start plus the minimum delay is at or
    /// before `now`.
    pub async fn find_pending_at(
        &self,
        sport: Option<Sport>,
        limit: usize,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let started_before = now - self.min_delay;
        let mut events = self
            .store
            .find_pending_events(sport, limit, max_retries, started_before)
            .await?;
        events.truncate(limit);
        debug!(sport = ?sport, limit, max_retries, found = events.len(), "pending events");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use statseed_core::{SeasonType, SeedStatus};
    use statseed_storage::MemorySeedStore;

    fn event(id: i64, sport: Sport, hours_ago: i64, status: SeedStatus, retry_count: u32) -> Event {
        Event {
            id,
            sport,
            season: "2025".into(),
            season_type: SeasonType::Regular,
            league: "standard".into(),
            home_team_id: 1,
            away_team_id: 2,
            starts_at: now() - Duration::hours(hours_ago),
            status,
            retry_count,
            last_error: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
    }

    async fn finder() -> PendingWorkFinder {
        let store = Arc::new(MemorySeedStore::new());
        store.insert_event(event(1, Sport::Nba, 10, SeedStatus::Pending, 0)).await;
        store.insert_event(event(2, Sport::Nba, 1, SeedStatus::Pending, 0)).await;
        store.insert_event(event(3, Sport::Nba, 10, SeedStatus::Seeded, 0)).await;
        store.insert_event(event(4, Sport::Nba, 20, SeedStatus::Failed, 3)).await;
        store.insert_event(event(5, Sport::Nba, 20, SeedStatus::Failed, 2)).await;
        store.insert_event(event(6, Sport::Nhl, 30, SeedStatus::Pending, 0)).await;
        PendingWorkFinder::new(store, 180)
    }

    #[tokio::test]
    async fn respects_status_delay_and_retry_ceiling() {
        let finder = finder().await;
        let events = finder.find_pending_at(None, 10, 3, now()).await.unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![6, 5, 1]);
    }

    #[tokio::test]
    async fn retry_ceiling_is_exclusive() {
        let finder = finder().await;
        let events = finder.find_pending_at(Some(Sport::Nba), 10, 2, now()).await.unwrap();
        assert!(events.iter().all(|e| e.retry_count < 2));
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn limit_bounds_the_result() {
        let finder = finder().await;
        assert_eq!(
            finder.find_pending_at(None, 2, 3, now()).await.unwrap().len(),
            2
        );
        assert!(finder.find_pending_at(None, 0, 3, now()).await.unwrap().is_empty());
    }
}

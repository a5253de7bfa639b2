use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use statseed_core::{BatchOutcome, Event, GroupKey, Sport};
use statseed_storage::SeedStore;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SeedConfig;
use crate::finder::PendingWorkFinder;
use crate::orchestrator::SeedOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub sport: Option<Sport>,
    pub limit: usize,
    pub max_retries: u32,
    pub workers: usize,
    pub recalc_percentiles: bool,
}

impl ProcessRequest {
    pub fn from_config(config: &SeedConfig) -> Self {
        Self {
            sport: None,
            limit: config.batch_limit,
            max_retries: config.max_retries,
            workers: config.workers,
            recalc_percentiles: true,
        }
    }
}

/// Events that share one upstream fetch. Only the representative is seeded.
#[derive(Debug, Clone)]
pub struct EventGroup {
    pub key: GroupKey,
    pub representative: Event,
    pub siblings: Vec<Event>,
}

impl EventGroup {
    pub fn event_count(&self) -> usize {
        1 + self.siblings.len()
    }
}

/// Partitions by (sport, season, league). The oldest event of each group represents it.
pub fn group_events(events: Vec<Event>) -> Vec<EventGroup> {
    let mut by_key: BTreeMap<GroupKey, Vec<Event>> = BTreeMap::new();
    for event in events {
        by_key.entry(event.group_key()).or_default().push(event);
    }
    by_key
        .into_iter()
        .filter_map(|(key, mut members)| {
            members.sort_by_key(|e| (e.starts_at, e.id));
            let mut members = members.into_iter();
            let representative = members.next()?;
            Some(EventGroup {
                key,
                representative,
                siblings: members.collect(),
            })
        })
        .collect()
}

/// Bounded fan-out of pending groups over a fixed worker pool.
#[derive(Clone)]
pub struct FanOutScheduler {
    store: Arc<dyn SeedStore>,
    finder: PendingWorkFinder,
    orchestrator: Arc<SeedOrchestrator>,
}

impl FanOutScheduler {
    pub fn new(
        store: Arc<dyn SeedStore>,
        finder: PendingWorkFinder,
        orchestrator: Arc<SeedOrchestrator>,
    ) -> Self {
        Self {
            store,
            finder,
            orchestrator,
        }
    }

    /// Fails only when the pending-work query fails. Group failures land in `errors`.
    pub async fn process_pending(
        &self,
        request: &ProcessRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<BatchOutcome> {
        let events = self
            .finder
            .find_pending(request.sport, request.limit, request.max_retries)
            .await
            .context("finding pending events")?;

        let events_found = events.len();
        let groups = group_events(events);
        if groups.is_empty() {
            info!("no pending events");
            return Ok(BatchOutcome::default());
        }

        let workers = request.workers.clamp(1, groups.len());
        info!(
            events = events_found,
            groups = groups.len(),
            workers,
            "processing pending events"
        );

        let (tx, rx) = mpsc::channel(groups.len());
        for group in groups {
            tx.send(group).await.context("queueing event group")?;
        }
        drop(tx);

        let queue = Arc::new(Mutex::new(rx));
        let aggregate = Arc::new(Mutex::new(BatchOutcome {
            events_found,
            ..Default::default()
        }));

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let queue = queue.clone();
            let aggregate = aggregate.clone();
            let cancel = cancel.clone();
            let this = self.clone();
            let recalc = request.recalc_percentiles;
            pool.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().await.recv().await;
                    let Some(group) = next else { break };
                    let outcome = this.run_group(worker, group, recalc, &cancel).await;
                    aggregate.lock().await.merge(outcome);
                }
            });
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "seeding worker aborted");
                aggregate
                    .lock()
                    .await
                    .errors
                    .push(format!("seeding worker aborted: {err}"));
            }
        }

        let outcome = aggregate.lock().await.clone();
        info!(
            found = outcome.events_found,
            processed = outcome.events_processed,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            entities = outcome.entities_updated,
            "batch complete"
        );
        Ok(outcome)
    }

    async fn run_group(
        &self,
        worker: usize,
        group: EventGroup,
        recalc: bool,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let representative = group.representative.id;
        let seeded = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = self.orchestrator.seed_event(representative, recalc) => Some(outcome),
        };
        let Some(seeded) = seeded else {
            warn!(worker, group = %group.key, event_id = representative, "seeding cancelled");
            return BatchOutcome {
                errors: vec![format!("event {representative}: cancelled")],
                ..Default::default()
            };
        };

        let mut outcome = BatchOutcome {
            events_processed: group.event_count(),
            entities_updated: seeded.entities_updated(),
            ..Default::default()
        };
        let representative_error = seeded.error.clone().unwrap_or_default();
        let sibling_error = format!("event {representative}: {representative_error}");

        for sibling in &group.siblings {
            let marked = if seeded.success {
                self.store.mark_seeded(sibling.id).await
            } else {
                self.store.record_failure(sibling.id, &sibling_error).await
            };
            if let Err(err) = marked {
                warn!(event_id = sibling.id, error = %err, "updating sibling event failed");
                outcome.errors.push(format!("event {}: {err}", sibling.id));
            }
        }

        if seeded.success {
            outcome.succeeded = group.event_count();
        } else {
            outcome.failed = group.event_count();
            outcome.errors.insert(0, sibling_error);
        }
        info!(
            worker,
            group = %group.key,
            event_id = representative,
            siblings = group.siblings.len(),
            success = seeded.success,
            "group processed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use statseed_core::{SeasonType, SeedStatus};

    fn event(id: i64, league: &str, hours: i64) -> Event {
        Event {
            id,
            sport: Sport::Nba,
            season: "2025".into(),
            season_type: SeasonType::Regular,
            league: league.into(),
            home_team_id: 1,
            away_team_id: 2,
            starts_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours),
            status: SeedStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn groups_pick_the_oldest_representative() {
        let groups = group_events(vec![
            event(3, "standard", 5),
            event(1, "standard", 9),
            event(2, "summer", 1),
            event(4, "standard", 2),
        ]);
        assert_eq!(groups.len(), 2);
        let standard = groups.iter().find(|g| g.key.league == "standard").unwrap();
        assert_eq!(standard.representative.id, 4);
        assert_eq!(
            standard.siblings.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![3, 1]
        );
        assert_eq!(standard.event_count(), 3);
    }

    #[test]
    fn empty_input_has_no_groups() {
        assert!(group_events(Vec::new()).is_empty());
    }
}

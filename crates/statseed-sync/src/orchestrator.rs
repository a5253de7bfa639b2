use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use statseed_adapters::{AdapterError, AdapterRegistry, StatVisitor};
use statseed_core::{EntityType, Event, SeedOutcome, StatRecord};
use statseed_notify::NotificationPipeline;
use statseed_storage::{SeasonLock, SeedStore};
use tracing::{debug, error, info, instrument, warn};

/// Collects failures of best-effort steps. They are logged and surfaced as warnings, never as
/// the outcome's error.
struct AdvisoryLog {
    event_id: i64,
    warnings: Vec<String>,
}

impl AdvisoryLog {
    fn new(event_id: i64) -> Self {
        Self {
            event_id,
            warnings: Vec::new(),
        }
    }

    fn record(&mut self, step: &'static str, err: impl Display) {
        warn!(event_id = self.event_id, step, error = %err, "advisory step failed");
        self.warnings.push(format!("{step}: {err}"));
    }
}

/// Upsert layer behind the adapter's streaming callback. Row failures are collected and the
/// stream keeps going.
struct UpsertVisitor<'a> {
    store: &'a dyn SeedStore,
    players: usize,
    teams: usize,
    stat_rows: usize,
    errors: Vec<String>,
}

impl<'a> UpsertVisitor<'a> {
    fn new(store: &'a dyn SeedStore) -> Self {
        Self {
            store,
            players: 0,
            teams: 0,
            stat_rows: 0,
            errors: Vec::new(),
        }
    }

    async fn upsert(&mut self, record: &StatRecord) {
        match self.store.upsert_stat_record(record).await {
            Ok(rows) => {
                self.stat_rows += rows;
                match record.entity_type {
                    EntityType::Player => self.players += 1,
                    EntityType::Team => self.teams += 1,
                }
            }
            Err(err) => self.errors.push(format!(
                "upserting {} {}: {err}",
                record.entity_type, record.entity_id
            )),
        }
    }
}

#[async_trait]
impl StatVisitor for UpsertVisitor<'_> {
    async fn visit(&mut self, record: StatRecord) -> Result<(), AdapterError> {
        self.upsert(&record).await;
        Ok(())
    }
}

async fn release_season(lock: Option<SeasonLock>, advisory: &mut AdvisoryLog) {
    if let Some(lock) = lock {
        if let Err(err) = lock.release().await {
            advisory.record("release_season_lock", err);
        }
    }
}

/// Drives one event through fetch, upsert, archive, recalculate, mark and notify.
pub struct SeedOrchestrator {
    store: Arc<dyn SeedStore>,
    adapters: Arc<AdapterRegistry>,
    notifier: Option<NotificationPipeline>,
}

impl SeedOrchestrator {
    pub fn new(store: Arc<dyn SeedStore>, adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            store,
            adapters,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: NotificationPipeline) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[instrument(skip(self))]
    pub async fn seed_event(&self, event_id: i64, recalc_percentiles: bool) -> SeedOutcome {
        let started = Instant::now();
        let event = match self.store.load_event(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                let error = format!("event {event_id} not found");
                return SeedOutcome::failed(event_id, error, started.elapsed());
            }
            Err(err) => {
                let error = format!("loading event {event_id}: {err}");
                return SeedOutcome::failed(event_id, error, started.elapsed());
            }
        };

        let mut outcome = SeedOutcome::new(event_id);
        let mut advisory = AdvisoryLog::new(event_id);

        let adapter = match self.adapters.require(event.sport) {
            Ok(adapter) => adapter,
            Err(err) => {
                self.fail(&event, &mut outcome, vec![err.to_string()]).await;
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        let mut visitor = UpsertVisitor::new(self.store.as_ref());
        let mut errors = Vec::new();
        if let Err(err) = adapter
            .fetch_player_stats(&event.season, event.season_type, &mut visitor)
            .await
        {
            errors.push(format!("fetching player stats: {err}"));
        }
        match adapter.fetch_team_stats(&event.season, event.season_type).await {
            Ok(teams) => {
                for team in &teams {
                    visitor.upsert(team).await;
                }
            }
            Err(err) => errors.push(format!("fetching team stats: {err}")),
        }
        outcome.players_updated = visitor.players;
        outcome.teams_updated = visitor.teams;
        outcome.stat_rows = visitor.stat_rows;
        errors.extend(visitor.errors);

        if !errors.is_empty() {
            self.fail(&event, &mut outcome, errors).await;
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        // Held from archive through notify so concurrent groups of one season see one diff.
        let season_lock = if recalc_percentiles && outcome.stat_rows > 0 {
            match self.store.lock_season(event.sport, &event.season).await {
                Ok(lock) => Some(lock),
                Err(err) => {
                    advisory.record("lock_season", err);
                    None
                }
            }
        } else {
            None
        };

        if season_lock.is_some() {
            if let Err(err) = self
                .store
                .archive_percentile_snapshot(event.sport, &event.season)
                .await
            {
                advisory.record("archive_percentile_snapshot", err);
            }
            match self
                .store
                .recalculate_percentiles(event.sport, &event.season)
                .await
            {
                Ok(counts) => {
                    outcome.percentiles_recalculated = true;
                    debug!(
                        event_id,
                        players = counts.players_updated,
                        teams = counts.teams_updated,
                        "percentiles recalculated"
                    );
                }
                Err(err) => advisory.record("recalculate_percentiles", err),
            }
        }

        if let Err(err) = self.store.mark_seeded(event_id).await {
            let error = format!("marking seeded: {err}");
            self.fail(&event, &mut outcome, vec![error]).await;
            release_season(season_lock, &mut advisory).await;
            outcome.warnings = advisory.warnings;
            outcome.elapsed = started.elapsed();
            return outcome;
        }
        outcome.success = true;

        if outcome.percentiles_recalculated {
            if let Some(notifier) = &self.notifier {
                if let Err(err) = notifier.notify_event(event_id).await {
                    advisory.record("notify", err);
                }
            }
        }
        release_season(season_lock, &mut advisory).await;

        outcome.warnings = advisory.warnings;
        outcome.elapsed = started.elapsed();
        info!(
            event_id,
            sport = %event.sport,
            season = %event.season,
            players = outcome.players_updated,
            teams = outcome.teams_updated,
            stat_rows = outcome.stat_rows,
            recalculated = outcome.percentiles_recalculated,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "event seeded"
        );
        outcome
    }

    async fn fail(&self, event: &Event, outcome: &mut SeedOutcome, errors: Vec<String>) {
        let message = errors.join("; ");
        warn!(event_id = event.id, sport = %event.sport, error = %message, "seeding failed");
        if let Err(err) = self.store.record_failure(event.id, &message).await {
            error!(event_id = event.id, error = %err, "recording failure failed");
        }
        outcome.success = false;
        outcome.error = Some(message);
    }
}

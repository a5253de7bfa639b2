use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use statseed_storage::{SeedStore, StoreError};
use tracing::{info, instrument, warn};

use crate::delivery::DeliveryScheduler;
use crate::detector::ChangeDetector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub changes: usize,
    pub deliveries_created: usize,
    pub failures: usize,
}

/// Detect -> resolve followers -> schedule -> persist, for one freshly seeded event.
#[derive(Clone)]
pub struct NotificationPipeline {
    store: Arc<dyn SeedStore>,
    detector: ChangeDetector,
    scheduler: DeliveryScheduler,
}

impl NotificationPipeline {
    pub fn new(store: Arc<dyn SeedStore>) -> Self {
        Self {
            detector: ChangeDetector::new(store.clone()),
            scheduler: DeliveryScheduler::new(),
            store,
        }
    }

    pub fn with_scheduler(mut self, scheduler: DeliveryScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Fails only when change detection itself fails. Follower lookups and inserts are
    /// per change and per delivery; their errors are logged and counted.
    #[instrument(skip(self))]
    pub async fn notify_event(&self, event_id: i64) -> Result<NotifyReport, StoreError> {
        let changes = self.detector.detect_changes(event_id).await?;
        let mut report = NotifyReport {
            changes: changes.len(),
            ..Default::default()
        };

        for change in &changes {
            let followers = match self
                .store
                .find_followers(change.entity_type, change.entity_id, change.sport)
                .await
            {
                Ok(followers) => followers,
                Err(err) => {
                    warn!(
                        entity_id = change.entity_id,
                        stat = %change.stat_name,
                        error = %err,
                        "follower lookup failed"
                    );
                    report.failures += 1;
                    continue;
                }
            };
            if followers.is_empty() {
                continue;
            }

            let deliveries = {
                let mut rng = rand::thread_rng();
                self.scheduler.schedule_delivery(change, &followers, Utc::now(), &mut rng)
            };
            for delivery in &deliveries {
                match self.store.insert_pending_delivery(delivery).await {
                    Ok(()) => report.deliveries_created += 1,
                    Err(err) => {
                        warn!(
                            delivery_id = %delivery.id,
                            subscriber_id = %delivery.subscriber_id,
                            error = %err,
                            "pending delivery insert failed"
                        );
                        report.failures += 1;
                    }
                }
            }
        }

        info!(
            changes = report.changes,
            deliveries = report.deliveries_created,
            failures = report.failures,
            "notification pipeline finished"
        );
        Ok(report)
    }
}

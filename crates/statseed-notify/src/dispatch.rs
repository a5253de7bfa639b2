use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use statseed_core::PendingDelivery;
use statseed_storage::{SeedStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::push::PushGateway;

pub const NO_ACTIVE_DEVICES: &str = "no active devices";
pub const ALL_TOKENS_REJECTED: &str = "all device tokens rejected";

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub interval: Duration,
    pub batch_limit: usize,
    pub lease: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_limit: 100,
            lease: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Claimed rows another worker finalized first, or left for lease expiry after a store error.
    pub skipped: usize,
    pub tokens_deactivated: u64,
}

/// Claims due deliveries and pushes them. Safe to run in several processes at once: the
/// store's claim hands each row to a single caller.
pub struct DispatchWorker {
    store: Arc<dyn SeedStore>,
    gateway: Arc<dyn PushGateway>,
    config: DispatchConfig,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn SeedStore>,
        gateway: Arc<dyn PushGateway>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Ticks every `interval` until `cancel` fires. Tick failures are logged and the loop
    /// continues.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "dispatch worker started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.tick(&cancel).await {
                Ok(report) if report.claimed > 0 => info!(?report, "dispatch tick"),
                Ok(_) => debug!("no due deliveries"),
                Err(err) => error!(error = %err, "dispatch tick failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("dispatch worker stopped");
    }

    /// One claim-and-send pass. Once `cancel` fires, the in-flight push is abandoned and the
    /// remaining claimed rows are left for their lease to expire.
    #[instrument(skip(self, cancel))]
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<DispatchReport, StoreError> {
        let claimed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DispatchReport::default()),
            claimed = self
                .store
                .claim_due_deliveries(self.config.batch_limit, self.config.lease) => claimed?,
        };
        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        for (index, delivery) in claimed.iter().enumerate() {
            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = self.deliver(delivery, &mut report) => true,
            };
            if !finished {
                let abandoned = claimed.len() - index;
                info!(abandoned, "dispatch cancelled; claims left to expire");
                report.skipped += abandoned;
                break;
            }
        }
        Ok(report)
    }

    async fn deliver(&self, delivery: &PendingDelivery, report: &mut DispatchReport) {
        let tokens = match self.store.active_device_tokens(delivery.subscriber_id).await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(
                    delivery_id = %delivery.id,
                    error = %err,
                    "device lookup failed; leaving claim to expire"
                );
                report.skipped += 1;
                return;
            }
        };
        if tokens.is_empty() {
            self.finalize(delivery, Some(NO_ACTIVE_DEVICES), report).await;
            return;
        }

        match self
            .gateway
            .send_multi(&tokens, &delivery.title, &delivery.message)
            .await
        {
            Ok(push) => {
                if !push.invalid_tokens.is_empty() {
                    match self.store.deactivate_device_tokens(&push.invalid_tokens).await {
                        Ok(count) => report.tokens_deactivated += count,
                        Err(err) => warn!(error = %err, "deactivating rejected tokens failed"),
                    }
                }
                let reason = (push.sent == 0).then_some(ALL_TOKENS_REJECTED);
                self.finalize(delivery, reason, report).await;
            }
            Err(err) => {
                let reason = err.to_string();
                self.finalize(delivery, Some(reason.as_str()), report).await;
            }
        }
    }

    async fn finalize(
        &self,
        delivery: &PendingDelivery,
        failure: Option<&str>,
        report: &mut DispatchReport,
    ) {
        let result = match failure {
            None => self.store.mark_delivery_sent(delivery.id).await,
            Some(reason) => self.store.mark_delivery_failed(delivery.id, reason).await,
        };
        match result {
            Ok(true) if failure.is_none() => report.sent += 1,
            Ok(true) => report.failed += 1,
            Ok(false) => {
                debug!(delivery_id = %delivery.id, "delivery already finalized");
                report.skipped += 1;
            }
            Err(err) => {
                warn!(
                    delivery_id = %delivery.id,
                    error = %err,
                    "recording delivery outcome failed"
                );
                report.skipped += 1;
            }
        }
    }
}

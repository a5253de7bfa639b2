//! Percentile change detection, waking-hours delivery scheduling, and push dispatch.

mod delivery;
mod detector;
mod dispatch;
mod pipeline;
mod push;

pub use delivery::{
    compose_message, resolve_timezone, DeliveryScheduler, JITTER_HOURS, WAKING_END_HOUR,
    WAKING_START_HOUR,
};
pub use detector::{classify, crossed_milestone, ChangeDetector, LARGE_DELTA, MILESTONES};
pub use dispatch::{
    DispatchConfig, DispatchReport, DispatchWorker, ALL_TOKENS_REJECTED, NO_ACTIVE_DEVICES,
};
pub use pipeline::{NotificationPipeline, NotifyReport};
pub use push::{HttpPushGateway, PushError, PushGateway, PushReport};

pub const CRATE_NAME: &str = "statseed-notify";

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use statseed_core::{
    ordinal, stat_display_name, Change, DeliveryStatus, Follower, PendingDelivery,
};
use tracing::warn;
use uuid::Uuid;

pub const WAKING_START_HOUR: u32 = 9;
pub const WAKING_END_HOUR: u32 = 22;
pub const JITTER_HOURS: i64 = 12;

/// Turns a significant change into per-follower deliveries inside each follower's waking hours.
///
/// Pure: nothing here touches the store. `deliver_at` is `now` pushed forward to the next
/// waking-window opening when needed, plus a uniform jitter that never runs past the window's
/// close on that local day.
#[derive(Debug, Clone)]
pub struct DeliveryScheduler {
    window_start: NaiveTime,
    window_end: NaiveTime,
    jitter: Duration,
}

impl Default for DeliveryScheduler {
    fn default() -> Self {
        Self {
            window_start: NaiveTime::from_hms_opt(WAKING_START_HOUR, 0, 0).unwrap_or_default(),
            window_end: NaiveTime::from_hms_opt(WAKING_END_HOUR, 0, 0).unwrap_or_default(),
            jitter: Duration::hours(JITTER_HOURS),
        }
    }
}

impl DeliveryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter.max(Duration::zero());
        self
    }

    pub fn schedule_delivery<R: Rng>(
        &self,
        change: &Change,
        followers: &[Follower],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Vec<PendingDelivery> {
        let (title, message) = compose_message(change);
        followers
            .iter()
            .map(|follower| {
                let tz = resolve_timezone(&follower.timezone);
                PendingDelivery {
                    id: Uuid::new_v4(),
                    subscriber_id: follower.subscriber_id,
                    title: title.clone(),
                    message: message.clone(),
                    entity_type: change.entity_type,
                    entity_id: change.entity_id,
                    sport: change.sport,
                    deliver_at: self.deliver_at(now, tz, rng),
                    status: DeliveryStatus::Pending,
                    failure_reason: None,
                    created_at: now,
                }
            })
            .collect()
    }

    pub fn deliver_at<R: Rng>(&self, now: DateTime<Utc>, tz: Tz, rng: &mut R) -> DateTime<Utc> {
        let start = self.window_opening(now, tz);
        let local_start = start.with_timezone(&tz);
        let close = local_at(tz, local_start.date_naive(), self.window_end).with_timezone(&Utc);

        let room = (close - start).min(self.jitter);
        let room_ms = room.num_milliseconds();
        if room_ms <= 0 {
            return start;
        }
        start + Duration::milliseconds(rng.gen_range(0..room_ms))
    }

    /// `now` if it is already inside the local waking window, otherwise the next opening.
    pub fn window_opening(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = now.with_timezone(&tz);
        let time = local.time();
        let date = local.date_naive();
        if time < self.window_start {
            local_at(tz, date, self.window_start).with_timezone(&Utc)
        } else if time >= self.window_end {
            let next = date.succ_opt().unwrap_or(date);
            local_at(tz, next, self.window_start).with_timezone(&Utc)
        } else {
            now
        }
    }
}

/// Unknown zone names fall back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = name, "unknown follower timezone; using UTC");
            Tz::UTC
        }
    }
}

fn local_at(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => at,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Skipped by a DST jump; the first valid instant after the gap.
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    }
}

/// Title and body for a change, e.g. "LeBron James reached the 95th percentile in Points/36".
pub fn compose_message(change: &Change) -> (String, String) {
    let rank = ordinal(change.new_percentile.clamp(0.0, 100.0).floor() as u32);
    let stat = stat_display_name(&change.stat_name);
    let verb = if change.delta() < 0.0 {
        "dropped to"
    } else if change.crossing {
        "reached"
    } else {
        "climbed to"
    };
    let message = format!(
        "{} {verb} the {rank} percentile in {stat}",
        change.entity_name
    );
    let title = if change.crossing {
        format!("{} · Milestone", change.entity_name)
    } else {
        change.entity_name.clone()
    };
    (title, message)
}

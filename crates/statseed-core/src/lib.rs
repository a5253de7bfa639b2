//! Core domain model for statseed: events, statistic records, percentile changes and deliveries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "statseed-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Supported leagues. Anything outside this set is rejected when configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sport {
    Nba,
    Wnba,
    Nfl,
    Mlb,
    Nhl,
}

impl Sport {
    pub const ALL: [Sport; 5] = [Sport::Nba, Sport::Wnba, Sport::Nfl, Sport::Mlb, Sport::Nhl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Nba => "NBA",
            Sport::Wnba => "WNBA",
            Sport::Nfl => "NFL",
            Sport::Mlb => "MLB",
            Sport::Nhl => "NHL",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sport {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sport::ALL
            .into_iter()
            .find(|sport| sport.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError::new("sport", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonType {
    Regular,
    Post,
}

impl SeasonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeasonType::Regular => "regular",
            SeasonType::Post => "post",
        }
    }
}

impl fmt::Display for SeasonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeasonType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Ok(SeasonType::Regular),
            "post" | "postseason" | "playoffs" => Ok(SeasonType::Post),
            _ => Err(ParseEnumError::new("season type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Player,
    Team,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Player => "player",
            EntityType::Team => "team",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "player" => Ok(EntityType::Player),
            "team" => Ok(EntityType::Team),
            _ => Err(ParseEnumError::new("entity type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStatus {
    Pending,
    Seeded,
    Failed,
}

impl SeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedStatus::Pending => "pending",
            SeedStatus::Seeded => "seeded",
            SeedStatus::Failed => "failed",
        }
    }
}

impl FromStr for SeedStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(SeedStatus::Pending),
            "seeded" => Ok(SeedStatus::Seeded),
            "failed" => Ok(SeedStatus::Failed),
            _ => Err(ParseEnumError::new("seed status", s)),
        }
    }
}

/// A scheduled fixture whose participants' statistics are refreshed once it has concluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub sport: Sport,
    pub season: String,
    pub season_type: SeasonType,
    pub league: String,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub starts_at: DateTime<Utc>,
    pub status: SeedStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Event {
    /// Events sharing this key need the same upstream fetch.
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            sport: self.sport,
            season: self.season.clone(),
            league: self.league.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupKey {
    pub sport: Sport,
    pub season: String,
    pub league: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.sport, self.season, self.league)
    }
}

/// Normalized statistic line handed from a provider adapter to the upsert layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub entity_name: String,
    pub team_id: Option<i64>,
    pub sport: Sport,
    pub season: String,
    pub season_type: SeasonType,
    pub stats: BTreeMap<String, f64>,
}

/// Result of a single seeding attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedOutcome {
    pub event_id: i64,
    pub players_updated: usize,
    pub teams_updated: usize,
    pub stat_rows: usize,
    pub percentiles_recalculated: bool,
    pub success: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis() as u64)
}

impl SeedOutcome {
    pub fn new(event_id: i64) -> Self {
        Self {
            event_id,
            players_updated: 0,
            teams_updated: 0,
            stat_rows: 0,
            percentiles_recalculated: false,
            success: false,
            error: None,
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(event_id: i64, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            error: Some(error.into()),
            elapsed,
            ..Self::new(event_id)
        }
    }

    pub fn entities_updated(&self) -> usize {
        self.players_updated + self.teams_updated
    }
}

/// Aggregate over every event touched by one `process_pending` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub events_found: usize,
    pub events_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub entities_updated: usize,
    pub errors: Vec<String>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.events_found += other.events_found;
        self.events_processed += other.events_processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.entities_updated += other.entities_updated;
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PercentileCounts {
    pub players_updated: usize,
    pub teams_updated: usize,
}

/// Archived percentile value, keyed by (entity type, entity id, sport, statistic, season).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileSnapshot {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub sport: Sport,
    pub stat_name: String,
    pub season: String,
    pub percentile: f64,
    pub archived_at: DateTime<Utc>,
}

/// Current percentile next to its archived predecessor, if one exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentilePair {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub entity_name: String,
    pub sport: Sport,
    pub season: String,
    pub stat_name: String,
    pub previous: Option<f64>,
    pub current: f64,
}

/// A significant percentile move. Consumed immediately by delivery scheduling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub entity_name: String,
    pub sport: Sport,
    pub season: String,
    pub stat_name: String,
    pub old_percentile: f64,
    pub new_percentile: f64,
    pub crossing: bool,
}

impl Change {
    pub fn delta(&self) -> f64 {
        self.new_percentile - self.old_percentile
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follower {
    pub subscriber_id: Uuid,
    pub timezone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(ParseEnumError::new("delivery status", s)),
        }
    }
}

/// Durable unit of notification work. Moves `pending -> sent | failed` exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub title: String,
    pub message: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub sport: Sport,
    pub deliver_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// English ordinal: 1st, 2nd, 3rd, 11th, 22nd, 95th.
pub fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// Human label for a statistic key, e.g. `points_per_36` -> `Points/36`.
pub fn stat_display_name(stat_name: &str) -> String {
    let known = match stat_name {
        "points_per_36" => Some("Points/36"),
        "rebounds_per_36" => Some("Rebounds/36"),
        "assists_per_36" => Some("Assists/36"),
        "true_shooting_pct" => Some("True Shooting %"),
        "usage_rate" => Some("Usage Rate"),
        "net_rating" => Some("Net Rating"),
        "passer_rating" => Some("Passer Rating"),
        "yards_per_attempt" => Some("Yards/Attempt"),
        "ops" => Some("OPS"),
        "era" => Some("ERA"),
        "war" => Some("WAR"),
        "save_pct" => Some("Save %"),
        "points_per_60" => Some("Points/60"),
        _ => None,
    };
    if let Some(label) = known {
        return label.to_string();
    }

    stat_name
        .split(['_', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

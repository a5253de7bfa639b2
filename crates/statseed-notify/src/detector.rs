use std::sync::Arc;

use statseed_core::{Change, PercentilePair};
use statseed_storage::{SeedStore, StoreError};
use tracing::debug;

/// Percentile boundaries whose crossing, in either direction, is always significant.
pub const MILESTONES: [f64; 3] = [90.0, 95.0, 99.0];

/// Minimum absolute move, in percentile points, that is significant without a crossing.
pub const LARGE_DELTA: f64 = 10.0;

/// Highest milestone crossed between `old` and `new`, if any.
pub fn crossed_milestone(old: f64, new: f64) -> Option<f64> {
    MILESTONES
        .iter()
        .rev()
        .copied()
        .find(|&threshold| {
            (old < threshold && threshold <= new) || (old >= threshold && threshold > new)
        })
}

pub fn classify(pair: &PercentilePair) -> Option<Change> {
    let old = pair.previous?;
    let new = pair.current;
    let crossing = crossed_milestone(old, new).is_some();
    if !crossing && (new - old).abs() < LARGE_DELTA {
        return None;
    }
    Some(Change {
        entity_type: pair.entity_type,
        entity_id: pair.entity_id,
        entity_name: pair.entity_name.clone(),
        sport: pair.sport,
        season: pair.season.clone(),
        stat_name: pair.stat_name.clone(),
        old_percentile: old,
        new_percentile: new,
        crossing,
    })
}

/// Diffs the current percentiles of an event's sport/season against the archived snapshot.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn SeedStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn SeedStore>) -> Self {
        Self { store }
    }

    pub async fn detect_changes(&self, event_id: i64) -> Result<Vec<Change>, StoreError> {
        let event = self
            .store
            .load_event(event_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))?;

        let pairs = self.store.percentile_pairs(event.sport, &event.season).await?;
        let compared = pairs.len();
        let changes: Vec<Change> = pairs.iter().filter_map(classify).collect();
        debug!(
            event_id,
            sport = %event.sport,
            season = %event.season,
            compared,
            significant = changes.len(),
            "percentile diff complete"
        );
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statseed_core::{EntityType, Sport};

    fn pair(previous: Option<f64>, current: f64) -> PercentilePair {
        PercentilePair {
            entity_type: EntityType::Player,
            entity_id: 23,
            entity_name: "LeBron James".into(),
            sport: Sport::Nba,
            season: "2025".into(),
            stat_name: "points_per_36".into(),
            previous,
            current,
        }
    }

    #[test]
    fn crossing_ninetieth_is_a_milestone() {
        let change = classify(&pair(Some(88.0), 92.0)).expect("significant");
        assert!(change.crossing);
        assert_eq!(change.old_percentile, 88.0);
        assert_eq!(change.new_percentile, 92.0);
    }

    #[test]
    fn large_delta_without_crossing_is_significant() {
        let change = classify(&pair(Some(40.0), 52.0)).expect("significant");
        assert!(!change.crossing);
        assert_eq!(change.delta(), 12.0);
    }

    #[test]
    fn small_moves_are_ignored() {
        assert!(classify(&pair(Some(40.0), 45.0)).is_none());
        assert!(classify(&pair(Some(60.0), 61.0)).is_none());
    }

    #[test]
    fn first_observation_never_qualifies() {
        assert!(classify(&pair(None, 99.5)).is_none());
    }

    #[test]
    fn downward_crossings_count() {
        assert_eq!(crossed_milestone(95.0, 94.0), Some(95.0));
        assert_eq!(crossed_milestone(99.0, 89.0), Some(99.0));
        assert_eq!(crossed_milestone(90.0, 90.0), None);
        assert!(classify(&pair(Some(90.0), 89.5)).expect("significant").crossing);
    }

    #[test]
    fn exact_threshold_counts_as_reached() {
        assert_eq!(crossed_milestone(89.9, 90.0), Some(90.0));
        assert!(classify(&pair(Some(40.0), 50.0)).is_some());
    }
}

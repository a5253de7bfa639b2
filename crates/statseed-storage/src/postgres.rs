use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use statseed_core::{
    EntityType, Event, Follower, PendingDelivery, PercentileCounts, PercentilePair, Sport,
    StatRecord,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{SeasonLock, SeedStore, StoreError};

const EVENT_COLUMNS: &str = "id, sport, season, season_type, league, home_team_id, away_team_id, \
     starts_at, seed_status, retry_count, last_error";

const DELIVERY_COLUMNS: &str = "id, subscriber_id, title, message, entity_type, entity_id, sport, \
     deliver_at, status, failure_reason, created_at";

/// PostgreSQL-backed store. Delivery claiming uses `FOR UPDATE SKIP LOCKED` plus a lease
/// column so concurrent dispatchers in separate processes never share a row.
#[derive(Debug, Clone)]
pub struct PgSeedStore {
    pool: PgPool,
}

impl PgSeedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: row.try_get("id")?,
        sport: row.try_get::<String, _>("sport")?.parse()?,
        season: row.try_get("season")?,
        season_type: row.try_get::<String, _>("season_type")?.parse()?,
        league: row.try_get("league")?,
        home_team_id: row.try_get("home_team_id")?,
        away_team_id: row.try_get("away_team_id")?,
        starts_at: row.try_get("starts_at")?,
        status: row.try_get::<String, _>("seed_status")?.parse()?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        last_error: row.try_get("last_error")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<PendingDelivery, StoreError> {
    Ok(PendingDelivery {
        id: row.try_get("id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        entity_type: row.try_get::<String, _>("entity_type")?.parse()?,
        entity_id: row.try_get("entity_id")?,
        sport: row.try_get::<String, _>("sport")?.parse()?,
        deliver_at: row.try_get("deliver_at")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl SeedStore for PgSeedStore {
    #[instrument(skip(self))]
    async fn find_pending_events(
        &self,
        sport: Option<Sport>,
        limit: usize,
        max_retries: u32,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE seed_status <> 'seeded'
              AND retry_count < $1
              AND starts_at <= $2
              AND ($3::text IS NULL OR sport = $3)
            ORDER BY starts_at, id
            LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(max_retries as i32)
            .bind(started_before)
            .bind(sport.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn load_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn mark_seeded(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET seed_status = 'seeded', retry_count = 0, last_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET seed_status = 'failed',
                retry_count = retry_count + 1,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn upsert_stat_record(&self, record: &StatRecord) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO entities (entity_type, entity_id, sport, name, team_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (entity_type, entity_id, sport)
            DO UPDATE SET name = EXCLUDED.name, team_id = EXCLUDED.team_id, updated_at = NOW()
            "#,
        )
        .bind(record.entity_type.as_str())
        .bind(record.entity_id)
        .bind(record.sport.as_str())
        .bind(&record.entity_name)
        .bind(record.team_id)
        .execute(&mut *tx)
        .await?;

        for (stat_name, value) in &record.stats {
            sqlx::query(
                r#"
                INSERT INTO stat_values
                    (entity_type, entity_id, sport, season, season_type, stat_name, value,
                     updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (entity_type, entity_id, sport, season, stat_name)
                DO UPDATE SET value = EXCLUDED.value,
                              season_type = EXCLUDED.season_type,
                              updated_at = NOW()
                "#,
            )
            .bind(record.entity_type.as_str())
            .bind(record.entity_id)
            .bind(record.sport.as_str())
            .bind(&record.season)
            .bind(record.season_type.as_str())
            .bind(stat_name)
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(record.stats.len())
    }

    #[instrument(skip(self))]
    async fn lock_season(&self, sport: Sport, season: &str) -> Result<SeasonLock, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("statseed:percentiles:{}:{season}", sport.as_str()))
            .execute(&mut *tx)
            .await?;
        debug!("season lock acquired");
        Ok(SeasonLock::Postgres(tx))
    }

    #[instrument(skip(self))]
    async fn archive_percentile_snapshot(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO percentile_snapshots
                (entity_type, entity_id, sport, stat_name, season, percentile, archived_at)
            SELECT entity_type, entity_id, sport, stat_name, season, percentile, NOW()
            FROM stat_percentiles
            WHERE sport = $1 AND season = $2
            ON CONFLICT (entity_type, entity_id, sport, stat_name, season)
            DO UPDATE SET percentile = EXCLUDED.percentile, archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(sport.as_str())
        .bind(season)
        .execute(&self.pool)
        .await?;
        debug!(
            rows = result.rows_affected(),
            "archived percentile snapshot"
        );
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn recalculate_percentiles(
        &self,
        sport: Sport,
        season: &str,
    ) -> Result<PercentileCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT entity_type, entity_id, sport, season, stat_name,
                       PERCENT_RANK() OVER (
                           PARTITION BY entity_type, stat_name
                           ORDER BY value
                       ) * 100 AS percentile
                FROM stat_values
                WHERE sport = $1 AND season = $2
            )
            INSERT INTO stat_percentiles
                (entity_type, entity_id, sport, season, stat_name, percentile, computed_at)
            SELECT entity_type, entity_id, sport, season, stat_name, percentile, NOW()
            FROM ranked
            ON CONFLICT (entity_type, entity_id, sport, season, stat_name)
            DO UPDATE SET percentile = EXCLUDED.percentile, computed_at = EXCLUDED.computed_at
            RETURNING entity_type, entity_id
            "#,
        )
        .bind(sport.as_str())
        .bind(season)
        .fetch_all(&self.pool)
        .await?;

        let mut players = HashSet::new();
        let mut teams = HashSet::new();
        for row in &rows {
            let entity_type: EntityType = row.try_get::<String, _>("entity_type")?.parse()?;
            let entity_id: i64 = row.try_get("entity_id")?;
            match entity_type {
                EntityType::Player => players.insert(entity_id),
                EntityType::Team => teams.insert(entity_id),
            };
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
        let rows = sqlx::query(
            r#"
            SELECT p.entity_type, p.entity_id,
                   COALESCE(e.name, p.entity_type || ' ' || p.entity_id) AS name,
                   p.stat_name, s.percentile AS previous, p.percentile AS current
            FROM stat_percentiles p
            LEFT JOIN entities e
              ON e.entity_type = p.entity_type AND e.entity_id = p.entity_id AND e.sport = p.sport
            LEFT JOIN percentile_snapshots s
              ON s.entity_type = p.entity_type
             AND s.entity_id = p.entity_id
             AND s.sport = p.sport
             AND s.stat_name = p.stat_name
             AND s.season = p.season
            WHERE p.sport = $1 AND p.season = $2
            "#,
        )
        .bind(sport.as_str())
        .bind(season)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PercentilePair, StoreError> {
                Ok(PercentilePair {
                    entity_type: row.try_get::<String, _>("entity_type")?.parse()?,
                    entity_id: row.try_get("entity_id")?,
                    entity_name: row.try_get("name")?,
                    sport,
                    season: season.to_string(),
                    stat_name: row.try_get("stat_name")?,
                    previous: row.try_get("previous")?,
                    current: row.try_get("current")?,
                })
            })
            .collect()
    }

    async fn find_followers(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        sport: Sport,
    ) -> Result<Vec<Follower>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT f.subscriber_id, s.timezone
            FROM followers f
            JOIN subscribers s ON s.id = f.subscriber_id
            WHERE f.entity_type = $1 AND f.entity_id = $2 AND f.sport = $3
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(sport.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Follower, StoreError> {
                Ok(Follower {
                    subscriber_id: row.try_get("subscriber_id")?,
                    timezone: row.try_get("timezone")?,
                })
            })
            .collect()
    }

    async fn insert_pending_delivery(&self, delivery: &PendingDelivery) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pending_deliveries
                (id, subscriber_id, title, message, entity_type, entity_id, sport,
                 deliver_at, status, failure_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.subscriber_id)
        .bind(&delivery.title)
        .bind(&delivery.message)
        .bind(delivery.entity_type.as_str())
        .bind(delivery.entity_id)
        .bind(delivery.sport.as_str())
        .bind(delivery.deliver_at)
        .bind(delivery.status.as_str())
        .bind(&delivery.failure_reason)
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_due_deliveries(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PendingDelivery>, StoreError> {
        // The row lock held by the CTE plus SKIP LOCKED keeps two concurrent claimers off the
        // same row; the lease keeps it reserved after the transaction commits.
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM pending_deliveries
                WHERE status = 'pending'
                  AND deliver_at <= NOW()
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY deliver_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE pending_deliveries d
            SET claim_token = $2,
                claimed_until = NOW() + make_interval(secs => $3)
            FROM claimable c
            WHERE d.id = c.id
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
                .split(", ")
                .map(|column| format!("d.{column}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(Uuid::new_v4())
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = rows.iter().map(delivery_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|d| d.deliver_at);
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due deliveries");
        }
        Ok(claimed)
    }

    async fn active_device_tokens(&self, subscriber_id: Uuid) -> Result<Vec<String>, StoreError> {
        let tokens = sqlx::query_scalar::<_, String>(
            "SELECT token FROM device_tokens WHERE subscriber_id = $1 AND active",
        )
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn deactivate_device_tokens(&self, tokens: &[String]) -> Result<u64, StoreError> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE device_tokens SET active = FALSE, updated_at = NOW()
            WHERE token = ANY($1) AND active
            "#,
        )
        .bind(tokens)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_delivery_sent(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_deliveries
            SET status = 'sent', claim_token = NULL, claimed_until = NULL, finalized_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_delivery_failed(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_deliveries
            SET status = 'failed', failure_reason = $2, claim_token = NULL, claimed_until = NULL,
                finalized_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

//! PostgreSQL-backed Counter Store and Alarm Registry.
//!
//! [`PgStateStore`] wraps a `PgPool`. A cycle's changes are written inside a
//! single transaction; any failing statement drops the transaction, which
//! rolls back everything written before it.

mod telemetry;

pub use telemetry::PgTelemetrySource;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pvwatch_core::config::PostgresConfig;
use pvwatch_core::{
    Alarm, Counter, CycleChanges, DetectionKey, EntityId, RuleType, Severity,
};

use crate::error::StorageError;
use crate::traits::{AlarmOperations, StateStore};

const ALARM_COLUMNS: &str = "id, plant_id, inverter_id, rule_type, severity, problem_detail,
                             message, triggered_at, cleared_at, observation";

// ── Row types ────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct AlarmRow {
    id: Uuid,
    plant_id: String,
    inverter_id: String,
    rule_type: String,
    severity: String,
    problem_detail: String,
    message: String,
    triggered_at: DateTime<Utc>,
    cleared_at: Option<DateTime<Utc>>,
    observation: Option<String>,
}

impl TryFrom<AlarmRow> for Alarm {
    type Error = StorageError;

    fn try_from(row: AlarmRow) -> Result<Self, Self::Error> {
        let rule: RuleType = row.rule_type.parse()?;
        let severity: Severity = row.severity.parse()?;
        Ok(Alarm {
            id: row.id,
            key: DetectionKey::new(
                EntityId::new(row.plant_id, row.inverter_id),
                rule,
                row.problem_detail,
            ),
            severity,
            message: row.message,
            triggered_at: row.triggered_at,
            cleared_at: row.cleared_at,
            observation: row.observation,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CounterRow {
    plant_id: String,
    inverter_id: String,
    rule_type: String,
    problem_detail: String,
    count: i32,
    last_detected_at: DateTime<Utc>,
}

fn alarms_from_rows(rows: Vec<AlarmRow>) -> Result<Vec<Alarm>, StorageError> {
    rows.into_iter().map(Alarm::try_from).collect()
}

/// Map a unique-index violation on open alarms to a domain error.
fn map_open_conflict(e: sqlx::Error, key: &DetectionKey) -> StorageError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::AlarmAlreadyOpen(key.to_string());
        }
    }
    StorageError::Database(e)
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the configured credentials and apply migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StorageError> {
        if !config.is_configured() {
            return Err(StorageError::NotConfigured(
                "PG_USERNAME is not set".to_string(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, db = %config.database, "PostgreSQL connected");

        sqlx::migrate!("../../migrations").run(&pool).await?;
        info!("Database migrations applied successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_alarm(
        tx: &mut Transaction<'_, Postgres>,
        alarm_id: Uuid,
    ) -> Result<Alarm, StorageError> {
        let row = sqlx::query_as::<_, AlarmRow>(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE id = $1 FOR UPDATE"
        ))
        .bind(alarm_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StorageError::AlarmNotFound(alarm_id))?;
        Alarm::try_from(row)
    }

    async fn insert_alarm(
        tx: &mut Transaction<'_, Postgres>,
        alarm: &Alarm,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO alarms
                (id, plant_id, inverter_id, rule_type, severity, problem_detail,
                 message, triggered_at, cleared_at, observation)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(alarm.id)
        .bind(alarm.key.plant())
        .bind(alarm.key.inverter())
        .bind(alarm.key.rule().as_str())
        .bind(alarm.severity.as_str())
        .bind(alarm.key.detail())
        .bind(&alarm.message)
        .bind(alarm.triggered_at)
        .bind(alarm.cleared_at)
        .bind(&alarm.observation)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_open_conflict(e, &alarm.key))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for PgStateStore {
    async fn load_open_alarms(&self) -> Result<Vec<Alarm>, StorageError> {
        let rows = sqlx::query_as::<_, AlarmRow>(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms WHERE cleared_at IS NULL"
        ))
        .fetch_all(&self.pool)
        .await?;
        alarms_from_rows(rows)
    }

    async fn load_counters(&self) -> Result<Vec<(DetectionKey, Counter)>, StorageError> {
        let rows = sqlx::query_as::<_, CounterRow>(
            "SELECT plant_id, inverter_id, rule_type, problem_detail, count, last_detected_at
             FROM detection_counters
             WHERE count > 0",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(DetectionKey, Counter), StorageError> {
                let rule: RuleType = row.rule_type.parse()?;
                let key = DetectionKey::new(
                    EntityId::new(row.plant_id, row.inverter_id),
                    rule,
                    row.problem_detail,
                );
                let counter = Counter {
                    count: u32::try_from(row.count).unwrap_or(0),
                    last_detected_at: row.last_detected_at,
                };
                Ok((key, counter))
            })
            .collect()
    }

    async fn commit(&self, changes: &CycleChanges) -> Result<Vec<Uuid>, StorageError> {
        let mut tx = self.pool.begin().await?;

        for (key, counter) in &changes.counter_upserts {
            let count = i32::try_from(counter.count).unwrap_or(i32::MAX);
            if count == 0 {
                continue;
            }
            sqlx::query(
                "INSERT INTO detection_counters
                    (plant_id, inverter_id, rule_type, problem_detail, count, last_detected_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (plant_id, inverter_id, rule_type, problem_detail)
                 DO UPDATE SET count = EXCLUDED.count,
                               last_detected_at = EXCLUDED.last_detected_at",
            )
            .bind(key.plant())
            .bind(key.inverter())
            .bind(key.rule().as_str())
            .bind(key.detail())
            .bind(count)
            .bind(counter.last_detected_at)
            .execute(&mut *tx)
            .await?;
        }

        for key in &changes.counter_deletes {
            sqlx::query(
                "DELETE FROM detection_counters
                 WHERE plant_id = $1 AND inverter_id = $2 AND rule_type = $3 AND problem_detail = $4",
            )
            .bind(key.plant())
            .bind(key.inverter())
            .bind(key.rule().as_str())
            .bind(key.detail())
            .execute(&mut *tx)
            .await?;
        }

        let mut closed = Vec::with_capacity(changes.closed.len());
        for closure in &changes.closed {
            let result = sqlx::query(
                "UPDATE alarms SET cleared_at = $2 WHERE id = $1 AND cleared_at IS NULL",
            )
            .bind(closure.alarm_id)
            .bind(closure.cleared_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                warn!(alarm_id = %closure.alarm_id, "alarm no longer open, skipping closure");
            } else {
                closed.push(closure.alarm_id);
            }
        }

        for alarm in &changes.opened {
            Self::insert_alarm(&mut tx, alarm).await?;
        }

        tx.commit().await?;
        debug!(
            upserts = changes.counter_upserts.len(),
            deletes = changes.counter_deletes.len(),
            opened = changes.opened.len(),
            closed = closed.len(),
            "cycle changes committed"
        );
        Ok(closed)
    }
}

#[async_trait::async_trait]
impl AlarmOperations for PgStateStore {
    async fn open_external_event(
        &self,
        entity: EntityId,
        severity: Severity,
        detail: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<Alarm, StorageError> {
        let key = DetectionKey::new(entity, RuleType::ExternalVendorEvent, detail);
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, AlarmRow>(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms
             WHERE plant_id = $1 AND inverter_id = $2 AND rule_type = $3
               AND problem_detail = $4 AND cleared_at IS NULL"
        ))
        .bind(key.plant())
        .bind(key.inverter())
        .bind(key.rule().as_str())
        .bind(key.detail())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            return Alarm::try_from(row);
        }

        let alarm = Alarm::open(key, severity, message, at);
        Self::insert_alarm(&mut tx, &alarm).await?;
        tx.commit().await?;
        info!(alarm_id = %alarm.id, key = %alarm.key, "external vendor event opened");
        Ok(alarm)
    }

    async fn close_alarm(
        &self,
        alarm_id: Uuid,
        at: DateTime<Utc>,
        observation: Option<&str>,
    ) -> Result<Alarm, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut alarm = Self::fetch_alarm(&mut tx, alarm_id).await?;
        if !alarm.is_open() {
            return Err(StorageError::AlarmClosed(alarm_id));
        }

        sqlx::query(
            "UPDATE alarms SET cleared_at = $2, observation = COALESCE($3, observation)
             WHERE id = $1",
        )
        .bind(alarm_id)
        .bind(at)
        .bind(observation)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        alarm.cleared_at = Some(at);
        if let Some(note) = observation {
            alarm.observation = Some(note.to_string());
        }
        info!(alarm_id = %alarm_id, key = %alarm.key, "alarm closed by operator");
        Ok(alarm)
    }

    async fn annotate_alarm(&self, alarm_id: Uuid, observation: &str) -> Result<Alarm, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut alarm = Self::fetch_alarm(&mut tx, alarm_id).await?;
        if !alarm.is_open() {
            return Err(StorageError::AlarmClosed(alarm_id));
        }

        sqlx::query("UPDATE alarms SET observation = $2 WHERE id = $1")
            .bind(alarm_id)
            .bind(observation)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        alarm.observation = Some(observation.to_string());
        Ok(alarm)
    }

    async fn alarm_history(&self, entity: &EntityId) -> Result<Vec<Alarm>, StorageError> {
        let rows = sqlx::query_as::<_, AlarmRow>(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms
             WHERE plant_id = $1 AND inverter_id = $2
             ORDER BY triggered_at DESC"
        ))
        .bind(&entity.plant)
        .bind(&entity.inverter)
        .fetch_all(&self.pool)
        .await?;
        alarms_from_rows(rows)
    }
}

//! Per-cycle inputs read from the tables the acquisition side maintains.
//!
//! Configuration is validated here: an inverter whose stored grouping,
//! vendor kind or active channel list does not parse keeps its snapshot but
//! gets no configuration, so the engine skips it for the cycle.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use pvwatch_core::{
    ActiveChannels, EntityConfig, EntityId, GroupingTopology, InverterSnapshot, PvError,
    RecoveryGraceStatus, VendorHealth, VendorKind,
};

use crate::error::StorageError;
use crate::traits::{CycleInput, TelemetrySource};

#[derive(Debug, sqlx::FromRow)]
struct TelemetryRow {
    plant_id: String,
    inverter_id: String,
    vendor: String,
    vendor_kind: String,
    grouping: String,
    active_channels: serde_json::Value,
    owner_target: Option<String>,
    currents: serde_json::Value,
    is_offline: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct VendorStatusRow {
    vendor: String,
    healthy: bool,
    grace_ends_at: Option<DateTime<Utc>>,
}

impl From<VendorStatusRow> for VendorHealth {
    fn from(row: VendorStatusRow) -> Self {
        VendorHealth {
            vendor: row.vendor,
            healthy: row.healthy,
            grace_ends_at: row.grace_ends_at,
        }
    }
}

/// Decode the JSON channel currents; anything but a number counts as missing.
fn parse_currents(value: &serde_json::Value) -> Option<Vec<Option<f64>>> {
    let items = value.as_array()?;
    Some(items.iter().map(serde_json::Value::as_f64).collect())
}

fn parse_config(row: &TelemetryRow) -> Result<EntityConfig, PvError> {
    Ok(EntityConfig {
        grouping: row.grouping.parse::<GroupingTopology>()?,
        active_channels: ActiveChannels::from_json(&row.active_channels)?,
        vendor_kind: row.vendor_kind.parse::<VendorKind>()?,
    })
}

/// Reads snapshots, entity configuration and vendor grace windows.
#[derive(Debug, Clone)]
pub struct PgTelemetrySource {
    pool: PgPool,
}

impl PgTelemetrySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a vendor health probe and open or drop its recovery grace window.
    pub async fn record_vendor_health(
        &self,
        vendor: &str,
        healthy: bool,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<VendorHealth, StorageError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, VendorStatusRow>(
            "SELECT vendor, healthy, grace_ends_at FROM vendor_api_status
             WHERE vendor = $1 FOR UPDATE",
        )
        .bind(vendor)
        .fetch_optional(&mut *tx)
        .await?
        .map(VendorHealth::from)
        .unwrap_or_else(|| VendorHealth::healthy(vendor));

        let next = current.transition(healthy, now, grace);

        sqlx::query(
            "INSERT INTO vendor_api_status (vendor, healthy, grace_ends_at, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (vendor)
             DO UPDATE SET healthy = EXCLUDED.healthy,
                           grace_ends_at = EXCLUDED.grace_ends_at,
                           updated_at = EXCLUDED.updated_at",
        )
        .bind(&next.vendor)
        .bind(next.healthy)
        .bind(next.grace_ends_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if current.healthy != next.healthy {
            info!(
                vendor,
                healthy = next.healthy,
                grace_ends_at = ?next.grace_ends_at,
                "vendor API health changed"
            );
        }
        Ok(next)
    }
}

#[async_trait::async_trait]
impl TelemetrySource for PgTelemetrySource {
    async fn cycle_input(&self, now: DateTime<Utc>) -> Result<CycleInput, StorageError> {
        let rows = sqlx::query_as::<_, TelemetryRow>(
            "SELECT i.plant_id, i.inverter_id, i.vendor, i.vendor_kind, i.grouping,
                    i.active_channels, i.owner_target, t.currents, t.is_offline
             FROM inverters i
             JOIN inverter_telemetry_latest t
               ON t.plant_id = i.plant_id AND t.inverter_id = i.inverter_id
             ORDER BY i.plant_id, i.inverter_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut input = CycleInput::new(now);
        for row in rows {
            let entity = EntityId::new(row.plant_id.clone(), row.inverter_id.clone());

            match parse_config(&row) {
                Ok(config) => {
                    input.configs.insert(entity.clone(), config);
                }
                Err(e) => warn!(entity = %entity, error = %e, "invalid inverter configuration"),
            }

            let currents = parse_currents(&row.currents).unwrap_or_else(|| {
                warn!(entity = %entity, "channel currents are not a JSON array");
                Vec::new()
            });

            let mut snapshot = InverterSnapshot::new(entity, row.vendor, currents)
                .with_offline(row.is_offline);
            if let Some(owner) = row.owner_target {
                snapshot = snapshot.with_owner(owner);
            }
            input.snapshots.push(snapshot);
        }

        let statuses = sqlx::query_as::<_, VendorStatusRow>(
            "SELECT vendor, healthy, grace_ends_at FROM vendor_api_status",
        )
        .fetch_all(&self.pool)
        .await?;
        input.grace = statuses.into_iter().map(VendorHealth::from).collect::<RecoveryGraceStatus>();

        debug!(
            snapshots = input.snapshots.len(),
            configs = input.configs.len(),
            "cycle input loaded"
        );
        Ok(input)
    }
}

//! Sensor ingest: validate, persist, then detect. Persistence is the
//! primary guarantee — once the reading row is written the call succeeds,
//! and any detection or dispatch failure downstream is logged, never
//! surfaced to the sensor.

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::db::{now_unix, Db, Greenhouse, NewReading, StoredReading};
use crate::detector::{self, DetectionParams, GreenhouseLocks};
use crate::dispatch::Dispatcher;
use crate::error::HubError;
use crate::events;
use crate::notify;

// ---------------------------------------------------------------------------
// Wire input
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IngestReading {
    pub greenhouse_id: String,
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub soil_temperature: f64,
    pub soil_moisture: f64,
    pub light_intensity: f64,
    pub water_level: f64,
    pub water_reserve: f64,
    /// Defaults to the server clock when the node sends none.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

impl IngestReading {
    /// All numeric fields must be finite. Out-of-range but finite values
    /// are accepted and stored as-is — no server-side clamping.
    fn validate(&self) -> Result<(), HubError> {
        let fields = [
            ("air_temperature", self.air_temperature),
            ("air_humidity", self.air_humidity),
            ("soil_temperature", self.soil_temperature),
            ("soil_moisture", self.soil_moisture),
            ("light_intensity", self.light_intensity),
            ("water_level", self.water_level),
            ("water_reserve", self.water_reserve),
        ];

        let bad: Vec<&str> = fields
            .iter()
            .filter(|(_, v)| !v.is_finite())
            .map(|(name, _)| *name)
            .collect();

        if bad.is_empty() {
            Ok(())
        } else {
            Err(HubError::Validation(format!(
                "non-finite reading field(s): {}",
                bad.join(", ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

pub async fn ingest_reading(
    db: &Db,
    locks: &GreenhouseLocks,
    params: DetectionParams,
    dispatcher: &Dispatcher,
    input: IngestReading,
) -> Result<StoredReading, HubError> {
    input.validate()?;

    let greenhouse = db
        .get_greenhouse(&input.greenhouse_id)
        .await?
        .ok_or_else(|| HubError::not_found("greenhouse", input.greenhouse_id.clone()))?;

    let ts = input
        .timestamp
        .map_or_else(now_unix, |t| t.unix_timestamp());

    let new = NewReading {
        greenhouse_id: greenhouse.greenhouse_id.clone(),
        ts,
        soil_moisture: input.soil_moisture,
        air_temperature: input.air_temperature,
        air_humidity: input.air_humidity,
        soil_temperature: input.soil_temperature,
        light_intensity: input.light_intensity,
        water_level: input.water_level,
        water_reserve: input.water_reserve,
    };

    // Hold the greenhouse lock across the previous-reading lookup, the
    // insert, and detection, so two concurrent readings for one greenhouse
    // cannot both measure a delta against the same stale baseline.
    let lock = locks.lock_for(&greenhouse.greenhouse_id);
    let _guard = lock.lock().await;

    let previous = db.latest_reading(&greenhouse.greenhouse_id).await?;
    let stored = db.insert_reading(&new).await?;

    match previous {
        Some(prev) => {
            if let Err(e) = detect(db, params, dispatcher, &greenhouse, &prev, &stored).await {
                error!(
                    greenhouse = %greenhouse.greenhouse_id,
                    reading_id = stored.id,
                    "detection failed after persisted reading: {e:#}"
                );
            }
        }
        None => {
            debug!(
                greenhouse = %greenhouse.greenhouse_id,
                "first reading — baseline recorded, no detection"
            );
        }
    }

    Ok(stored)
}

/// Best-effort secondary work, run while still holding the per-greenhouse
/// lock.
async fn detect(
    db: &Db,
    params: DetectionParams,
    dispatcher: &Dispatcher,
    greenhouse: &Greenhouse,
    prev: &StoredReading,
    next: &StoredReading,
) -> anyhow::Result<()> {
    let Some(jump) = detector::evaluate(
        prev.soil_moisture,
        next.soil_moisture,
        params.moisture_increase_threshold,
    ) else {
        return Ok(());
    };

    let Some(event) = events::create_detected(
        db,
        &greenhouse.greenhouse_id,
        &jump,
        next.ts,
        params.cooldown,
    )
    .await?
    else {
        // Suppressed by cool-down: no event, no notification.
        return Ok(());
    };

    let draft = notify::irrigation_detected(greenhouse, &event, &jump);
    dispatcher
        .dispatch(&greenhouse.owner_user_id, draft)
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

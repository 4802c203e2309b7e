//! Irrigation detection: a moisture jump between consecutive readings of
//! the same greenhouse, at or above the configured threshold, counts as a
//! watering that nobody commanded.
//!
//! The threshold check itself is a pure function; the per-greenhouse lock
//! registry lives here too so ingest can serialize concurrent readings for
//! one greenhouse without blocking the others. The database stays the
//! authority on the cool-down invariant — the lock only prevents two
//! in-flight requests from computing a delta against the same stale
//! baseline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Detection parameters, sourced from the `[detection]` config section.
#[derive(Debug, Clone, Copy)]
pub struct DetectionParams {
    /// Minimum soil-moisture increase, in percentage points.
    pub moisture_increase_threshold: f64,
    /// Window during which a second detection for the same greenhouse is
    /// suppressed.
    pub cooldown: Duration,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            moisture_increase_threshold: 15.0,
            cooldown: Duration::from_secs(2 * 3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure decision
// ---------------------------------------------------------------------------

/// A qualifying moisture increase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoistureJump {
    pub from: f64,
    pub to: f64,
    pub delta: f64,
}

/// Decide whether the step from `prev_moisture` to `next_moisture` looks
/// like an irrigation. Negative and sub-threshold deltas never qualify;
/// non-finite values skip detection entirely.
pub fn evaluate(prev_moisture: f64, next_moisture: f64, threshold: f64) -> Option<MoistureJump> {
    if !prev_moisture.is_finite() || !next_moisture.is_finite() {
        return None;
    }
    let delta = next_moisture - prev_moisture;
    if delta >= threshold {
        Some(MoistureJump {
            from: prev_moisture,
            to: next_moisture,
            delta,
        })
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Per-greenhouse serialization
// ---------------------------------------------------------------------------

/// Hands out one async mutex per greenhouse id. Ingest holds the mutex
/// across its read-previous / insert / detect sequence.
#[derive(Default)]
pub struct GreenhouseLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GreenhouseLocks {
    pub fn lock_for(&self, greenhouse_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("greenhouse lock map poisoned");
        map.entry(greenhouse_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

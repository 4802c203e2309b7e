//! TOML config file loading, validation, and database seeding for
//! greenhouses and detection tunables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::{Db, Greenhouse};
use crate::detector::DetectionParams;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionSection,
    #[serde(default)]
    pub greenhouses: Vec<GreenhouseEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DetectionSection {
    #[serde(default = "default_threshold")]
    pub moisture_increase_threshold: f64,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: f64,
    #[serde(default = "default_retention_days")]
    pub notification_retention_days: i64,
}

fn default_threshold() -> f64 {
    15.0
}

fn default_cooldown_hours() -> f64 {
    2.0
}

fn default_retention_days() -> i64 {
    30
}

/// One year. Keeps `Duration::from_secs_f64` well inside its domain.
const MAX_COOLDOWN_HOURS: f64 = 8760.0;

impl Default for DetectionSection {
    fn default() -> Self {
        Self {
            moisture_increase_threshold: default_threshold(),
            cooldown_hours: default_cooldown_hours(),
            notification_retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GreenhouseEntry {
    pub greenhouse_id: String,
    pub name: String,
    pub owner_user_id: String,
    pub target_moisture: f64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_detection(&mut errors);
        self.validate_greenhouses(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_detection(&self, errors: &mut Vec<String>) {
        let d = &self.detection;

        if !d.moisture_increase_threshold.is_finite()
            || d.moisture_increase_threshold <= 0.0
            || d.moisture_increase_threshold > 100.0
        {
            errors.push(format!(
                "detection: moisture_increase_threshold {} out of range (0, 100]",
                d.moisture_increase_threshold
            ));
        }

        if !d.cooldown_hours.is_finite()
            || d.cooldown_hours <= 0.0
            || d.cooldown_hours > MAX_COOLDOWN_HOURS
        {
            errors.push(format!(
                "detection: cooldown_hours {} out of range (0, {MAX_COOLDOWN_HOURS}]",
                d.cooldown_hours
            ));
        }

        if d.notification_retention_days < 1 {
            errors.push(format!(
                "detection: notification_retention_days must be at least 1, got {}",
                d.notification_retention_days
            ));
        }
    }

    fn validate_greenhouses(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, g) in self.greenhouses.iter().enumerate() {
            let ctx = || {
                if g.greenhouse_id.is_empty() {
                    format!("greenhouses[{i}]")
                } else {
                    format!("greenhouse '{}'", g.greenhouse_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if g.greenhouse_id.trim().is_empty() {
                errors.push(format!("{}: greenhouse_id is empty", ctx()));
            } else if !seen_ids.insert(&g.greenhouse_id) {
                errors.push(format!("{}: duplicate greenhouse_id", ctx()));
            }

            if g.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if g.owner_user_id.trim().is_empty() {
                errors.push(format!("{}: owner_user_id is empty", ctx()));
            }

            // ── Moisture bounds ─────────────────────────────────
            if !(0.0..=100.0).contains(&g.target_moisture) {
                errors.push(format!(
                    "{}: target_moisture {} out of range [0, 100]",
                    ctx(),
                    g.target_moisture
                ));
            }
        }
    }

    /// Detection tunables in the form the detector consumes.
    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            moisture_increase_threshold: self.detection.moisture_increase_threshold,
            cooldown: Duration::from_secs_f64(self.detection.cooldown_hours * 3600.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all greenhouses from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for g in &config.greenhouses {
        db.upsert_greenhouse(&Greenhouse {
            greenhouse_id: g.greenhouse_id.clone(),
            name: g.name.clone(),
            owner_user_id: g.owner_user_id.clone(),
            target_moisture: g.target_moisture,
        })
        .await
        .with_context(|| format!("failed to upsert greenhouse '{}'", g.greenhouse_id))?;
    }

    tracing::info!(
        greenhouses = config.greenhouses.len(),
        threshold = config.detection.moisture_increase_threshold,
        cooldown_hours = config.detection.cooldown_hours,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

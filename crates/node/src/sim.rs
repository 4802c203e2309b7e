//! Stateful greenhouse telemetry simulator for local development.
//!
//! Models a plausible greenhouse without any real hardware:
//! - Soil moisture: mean-reverting random walk with drying drift
//! - Watering response: moisture climbs quickly while the pump is on
//! - Diurnal cycle for air temperature and light
//! - Humidity loosely anti-correlated with temperature
//! - Water tank level that drains while watering
//! - Per-reading sensor noise and occasional spikes

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily. With auto-watering enabled this
    /// produces the full detect-and-confirm cycle on the hub.
    Drying,
    /// Hovers near the target. Low noise, rare spikes. Good for exercising
    /// the UI without triggering detections.
    Stable,
    /// High noise and ~10% spike rate. Exercises the hub's validation and
    /// the detector's tolerance for jittery sensors.
    Flaky,
    /// Starts wet and dries very slowly. The detector should stay quiet.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One full set of channel values, in physical units.
#[derive(Debug, Clone)]
pub struct SimReading {
    pub soil_moisture: f64,
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub soil_temperature: f64,
    pub light_intensity: f64,
    pub water_level: f64,
    pub water_reserve: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing coherent greenhouse telemetry.
pub struct GreenhouseSim {
    // Soil moisture walk, in percent
    moisture: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,

    // Per-reading noise
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,

    // Diurnal cycle
    diurnal_period_s: f64,

    // Watering response
    watering: bool,
    wet_rate: f64,

    // Tank
    water_level: f64,
    water_reserve: f64,
}

impl GreenhouseSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start) =
            match scenario {
                Scenario::Drying => (-0.25, 0.6, 0.01, 0.4, 0.03_f32, 8.0, 55.0),
                Scenario::Stable => (-0.02, 0.2, 0.05, 0.2, 0.005, 4.0, 50.0),
                Scenario::Flaky => (-0.15, 1.2, 0.01, 1.0, 0.10, 15.0, 50.0),
                Scenario::Wet => (-0.05, 0.3, 0.02, 0.3, 0.02, 6.0, 80.0),
            };

        Self {
            moisture: start + gaussian(0.0, 2.0),
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center: 50.0,
            noise_sigma,
            spike_prob,
            spike_sigma,
            diurnal_period_s,
            watering: false,
            wet_rate: 4.0,
            water_level: 90.0,
            water_reserve: 25.0,
        }
    }

    /// Inform the simulator whether the pump is currently running.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    pub fn watering(&self) -> bool {
        self.watering
    }

    /// Current true moisture, before per-reading noise. The driver uses
    /// this to decide when to start and stop watering episodes.
    pub fn true_moisture(&self) -> f64 {
        self.moisture
    }

    /// Produce the next full reading. The internal state evolves with each
    /// call, so call frequency matters.
    pub fn sample(&mut self) -> SimReading {
        // -- Evolve the moisture base -------------------------------------
        let pull = self.mean_reversion * (self.center - self.moisture);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.watering { self.wet_rate } else { 0.0 };
        self.moisture =
            (self.moisture + self.drift_per_sample + pull + walk + wet).clamp(0.0, 100.0);

        if self.watering {
            self.water_level = (self.water_level - 1.5).max(0.0);
            self.water_reserve = (self.water_reserve - 0.2).max(0.0);
        }

        // -- Diurnal phase -------------------------------------------------
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let day = phase.sin(); // -1 night .. +1 afternoon

        let air_temperature = 22.0 + 6.0 * day + gaussian(0.0, 0.3);
        let air_humidity = (65.0 - 10.0 * day + gaussian(0.0, 1.5)).clamp(0.0, 100.0);
        let soil_temperature = 19.0 + 2.5 * day + gaussian(0.0, 0.2);
        let light_intensity = (6000.0 * day.max(0.0) + gaussian(0.0, 100.0)).max(0.0);

        // -- Instantaneous moisture reading -------------------------------
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };
        let soil_moisture =
            (self.moisture + gaussian(0.0, self.noise_sigma) + spike).clamp(0.0, 100.0);

        SimReading {
            soil_moisture,
            air_temperature,
            air_humidity,
            soil_temperature,
            light_intensity,
            water_level: self.water_level,
            water_reserve: self.water_reserve,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_moisture(sim: &mut GreenhouseSim, n: usize) -> Vec<f64> {
        (0..n).map(|_| sim.sample().soil_moisture).collect()
    }

    #[test]
    fn readings_stay_in_physical_bounds() {
        let mut sim = GreenhouseSim::new(Scenario::Flaky, 600.0);
        for _ in 0..500 {
            let r = sim.sample();
            assert!((0.0..=100.0).contains(&r.soil_moisture), "moisture: {r:?}");
            assert!((0.0..=100.0).contains(&r.air_humidity), "humidity: {r:?}");
            assert!(r.light_intensity >= 0.0, "light: {r:?}");
            assert!(r.water_level >= 0.0, "level: {r:?}");
        }
    }

    #[test]
    fn temporal_coherence() {
        // Consecutive readings should be much closer than the full range.
        let mut sim = GreenhouseSim::new(Scenario::Stable, 600.0);
        let samples = collect_moisture(&mut sim, 100);
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        // Allow some headroom for rare spikes.
        assert!(max_jump < 20.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn watering_raises_moisture() {
        let mut sim = GreenhouseSim::new(Scenario::Drying, 600.0);
        for _ in 0..20 {
            sim.sample();
        }
        let before = sim.true_moisture();

        sim.set_watering(true);
        for _ in 0..15 {
            sim.sample();
        }
        let after = sim.true_moisture();

        assert!(
            after > before + 10.0,
            "watering should raise moisture: before={before:.1} after={after:.1}"
        );
    }

    #[test]
    fn watering_drains_the_tank() {
        let mut sim = GreenhouseSim::new(Scenario::Drying, 600.0);
        let start = sim.sample().water_level;
        sim.set_watering(true);
        for _ in 0..10 {
            sim.sample();
        }
        assert!(sim.sample().water_level < start);
    }

    #[test]
    fn drying_scenario_trends_down_without_watering() {
        let mut sim = GreenhouseSim::new(Scenario::Drying, 600.0);
        let early: f64 = collect_moisture(&mut sim, 20).iter().sum::<f64>() / 20.0;
        for _ in 0..150 {
            sim.sample();
        }
        let late: f64 = collect_moisture(&mut sim, 20).iter().sum::<f64>() / 20.0;
        assert!(
            late < early,
            "drying should trend down: early={early:.1} late={late:.1}"
        );
    }

    #[test]
    fn flaky_scenario_has_more_variation() {
        fn variance(sim: &mut GreenhouseSim, n: usize) -> f64 {
            let samples = collect_moisture(sim, n);
            let mean = samples.iter().sum::<f64>() / n as f64;
            samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
        }

        let mut stable = GreenhouseSim::new(Scenario::Stable, 600.0);
        let mut flaky = GreenhouseSim::new(Scenario::Flaky, 600.0);

        let var_stable = variance(&mut stable, 200);
        let var_flaky = variance(&mut flaky, 200);

        assert!(
            var_flaky > var_stable,
            "flaky variance ({var_flaky:.2}) should exceed stable ({var_stable:.2})"
        );
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(
            mean.abs() < 0.15,
            "approx_std_normal mean should be near zero: {mean}"
        );
    }
}

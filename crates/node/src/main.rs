mod sim;

use serde::Serialize;
use std::{env, time::Duration};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{GreenhouseSim, Scenario, SimReading};

/// Wire shape the hub's ingest endpoint expects.
#[derive(Debug, Serialize)]
struct ReadingMsg {
    greenhouse_id: String,
    air_temperature: f64,
    air_humidity: f64,
    soil_temperature: f64,
    soil_moisture: f64,
    light_intensity: f64,
    water_level: f64,
    water_reserve: f64,
    timestamp: String,
}

impl ReadingMsg {
    fn new(greenhouse_id: &str, r: &SimReading) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            greenhouse_id: greenhouse_id.to_string(),
            air_temperature: r.air_temperature,
            air_humidity: r.air_humidity,
            soil_temperature: r.soil_temperature,
            soil_moisture: r.soil_moisture,
            light_intensity: r.light_intensity,
            water_level: r.water_level,
            water_reserve: r.water_reserve,
            timestamp,
        }
    }
}

/// Hands-free watering: open below the dry mark, close once recovered.
/// The resulting moisture jump is what the hub's detector looks for.
fn drive_watering(sim: &mut GreenhouseSim, dry_below: f64, wet_above: f64) {
    if !sim.watering() && sim.true_moisture() < dry_below {
        info!(moisture = sim.true_moisture(), "soil dry, starting watering");
        sim.set_watering(true);
    } else if sim.watering() && sim.true_moisture() > wet_above {
        info!(moisture = sim.true_moisture(), "target reached, stopping watering");
        sim.set_watering(false);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Env config
    let hub_url = env::var("HUB_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let greenhouse_id = env::var("GREENHOUSE_ID").unwrap_or_else(|_| "gh-1".to_string());
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let diurnal_period_s: f64 = env::var("DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    let endpoint = format!("{hub_url}/api/readings");
    info!(%endpoint, greenhouse = %greenhouse_id, %scenario, "node starting");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();

    let mut sim = GreenhouseSim::new(scenario, diurnal_period_s);

    loop {
        drive_watering(&mut sim, 30.0, 55.0);
        let reading = sim.sample();
        let msg = ReadingMsg::new(&greenhouse_id, &reading);

        match client.post(&endpoint).json(&msg).send().await {
            Ok(res) if res.status().is_success() => {
                info!(
                    moisture = reading.soil_moisture,
                    watering = sim.watering(),
                    "reading posted"
                );
            }
            Ok(res) => {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                warn!(%status, body = %body, "hub rejected reading");
            }
            Err(e) => {
                warn!("post failed: {e}. retrying next tick");
            }
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

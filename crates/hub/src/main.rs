mod config;
mod db;
mod detector;
mod dispatch;
mod error;
mod events;
mod ingest;
mod notify;
mod sessions;
mod web;

use anyhow::{Context, Result};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use sessions::SessionMap;
use web::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (detection knobs + greenhouse seed) ─────────────
    let cfg = config::load(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;
    config::apply(&cfg, &db).await?;

    let greenhouses = db.load_greenhouses().await?;
    if greenhouses.is_empty() {
        warn!("no greenhouses configured; every reading will be rejected");
    }
    info!(
        greenhouses = greenhouses.len(),
        threshold = cfg.detection.moisture_increase_threshold,
        cooldown_hours = cfg.detection.cooldown_hours,
        "hub ready"
    );

    // ── Web server ──────────────────────────────────────────────────
    let ctx = AppContext::shared(db, SessionMap::shared(), cfg.detection_params());
    web::serve(ctx).await
}

//! Irrigation event store: creation with the cool-down dedup rule, and
//! exactly-once confirmation.

use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::{Db, IrrigationEvent, IrrigationKind};
use crate::detector::MoistureJump;
use crate::error::HubError;

/// Create a `detected` event unless an unconfirmed one already exists for
/// the greenhouse inside the cool-down window. `Ok(None)` means suppressed:
/// no event, and the caller owes nobody a notification.
pub async fn create_detected(
    db: &Db,
    greenhouse_id: &str,
    jump: &MoistureJump,
    ts: i64,
    cooldown: Duration,
) -> Result<Option<IrrigationEvent>> {
    let cutoff = ts - cooldown.as_secs() as i64;
    if db.has_unconfirmed_detected_since(greenhouse_id, cutoff).await? {
        debug!(
            greenhouse = %greenhouse_id,
            "detection suppressed by cool-down window"
        );
        return Ok(None);
    }

    let notes = format!(
        "moisture {:.0}% -> {:.0}% (+{:.0} points)",
        jump.from, jump.to, jump.delta
    );
    let event = db
        .insert_event(greenhouse_id, IrrigationKind::Detected, None, &notes, ts)
        .await?;

    info!(
        greenhouse = %greenhouse_id,
        event_id = event.id,
        delta = jump.delta,
        "irrigation detected"
    );
    Ok(Some(event))
}

/// Record a pump-commanded watering. Never suppressed — the pump ran, the
/// event happened.
pub async fn create_automatic(
    db: &Db,
    greenhouse_id: &str,
    duration_seconds: i64,
    water_liters: f64,
    reason: &str,
    ts: i64,
) -> Result<IrrigationEvent> {
    let notes = format!("pump ran {duration_seconds} s ({reason})");
    let event = db
        .insert_event(
            greenhouse_id,
            IrrigationKind::Automatic,
            Some(water_liters),
            &notes,
            ts,
        )
        .await?;

    info!(
        greenhouse = %greenhouse_id,
        event_id = event.id,
        duration_seconds,
        "automatic irrigation recorded"
    );
    Ok(event)
}

/// Finalize an event exactly once. The final kind may only be `manual` or
/// `automatic` — a user cannot re-mark an event as merely detected.
pub async fn confirm(
    db: &Db,
    event_id: i64,
    final_kind: IrrigationKind,
    water_liters: Option<f64>,
    notes: Option<&str>,
) -> Result<IrrigationEvent, HubError> {
    if final_kind == IrrigationKind::Detected {
        return Err(HubError::Validation(
            "final kind must be 'manual' or 'automatic'".into(),
        ));
    }
    if let Some(w) = water_liters {
        if !w.is_finite() || w < 0.0 {
            return Err(HubError::Validation(format!(
                "water amount must be a non-negative number, got {w}"
            )));
        }
    }

    let changed = db
        .apply_confirmation(event_id, final_kind, water_liters, notes)
        .await?;

    if changed == 0 {
        // Either the id is unknown or someone confirmed first.
        return match db.get_event(event_id).await? {
            Some(_) => Err(HubError::AlreadyConfirmed(event_id)),
            None => Err(HubError::not_found("irrigation event", event_id.to_string())),
        };
    }

    let event = db
        .get_event(event_id)
        .await?
        .ok_or_else(|| HubError::not_found("irrigation event", event_id.to_string()))?;

    info!(
        event_id,
        kind = event.kind.as_str(),
        "irrigation event confirmed"
    );
    Ok(event)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;

    const COOLDOWN: Duration = Duration::from_secs(7200);

    fn jump() -> MoistureJump {
        MoistureJump {
            from: 30.0,
            to: 55.0,
            delta: 25.0,
        }
    }

    // -- create_detected ---------------------------------------------------

    #[tokio::test]
    async fn first_detection_creates_event() {
        let db = test_db().await;
        let ev = create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .expect("event expected");
        assert_eq!(ev.kind, IrrigationKind::Detected);
        assert!(ev.notes.contains("30%"));
        assert!(ev.notes.contains("55%"));
        assert!(ev.notes.contains("+25"));
    }

    #[tokio::test]
    async fn second_detection_within_cooldown_is_suppressed() {
        let db = test_db().await;
        create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();

        let second = create_detected(&db, "gh-1", &jump(), 10_060, COOLDOWN)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(db.list_events(Some("gh-1"), None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detection_after_cooldown_creates_again() {
        let db = test_db().await;
        create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();

        let later = 10_000 + COOLDOWN.as_secs() as i64 + 1;
        let second = create_detected(&db, "gh-1", &jump(), later, COOLDOWN)
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn confirmed_event_does_not_suppress() {
        let db = test_db().await;
        let ev = create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();
        confirm(&db, ev.id, IrrigationKind::Manual, Some(4.0), None)
            .await
            .unwrap();

        let second = create_detected(&db, "gh-1", &jump(), 10_060, COOLDOWN)
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn cooldown_is_per_greenhouse() {
        let db = test_db().await;
        db.upsert_greenhouse(&crate::db::Greenhouse {
            greenhouse_id: "gh-2".into(),
            name: "Peppers".into(),
            owner_user_id: "user-1".into(),
            target_moisture: 50.0,
        })
        .await
        .unwrap();

        create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();
        let other = create_detected(&db, "gh-2", &jump(), 10_010, COOLDOWN)
            .await
            .unwrap();
        assert!(other.is_some());
    }

    // -- create_automatic --------------------------------------------------

    #[tokio::test]
    async fn automatic_event_is_never_suppressed() {
        let db = test_db().await;
        let a = create_automatic(&db, "gh-1", 45, 3.0, "scheduled", 10_000)
            .await
            .unwrap();
        let b = create_automatic(&db, "gh-1", 30, 2.0, "manual trigger", 10_010)
            .await
            .unwrap();
        assert_eq!(a.kind, IrrigationKind::Automatic);
        assert_eq!(a.water_liters, Some(3.0));
        assert!(a.notes.contains("45 s"));
        assert_ne!(a.id, b.id);
    }

    // -- confirm -----------------------------------------------------------

    #[tokio::test]
    async fn confirm_rewrites_kind_and_amounts() {
        let db = test_db().await;
        let ev = create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();

        let confirmed = confirm(
            &db,
            ev.id,
            IrrigationKind::Manual,
            Some(4.0),
            Some("morning watering"),
        )
        .await
        .unwrap();

        assert_eq!(confirmed.kind, IrrigationKind::Manual);
        assert_eq!(confirmed.water_liters, Some(4.0));
        assert_eq!(confirmed.notes, "morning watering");
        assert!(confirmed.confirmed);
    }

    #[tokio::test]
    async fn second_confirm_fails_and_leaves_record_unchanged() {
        let db = test_db().await;
        let ev = create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();
        confirm(&db, ev.id, IrrigationKind::Manual, Some(4.0), None)
            .await
            .unwrap();

        let err = confirm(&db, ev.id, IrrigationKind::Automatic, Some(9.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::AlreadyConfirmed(id) if id == ev.id));

        let unchanged = db.get_event(ev.id).await.unwrap().unwrap();
        assert_eq!(unchanged.kind, IrrigationKind::Manual);
        assert_eq!(unchanged.water_liters, Some(4.0));
    }

    #[tokio::test]
    async fn confirm_unknown_id_is_not_found() {
        let db = test_db().await;
        let err = confirm(&db, 999, IrrigationKind::Manual, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
    }

    #[tokio::test]
    async fn confirm_as_detected_is_rejected() {
        let db = test_db().await;
        let ev = create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();
        let err = confirm(&db, ev.id, IrrigationKind::Detected, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
        assert!(!db.get_event(ev.id).await.unwrap().unwrap().confirmed);
    }

    #[tokio::test]
    async fn confirm_negative_water_amount_is_rejected() {
        let db = test_db().await;
        let ev = create_detected(&db, "gh-1", &jump(), 10_000, COOLDOWN)
            .await
            .unwrap()
            .unwrap();
        let err = confirm(&db, ev.id, IrrigationKind::Manual, Some(-2.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }
}

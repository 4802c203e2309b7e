//! Notification generator. Pure functions from domain facts to drafts —
//! nothing here touches the database or the network, which keeps the
//! message templates trivially testable.

use serde::{Deserialize, Serialize};

use crate::db::{Greenhouse, IrrigationEvent};
use crate::detector::MoistureJump;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PumpActivated,
    IrrigationDetected,
    IrrigationConfirmed,
    LstmPrediction,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PumpActivated => "pump_activated",
            Self::IrrigationDetected => "irrigation_detected",
            Self::IrrigationConfirmed => "irrigation_confirmed",
            Self::LstmPrediction => "lstm_prediction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pump_activated" => Some(Self::PumpActivated),
            "irrigation_detected" => Some(Self::IrrigationDetected),
            "irrigation_confirmed" => Some(Self::IrrigationConfirmed),
            "lstm_prediction" => Some(Self::LstmPrediction),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Structured payloads
// ---------------------------------------------------------------------------

/// Machine-readable half of a notification. Clients that want to render
/// their own copy use this instead of parsing the message string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationData {
    PumpActivated {
        greenhouse_id: String,
        event_id: i64,
        duration_seconds: i64,
        water_amount_liters: f64,
        reason: String,
    },
    IrrigationDetected {
        greenhouse_id: String,
        event_id: i64,
        from_moisture: f64,
        to_moisture: f64,
        delta: f64,
    },
    IrrigationConfirmed {
        greenhouse_id: String,
        event_id: i64,
        final_kind: String,
        water_amount_liters: Option<f64>,
    },
    LstmPrediction {
        greenhouse_id: String,
        current_moisture: f64,
        predicted_moisture: f64,
        hours_until_dry: f64,
        confidence: f64,
    },
}

/// A notification before it has an id, an owner, or a timestamp. The
/// dispatcher supplies those.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: NotificationData,
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub fn pump_activated(
    greenhouse: &Greenhouse,
    event: &IrrigationEvent,
    duration_seconds: i64,
    water_amount_liters: f64,
    reason: &str,
) -> NotificationDraft {
    NotificationDraft {
        kind: NotificationKind::PumpActivated,
        title: format!("Pump activated in {}", greenhouse.name),
        message: format!(
            "The pump ran for {duration_seconds} s and delivered \
             {water_amount_liters:.1} L of water ({reason})."
        ),
        data: NotificationData::PumpActivated {
            greenhouse_id: greenhouse.greenhouse_id.clone(),
            event_id: event.id,
            duration_seconds,
            water_amount_liters,
            reason: reason.to_string(),
        },
    }
}

pub fn irrigation_detected(
    greenhouse: &Greenhouse,
    event: &IrrigationEvent,
    jump: &MoistureJump,
) -> NotificationDraft {
    NotificationDraft {
        kind: NotificationKind::IrrigationDetected,
        title: format!("Irrigation detected in {}", greenhouse.name),
        message: format!(
            "Soil moisture rose from {:.0}% to {:.0}% (+{:.0} points). \
             Confirm the watering details when you can.",
            jump.from, jump.to, jump.delta
        ),
        data: NotificationData::IrrigationDetected {
            greenhouse_id: greenhouse.greenhouse_id.clone(),
            event_id: event.id,
            from_moisture: jump.from,
            to_moisture: jump.to,
            delta: jump.delta,
        },
    }
}

pub fn irrigation_confirmed(greenhouse: &Greenhouse, event: &IrrigationEvent) -> NotificationDraft {
    let kind = event.kind.as_str();
    let message = match event.water_liters {
        Some(liters) => {
            format!("Watering recorded as {kind} with {liters:.1} L of water.")
        }
        None => format!("Watering recorded as {kind}."),
    };
    NotificationDraft {
        kind: NotificationKind::IrrigationConfirmed,
        title: format!("Irrigation confirmed in {}", greenhouse.name),
        message,
        data: NotificationData::IrrigationConfirmed {
            greenhouse_id: greenhouse.greenhouse_id.clone(),
            event_id: event.id,
            final_kind: kind.to_string(),
            water_amount_liters: event.water_liters,
        },
    }
}

pub fn lstm_prediction(
    greenhouse: &Greenhouse,
    current_moisture: f64,
    predicted_moisture: f64,
    hours_until_dry: f64,
    confidence: f64,
) -> NotificationDraft {
    let pct = (confidence * 100.0).round() as i64;
    NotificationDraft {
        kind: NotificationKind::LstmPrediction,
        title: format!("Dry soil predicted in {}", greenhouse.name),
        message: format!(
            "Soil moisture {current_moisture:.0}% is predicted to drop to \
             {predicted_moisture:.0}% within {hours_until_dry:.0} h \
             (confidence {pct}%)."
        ),
        data: NotificationData::LstmPrediction {
            greenhouse_id: greenhouse.greenhouse_id.clone(),
            current_moisture,
            predicted_moisture,
            hours_until_dry,
            confidence,
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================

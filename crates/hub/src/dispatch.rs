//! Notification dispatcher: durable-first delivery. The row is written
//! before any push is attempted, so a notification survives even when no
//! client is connected; connected sessions get it immediately, everyone
//! else picks it up from the listing endpoint on reconnect.

use anyhow::Result;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::db::{now_unix, Db, Notification};
use crate::error::HubError;
use crate::notify::{NotificationDraft, NotificationKind};
use crate::sessions::SharedSessions;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// What a client sees, over the WebSocket and in listings.
#[derive(Debug, Serialize)]
pub struct NotificationWire {
    pub id: i64,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: crate::notify::NotificationData,
    pub read: bool,
    pub created_at: String,
}

impl NotificationWire {
    pub fn from_notification(n: &Notification) -> Self {
        let created_at = OffsetDateTime::from_unix_timestamp(n.created_ts)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_else(|| n.created_ts.to_string());
        Self {
            id: n.id,
            kind: n.kind,
            title: n.title.clone(),
            message: n.message.clone(),
            data: n.data.clone(),
            read: n.read,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    db: Db,
    sessions: SharedSessions,
}

impl Dispatcher {
    pub fn new(db: Db, sessions: SharedSessions) -> Self {
        Self { db, sessions }
    }

    /// Persist the draft for `user_id`, then push it to every connected
    /// session. Push problems are logged and swallowed — persistence
    /// already succeeded and that is the guarantee that matters.
    pub async fn dispatch(&self, user_id: &str, draft: NotificationDraft) -> Result<Notification> {
        let notification = self
            .db
            .insert_notification(
                user_id,
                draft.kind,
                &draft.title,
                &draft.message,
                &draft.data,
                now_unix(),
            )
            .await?;

        if let Err(e) = self.push(user_id, &notification).await {
            warn!(
                user = %user_id,
                notification_id = notification.id,
                "push failed: {e}"
            );
        }

        Ok(notification)
    }

    async fn push(&self, user_id: &str, notification: &Notification) -> Result<(), HubError> {
        let wire = NotificationWire::from_notification(notification);
        let payload = serde_json::to_string(&wire)
            .map_err(|e| HubError::Delivery(format!("serialize push payload: {e}")))?;

        let delivered = self.sessions.write().await.push(user_id, &payload);
        debug!(
            user = %user_id,
            notification_id = notification.id,
            sessions = delivered,
            "notification pushed"
        );
        Ok(())
    }

    /// Idempotent: marking an already-read notification succeeds quietly.
    pub async fn mark_read(&self, id: i64) -> Result<Notification, HubError> {
        let changed = self.db.mark_notification_read(id).await?;
        let notification = self
            .db
            .get_notification(id)
            .await?
            .ok_or_else(|| HubError::not_found("notification", id.to_string()))?;
        debug!(id, newly_read = changed > 0, "notification marked read");
        Ok(notification)
    }

    /// `mark_read` scoped to one user's notifications, for callers acting
    /// on behalf of a connected session. Someone else's id → `NotFound`.
    pub async fn mark_read_for(&self, user_id: &str, id: i64) -> Result<Notification, HubError> {
        self.db.mark_notification_read_owned(id, user_id).await?;
        let notification = self
            .db
            .get_notification(id)
            .await?
            .filter(|n| n.user_id == user_id)
            .ok_or_else(|| HubError::not_found("notification", id.to_string()))?;
        Ok(notification)
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        self.db.mark_all_read(user_id).await
    }

    pub async fn list(
        &self,
        user_id: &str,
        kind: Option<NotificationKind>,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        self.db
            .list_notifications(user_id, kind, unread_only, limit)
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), HubError> {
        let deleted = self.db.delete_notification(id).await?;
        if deleted == 0 {
            return Err(HubError::not_found("notification", id.to_string()));
        }
        Ok(())
    }

    /// Bulk age-based cleanup. Irreversible. Saturating arithmetic: an
    /// absurdly large `days` yields a cutoff before all time and deletes
    /// nothing, never a wrapped cutoff.
    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = now_unix().saturating_sub(days.saturating_mul(86_400));
        self.db.delete_notifications_before(cutoff).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::notify::NotificationData;
    use crate::sessions::SessionMap;
    use tokio::sync::mpsc;

    fn draft() -> NotificationDraft {
        NotificationDraft {
            kind: NotificationKind::PumpActivated,
            title: "Pump activated".into(),
            message: "The pump ran for 45 s and delivered 3.0 L of water (scheduled).".into(),
            data: NotificationData::PumpActivated {
                greenhouse_id: "gh-1".into(),
                event_id: 1,
                duration_seconds: 45,
                water_amount_liters: 3.0,
                reason: "scheduled".into(),
            },
        }
    }

    async fn dispatcher() -> Dispatcher {
        Dispatcher::new(test_db().await, SessionMap::shared())
    }

    // -- dispatch ----------------------------------------------------------

    #[tokio::test]
    async fn dispatch_persists_even_with_no_sessions() {
        let d = dispatcher().await;
        let n = d.dispatch("user-1", draft()).await.unwrap();
        assert!(!n.read);

        let unread = d.list("user-1", None, true, 10).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, n.id);
    }

    #[tokio::test]
    async fn dispatch_pushes_to_connected_sessions() {
        let d = dispatcher().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.sessions.write().await.register("user-1", tx);

        let n = d.dispatch("user-1", draft()).await.unwrap();

        let payload = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["id"], n.id);
        assert_eq!(json["kind"], "pump_activated");
        assert!(json["message"].as_str().unwrap().contains("45"));
        assert!(json["message"].as_str().unwrap().contains("3.0"));
        assert!(json["created_at"].as_str().unwrap().contains("T"));
    }

    #[tokio::test]
    async fn dispatch_survives_dead_session() {
        let d = dispatcher().await;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        d.sessions.write().await.register("user-1", tx);
        drop(rx);

        // Push fails silently; the notification is still persisted.
        let n = d.dispatch("user-1", draft()).await.unwrap();
        assert!(d.db.get_notification(n.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dispatch_does_not_push_to_other_users() {
        let d = dispatcher().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.sessions.write().await.register("user-2", tx);

        d.dispatch("user-1", draft()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    // -- mark_read ---------------------------------------------------------

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let d = dispatcher().await;
        let n = d.dispatch("user-1", draft()).await.unwrap();

        let first = d.mark_read(n.id).await.unwrap();
        assert!(first.read);

        // Second call: still success, still read.
        let second = d.mark_read(n.id).await.unwrap();
        assert!(second.read);
    }

    #[tokio::test]
    async fn mark_read_unknown_id_is_not_found() {
        let d = dispatcher().await;
        let err = d.mark_read(404).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
    }

    // -- mark_all_read / listing -------------------------------------------

    #[tokio::test]
    async fn mark_all_read_flips_only_that_user() {
        let d = dispatcher().await;
        d.dispatch("user-1", draft()).await.unwrap();
        d.dispatch("user-1", draft()).await.unwrap();
        d.dispatch("user-2", draft()).await.unwrap();

        assert_eq!(d.mark_all_read("user-1").await.unwrap(), 2);
        assert!(d.list("user-1", None, true, 10).await.unwrap().is_empty());
        assert_eq!(d.list("user-2", None, true, 10).await.unwrap().len(), 1);
    }

    // -- delete / cleanup ----------------------------------------------------

    #[tokio::test]
    async fn delete_then_delete_again_is_not_found() {
        let d = dispatcher().await;
        let n = d.dispatch("user-1", draft()).await.unwrap();
        d.delete(n.id).await.unwrap();
        let err = d.delete(n.id).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
    }

    #[tokio::test]
    async fn mark_read_for_ignores_other_users_notifications() {
        let d = dispatcher().await;
        let n = d.dispatch("user-1", draft()).await.unwrap();

        let err = d.mark_read_for("user-2", n.id).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
        // Still unread for the real owner.
        let unread = d.list("user-1", None, true, 10).await.unwrap();
        assert_eq!(unread.len(), 1);

        let owned = d.mark_read_for("user-1", n.id).await.unwrap();
        assert!(owned.read);
    }

    #[tokio::test]
    async fn cleanup_with_huge_age_deletes_nothing() {
        let d = dispatcher().await;
        d.dispatch("user-1", draft()).await.unwrap();

        // Saturates instead of wrapping into a future cutoff.
        assert_eq!(d.cleanup_older_than(i64::MAX).await.unwrap(), 0);
        assert_eq!(d.list("user-1", None, true, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_spares_recent_notifications() {
        let d = dispatcher().await;
        d.dispatch("user-1", draft()).await.unwrap();
        // Everything just created is newer than the cutoff.
        assert_eq!(d.cleanup_older_than(30).await.unwrap(), 0);
        assert_eq!(d.list("user-1", None, true, 10).await.unwrap().len(), 1);
    }
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::clock::{new_id, Clock};
use crate::db::models::{PendingDelta, SyncChange, SyncOperation};
use crate::db::repository::DeltaRepository;
use crate::error::{AppError, AppResult};
use crate::protocol::{Envelope, MessageAction, MessageKind};
use crate::services::external::EntryStore;
use crate::services::registry::{ConnectionRegistry, Room};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPullRequest {
    pub last_sync_timestamp: i64,
    pub device_id: String,
    #[serde(default)]
    pub changes: Vec<SyncChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Accepted,
    Stale,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResult {
    pub change_id: String,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOut {
    pub change_id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub server_timestamp: i64,
    pub device_id: String,
}

impl From<&PendingDelta> for DeltaOut {
    fn from(delta: &PendingDelta) -> Self {
        Self {
            change_id: delta.change_id.clone(),
            entity_kind: delta.entity_kind.clone(),
            entity_id: delta.entity_id.clone(),
            operation: delta.operation,
            payload: delta.payload_value(),
            server_timestamp: delta.server_timestamp_ms,
            device_id: delta.device_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPullResponse {
    pub results: Vec<ChangeResult>,
    pub changes: Vec<DeltaOut>,
    pub last_sync_timestamp: i64,
    pub sync_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

/// Receives client-originated mutations, authorizes and persists them,
/// records server-authoritative deltas, and fans realtime updates out to
/// the user's other devices. External CRUD publishes accepted mutations
/// through the same engine so every device sees one ordered stream.
pub struct SyncEngine {
    pool: SqlitePool,
    clock: Arc<Clock>,
    registry: Arc<ConnectionRegistry>,
    entries: Arc<dyn EntryStore>,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<Clock>,
        registry: Arc<ConnectionRegistry>,
        entries: Arc<dyn EntryStore>,
    ) -> Self {
        Self {
            pool,
            clock,
            registry,
            entries,
        }
    }

    /// Subscribe a session to a room. `user:<id>` rooms are checked against
    /// the session's user; `entry:<id>` rooms require confirmed ownership
    /// from the entry service.
    pub async fn subscribe(
        &self,
        session_id: &str,
        user_id: &str,
        channel: &str,
    ) -> AppResult<String> {
        let room = Room::parse(channel)
            .ok_or_else(|| AppError::BadRequest(format!("invalid channel: {channel}")))?;

        if let Room::Entry(entry_id) = &room {
            match self.entries.owner_of("entry", entry_id).await? {
                Some(owner) if owner == user_id => {}
                Some(_) => return Err(AppError::Forbidden),
                None => return Err(AppError::NotFound(format!("entry {entry_id}"))),
            }
        }

        self.registry.join(session_id, &room)?;
        Ok(room.name())
    }

    pub fn unsubscribe(&self, session_id: &str, channel: &str) -> AppResult<String> {
        let room = Room::parse(channel)
            .ok_or_else(|| AppError::BadRequest(format!("invalid channel: {channel}")))?;
        self.registry.leave(session_id, &room);
        Ok(room.name())
    }

    /// One sync-pull round: apply the inbound changes, then hand back every
    /// delta after the client's high-water mark in ascending order together
    /// with the new mark.
    ///
    /// The mark is stamped before the delta scan, so a change accepted
    /// concurrently can only land above it and be re-sent next round;
    /// at-least-once, never lost.
    pub async fn sync_pull(
        &self,
        user_id: &str,
        origin_session: Option<&str>,
        request: SyncPullRequest,
    ) -> AppResult<SyncPullResponse> {
        let mut results = Vec::with_capacity(request.changes.len());

        for change in &request.changes {
            let (result, delta) = self
                .apply_change(user_id, &request.device_id, change)
                .await;
            if let Some(delta) = delta {
                self.broadcast_delta(&delta, origin_session);
            }
            results.push(result);
        }

        let high_water = self.clock.next_timestamp();
        let deltas = DeltaRepository::list_after(&self.pool, user_id, request.last_sync_timestamp)
            .await?;

        Ok(SyncPullResponse {
            results,
            changes: deltas.iter().map(DeltaOut::from).collect(),
            last_sync_timestamp: high_water,
            sync_complete: true,
        })
    }

    /// Single-change path used by the live transport's create/update/delete
    /// actions: apply, then fan out to the user's other sessions.
    pub async fn apply_and_broadcast(
        &self,
        user_id: &str,
        device_id: &str,
        origin_session: Option<&str>,
        change: &SyncChange,
    ) -> ChangeResult {
        let (result, delta) = self.apply_change(user_id, device_id, change).await;
        if let Some(delta) = delta {
            self.broadcast_delta(&delta, origin_session);
        }
        result
    }

    /// Validate, persist, and record one inbound change. Returns the
    /// per-change result and, when accepted, the new delta to broadcast.
    async fn apply_change(
        &self,
        user_id: &str,
        device_id: &str,
        change: &SyncChange,
    ) -> (ChangeResult, Option<PendingDelta>) {
        let accepted = |change: &SyncChange| ChangeResult {
            change_id: change.change_id.clone(),
            status: ChangeStatus::Accepted,
            error: None,
        };
        let rejected = |change: &SyncChange, status: ChangeStatus, error: &str| ChangeResult {
            change_id: change.change_id.clone(),
            status,
            error: Some(error.to_string()),
        };

        // Change ids are unique per (user, device); a re-sent change is
        // acknowledged without reapplying.
        match DeltaRepository::find_change(&self.pool, user_id, device_id, &change.change_id).await
        {
            Ok(Some(_)) => return (accepted(change), None),
            Ok(None) => {}
            Err(e) => {
                return (
                    rejected(change, ChangeStatus::Error, &format!("transient: {e}")),
                    None,
                )
            }
        }

        // Ownership: updates and deletes must reference an entity the
        // session's user owns; creates claim new ids.
        match self
            .entries
            .owner_of(&change.entity_kind, &change.entity_id)
            .await
        {
            Ok(Some(owner)) if owner != user_id => {
                return (
                    rejected(change, ChangeStatus::Error, "unauthorized"),
                    None,
                )
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                if change.operation != SyncOperation::Create {
                    return (rejected(change, ChangeStatus::Error, "not_found"), None);
                }
            }
            Err(e) => {
                return (
                    rejected(change, ChangeStatus::Error, &format!("transient: {e}")),
                    None,
                )
            }
        }

        // Conflict rule: a client timestamp strictly earlier than the
        // entity's latest server timestamp loses; the server version wins.
        match DeltaRepository::latest_server_timestamp(
            &self.pool,
            user_id,
            &change.entity_kind,
            &change.entity_id,
        )
        .await
        {
            Ok(Some(latest)) if change.client_timestamp_ms < latest => {
                tracing::debug!(
                    "Rejecting stale change {} for {}/{} (client {} < server {})",
                    change.change_id,
                    change.entity_kind,
                    change.entity_id,
                    change.client_timestamp_ms,
                    latest
                );
                return (rejected(change, ChangeStatus::Stale, "stale"), None);
            }
            Ok(_) => {}
            Err(e) => {
                return (
                    rejected(change, ChangeStatus::Error, &format!("transient: {e}")),
                    None,
                )
            }
        }

        if let Err(e) = self.entries.persist_change(user_id, change).await {
            tracing::warn!(
                "Persisting change {} for user {} failed: {:?}",
                change.change_id,
                user_id,
                e
            );
            return (
                rejected(change, ChangeStatus::Error, &format!("transient: {e}")),
                None,
            );
        }

        let delta = PendingDelta {
            id: new_id(),
            user_id: user_id.to_string(),
            change_id: change.change_id.clone(),
            device_id: device_id.to_string(),
            entity_kind: change.entity_kind.clone(),
            entity_id: change.entity_id.clone(),
            operation: change.operation,
            payload: change.payload.to_string(),
            client_timestamp_ms: change.client_timestamp_ms,
            server_timestamp_ms: self.clock.next_timestamp(),
        };

        match DeltaRepository::insert(&self.pool, &delta).await {
            Ok(()) => (accepted(change), Some(delta)),
            // A concurrent insert of the same change id means another task
            // already accepted and broadcast it.
            Err(AppError::Database(sqlx::Error::Database(_))) => (accepted(change), None),
            Err(e) => (
                rejected(change, ChangeStatus::Error, &format!("transient: {e}")),
                None,
            ),
        }
    }

    /// External CRUD path: the mutation is already persisted and authorized
    /// upstream; record the delta and fan it out.
    pub async fn publish(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        change: SyncChange,
    ) -> AppResult<PendingDelta> {
        let delta = PendingDelta {
            id: new_id(),
            user_id: user_id.to_string(),
            change_id: change.change_id.clone(),
            device_id: device_id.unwrap_or("server").to_string(),
            entity_kind: change.entity_kind,
            entity_id: change.entity_id,
            operation: change.operation,
            payload: change.payload.to_string(),
            client_timestamp_ms: change.client_timestamp_ms,
            server_timestamp_ms: self.clock.next_timestamp(),
        };

        DeltaRepository::insert(&self.pool, &delta).await?;
        self.broadcast_delta(&delta, None);
        Ok(delta)
    }

    /// Realtime data-change fan-out to every other session of the user.
    /// A session missing the broadcast reconciles on its next sync pull.
    fn broadcast_delta(&self, delta: &PendingDelta, origin_session: Option<&str>) {
        let action = match delta.operation {
            SyncOperation::Create => MessageAction::Create,
            SyncOperation::Update => MessageAction::Update,
            SyncOperation::Delete => MessageAction::Delete,
        };

        let envelope = Envelope::server(
            MessageKind::Data,
            action,
            serde_json::json!({
                "changeId": delta.change_id,
                "entityKind": delta.entity_kind,
                "entityId": delta.entity_id,
                "payload": delta.payload_value(),
                "serverTimestamp": delta.server_timestamp_ms,
                "deviceId": delta.device_id,
            }),
        )
        .with_user(&delta.user_id);

        let delivered = self
            .registry
            .broadcast_to_user(&delta.user_id, &envelope, origin_session);
        tracing::debug!(
            "Broadcast delta {} for user {} to {} session(s)",
            delta.change_id,
            delta.user_id,
            delivered
        );
    }

    /// Presence fan-out: online/offline/away plus the live device count.
    pub fn broadcast_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        current_activity: Option<&str>,
    ) {
        let envelope = Envelope::server(
            MessageKind::Presence,
            MessageAction::Presence,
            serde_json::json!({
                "status": status,
                "activeDevices": self.registry.active_device_count(user_id),
                "currentActivity": current_activity,
            }),
        )
        .with_user(user_id);

        self.registry.broadcast_to_user(user_id, &envelope, None);
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::protocol::{Envelope, MessageAction, MessageKind};

/// Outbound capacity per session. `send_to_session` never blocks; a full
/// buffer counts as a failed delivery and the missed delta is reconciled on
/// the next sync pull.
pub const SESSION_BUFFER: usize = 64;

/// What flows over a session's transport channel. The write task turns
/// `Close` into a close frame and ends the connection.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Envelope(Envelope),
    Close { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A subscription room. Parsed up front so the registry only ever sees the
/// two legal shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Room {
    User(String),
    Entry(String),
}

impl Room {
    pub fn parse(raw: &str) -> Option<Room> {
        if let Some(user) = raw.strip_prefix("user:") {
            (!user.is_empty()).then(|| Room::User(user.to_string()))
        } else if let Some(entry) = raw.strip_prefix("entry:") {
            (!entry.is_empty()).then(|| Room::Entry(entry.to_string()))
        } else {
            None
        }
    }

    pub fn name(&self) -> String {
        match self {
            Room::User(u) => format!("user:{u}"),
            Room::Entry(e) => format!("entry:{e}"),
        }
    }

    pub fn for_user(user_id: &str) -> Room {
        Room::User(user_id.to_string())
    }
}

/// Everything the registry needs to adopt a freshly upgraded transport.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub user_id: String,
    pub sender: mpsc::Sender<SessionMessage>,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
}

struct SessionEntry {
    user_id: String,
    state: SessionState,
    #[allow(dead_code)]
    connected_at_ms: i64,
    last_activity_ms: i64,
    subscriptions: HashSet<String>,
    sender: mpsc::Sender<SessionMessage>,
    #[allow(dead_code)]
    user_agent: Option<String>,
    #[allow(dead_code)]
    remote_addr: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionEntry>,
    by_user: HashMap<String, HashSet<String>>,
    rooms: HashMap<String, HashSet<String>>,
}

/// Result of one heartbeat pass: sessions that were pinged and sessions
/// that exceeded the idle bound and were moved to Closing.
pub struct HeartbeatSweep {
    pub pinged: usize,
    pub evicted: Vec<EvictedSession>,
}

#[derive(Debug, Clone)]
pub struct EvictedSession {
    pub session_id: String,
    pub user_id: String,
}

/// In-memory registry of live client sessions: sessions by id, session ids
/// by user, session ids by room. The mutex is only held for table access;
/// broadcast snapshots the member senders and releases the lock before any
/// per-session send.
///
/// Entry-room joins must be ownership-checked by the caller (the sync
/// engine) before `join` is called; the registry cannot await the entry
/// service while holding its lock.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    accepting: AtomicBool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Store a session and auto-join its `user:<id>` room. Presence fan-out
    /// is the caller's next step, outside the registry lock.
    pub fn attach(&self, handle: SessionHandle) -> AppResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(AppError::ServiceUnavailable(
                "server shutting down".to_string(),
            ));
        }

        let now = Utc::now().timestamp_millis();
        let user_room = Room::for_user(&handle.user_id).name();

        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(
            handle.session_id.clone(),
            SessionEntry {
                user_id: handle.user_id.clone(),
                state: SessionState::Open,
                connected_at_ms: now,
                last_activity_ms: now,
                subscriptions: HashSet::from([user_room.clone()]),
                sender: handle.sender,
                user_agent: handle.user_agent,
                remote_addr: handle.remote_addr,
            },
        );
        inner
            .by_user
            .entry(handle.user_id.clone())
            .or_default()
            .insert(handle.session_id.clone());
        inner
            .rooms
            .entry(user_room)
            .or_default()
            .insert(handle.session_id.clone());

        tracing::debug!(
            "Session {} attached for user {}",
            handle.session_id,
            handle.user_id
        );
        Ok(())
    }

    /// Remove a session from every index. Empty non-user rooms are
    /// discarded. Returns the owning user and their remaining device count
    /// so the caller can broadcast presence.
    pub fn detach(&self, session_id: &str) -> Option<(String, usize)> {
        let mut inner = self.inner.lock().unwrap();
        let mut entry = inner.sessions.remove(session_id)?;
        entry.state = SessionState::Closed;

        for room in &entry.subscriptions {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(session_id);
                if members.is_empty() && !room.starts_with("user:") {
                    inner.rooms.remove(room);
                }
            }
        }

        let remaining = {
            let left = match inner.by_user.get_mut(&entry.user_id) {
                Some(set) => {
                    set.remove(session_id);
                    set.len()
                }
                None => 0,
            };
            if left == 0 {
                inner.by_user.remove(&entry.user_id);
                let user_room = Room::for_user(&entry.user_id).name();
                if inner.rooms.get(&user_room).is_some_and(|m| m.is_empty()) {
                    inner.rooms.remove(&user_room);
                }
            }
            left
        };

        tracing::debug!("Session {} detached (user {})", session_id, entry.user_id);
        Some((entry.user_id, remaining))
    }

    /// Idempotent room join. `user:<u>` is only joinable by that user's own
    /// sessions; entry rooms arrive here already ownership-checked.
    pub fn join(&self, session_id: &str, room: &Room) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;

        if let Room::User(user) = room {
            if *user != entry.user_id {
                return Err(AppError::Forbidden);
            }
        }

        let name = room.name();
        entry.subscriptions.insert(name.clone());
        inner.rooms.entry(name).or_default().insert(session_id.to_string());
        Ok(())
    }

    /// Idempotent room leave; empty non-user rooms are discarded.
    pub fn leave(&self, session_id: &str, room: &Room) {
        let name = room.name();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.subscriptions.remove(&name);
        }
        if let Some(members) = inner.rooms.get_mut(&name) {
            members.remove(session_id);
            if members.is_empty() && !name.starts_with("user:") {
                inner.rooms.remove(&name);
            }
        }
    }

    /// Record activity (any inbound frame, including pong).
    pub fn touch(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.last_activity_ms = Utc::now().timestamp_millis();
        }
    }

    /// Best-effort write to one session. Only Open sessions receive;
    /// a full or closed buffer is a miss, not an error.
    pub fn send_to_session(&self, session_id: &str, envelope: Envelope) -> bool {
        let sender = {
            let inner = self.inner.lock().unwrap();
            match inner.sessions.get(session_id) {
                Some(entry) if entry.state == SessionState::Open => entry.sender.clone(),
                _ => return false,
            }
        };
        sender.try_send(SessionMessage::Envelope(envelope)).is_ok()
    }

    /// Send to every open session of a user, optionally excluding the
    /// originating one. Returns the number of sessions that accepted.
    pub fn broadcast_to_user(
        &self,
        user_id: &str,
        envelope: &Envelope,
        except: Option<&str>,
    ) -> usize {
        let targets = {
            let inner = self.inner.lock().unwrap();
            let Some(session_ids) = inner.by_user.get(user_id) else {
                return 0;
            };
            session_ids
                .iter()
                .filter(|id| except != Some(id.as_str()))
                .filter_map(|id| inner.sessions.get(id))
                .filter(|entry| entry.state == SessionState::Open)
                .map(|entry| entry.sender.clone())
                .collect::<Vec<_>>()
        };

        let mut delivered = 0;
        for sender in targets {
            if sender
                .try_send(SessionMessage::Envelope(envelope.clone()))
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send to every open member of a room, optionally excluding one
    /// session. A member whose transport went away mid-broadcast does not
    /// affect the rest.
    pub fn broadcast_to_room(&self, room: &Room, envelope: &Envelope, except: Option<&str>) -> usize {
        let targets = {
            let inner = self.inner.lock().unwrap();
            let Some(session_ids) = inner.rooms.get(&room.name()) else {
                return 0;
            };
            session_ids
                .iter()
                .filter(|id| except != Some(id.as_str()))
                .filter_map(|id| inner.sessions.get(id))
                .filter(|entry| entry.state == SessionState::Open)
                .map(|entry| entry.sender.clone())
                .collect::<Vec<_>>()
        };

        let mut delivered = 0;
        for sender in targets {
            if sender
                .try_send(SessionMessage::Envelope(envelope.clone()))
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn active_device_count(&self, user_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.by_user.get(user_id).map_or(0, |set| set.len())
    }

    pub fn session_user(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(session_id).map(|e| e.user_id.clone())
    }

    /// Open -> Closing. The session stops receiving broadcasts immediately;
    /// removal happens at `detach` once the transport reports final close.
    pub fn begin_close(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            if entry.state == SessionState::Open {
                entry.state = SessionState::Closing;
            }
        }
    }

    /// One heartbeat pass: ping every open session, move sessions silent
    /// past `idle` into Closing and hand them back for closure.
    pub fn heartbeat_sweep(&self, idle: Duration) -> HeartbeatSweep {
        let now = Utc::now().timestamp_millis();
        let idle_ms = idle.as_millis() as i64;

        let (to_ping, evicted) = {
            let mut inner = self.inner.lock().unwrap();
            let mut to_ping = Vec::new();
            let mut evicted = Vec::new();

            for (session_id, entry) in inner.sessions.iter_mut() {
                if entry.state != SessionState::Open {
                    continue;
                }
                if now - entry.last_activity_ms > idle_ms {
                    entry.state = SessionState::Closing;
                    evicted.push(EvictedSession {
                        session_id: session_id.clone(),
                        user_id: entry.user_id.clone(),
                    });
                } else {
                    to_ping.push(entry.sender.clone());
                }
            }
            (to_ping, evicted)
        };

        let mut pinged = 0;
        for sender in &to_ping {
            let ping = Envelope::server(MessageKind::System, MessageAction::Ping, serde_json::json!({}));
            if sender.try_send(SessionMessage::Envelope(ping)).is_ok() {
                pinged += 1;
            }
        }

        for session in &evicted {
            let close = SessionMessage::Close {
                reason: "idle timeout".to_string(),
            };
            let sender = {
                let inner = self.inner.lock().unwrap();
                inner.sessions.get(&session.session_id).map(|e| e.sender.clone())
            };
            if let Some(sender) = sender {
                let _ = sender.try_send(close);
            }
            tracing::info!(
                "Evicting idle session {} (user {})",
                session.session_id,
                session.user_id
            );
        }

        HeartbeatSweep { pinged, evicted }
    }

    /// Stop accepting sessions and tell every connected client the server
    /// is going away. Sessions drain through their normal close path.
    pub fn shutdown_all(&self) {
        self.accepting.store(false, Ordering::Release);

        let senders = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .sessions
                .values_mut()
                .map(|entry| {
                    entry.state = SessionState::Closing;
                    entry.sender.clone()
                })
                .collect::<Vec<_>>()
        };

        for sender in senders {
            let _ = sender.try_send(SessionMessage::Close {
                reason: "server shutting down".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach_session(
        registry: &ConnectionRegistry,
        session_id: &str,
        user_id: &str,
    ) -> mpsc::Receiver<SessionMessage> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        registry
            .attach(SessionHandle {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                sender: tx,
                user_agent: None,
                remote_addr: None,
            })
            .unwrap();
        rx
    }

    fn data_envelope() -> Envelope {
        Envelope::server(
            MessageKind::Data,
            MessageAction::Update,
            serde_json::json!({ "entityId": "E1" }),
        )
    }

    #[test]
    fn attach_auto_joins_user_room() {
        let registry = ConnectionRegistry::new();
        let mut rx = attach_session(&registry, "s1", "u1");

        let delivered =
            registry.broadcast_to_room(&Room::for_user("u1"), &data_envelope(), None);
        assert_eq!(delivered, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionMessage::Envelope(_)
        ));
    }

    #[test]
    fn join_rejects_foreign_user_room_and_bad_shapes() {
        let registry = ConnectionRegistry::new();
        let _rx = attach_session(&registry, "s1", "u1");

        assert!(matches!(
            registry.join("s1", &Room::User("someone-else".to_string())),
            Err(AppError::Forbidden)
        ));
        assert!(Room::parse("presence:global").is_none());
        assert!(Room::parse("entry:").is_none());
        assert_eq!(
            Room::parse("entry:E1"),
            Some(Room::Entry("E1".to_string()))
        );
    }

    #[test]
    fn broadcast_to_user_skips_origin_and_closing_sessions() {
        let registry = ConnectionRegistry::new();
        let _rx1 = attach_session(&registry, "s1", "u1");
        let mut rx2 = attach_session(&registry, "s2", "u1");
        let mut rx3 = attach_session(&registry, "s3", "u1");

        registry.begin_close("s3");

        let delivered = registry.broadcast_to_user("u1", &data_envelope(), Some("s1"));
        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn dead_member_does_not_break_room_broadcast() {
        let registry = ConnectionRegistry::new();
        let rx1 = attach_session(&registry, "s1", "u1");
        let mut rx2 = attach_session(&registry, "s2", "u1");

        // s1's transport goes away without a detach yet.
        drop(rx1);

        let delivered =
            registry.broadcast_to_room(&Room::for_user("u1"), &data_envelope(), None);
        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn detach_discards_empty_entry_rooms() {
        let registry = ConnectionRegistry::new();
        let _rx = attach_session(&registry, "s1", "u1");
        registry.join("s1", &Room::Entry("E1".to_string())).unwrap();

        let (user, remaining) = registry.detach("s1").unwrap();
        assert_eq!(user, "u1");
        assert_eq!(remaining, 0);
        assert_eq!(registry.active_device_count("u1"), 0);

        // Rejoining the discarded room from a new session works from scratch.
        let _rx2 = attach_session(&registry, "s2", "u1");
        registry.join("s2", &Room::Entry("E1".to_string())).unwrap();
        let delivered =
            registry.broadcast_to_room(&Room::Entry("E1".to_string()), &data_envelope(), None);
        assert_eq!(delivered, 1);
    }

    #[test]
    fn heartbeat_pings_live_and_evicts_silent_sessions() {
        let registry = ConnectionRegistry::new();
        let mut rx = attach_session(&registry, "s1", "u1");

        let sweep = registry.heartbeat_sweep(Duration::from_secs(60));
        assert_eq!(sweep.pinged, 1);
        assert!(sweep.evicted.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionMessage::Envelope(env) if env.action == MessageAction::Ping
        ));

        // Zero idle bound: everything is overdue.
        std::thread::sleep(Duration::from_millis(5));
        let sweep = registry.heartbeat_sweep(Duration::ZERO);
        assert_eq!(sweep.evicted.len(), 1);
        assert_eq!(sweep.evicted[0].session_id, "s1");
        // The evicted session got a close message and no longer broadcasts.
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionMessage::Close { .. }
        ));
        assert_eq!(registry.broadcast_to_user("u1", &data_envelope(), None), 0);
    }

    #[test]
    fn shutdown_refuses_new_sessions() {
        let registry = ConnectionRegistry::new();
        let mut rx = attach_session(&registry, "s1", "u1");

        registry.shutdown_all();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionMessage::Close { reason } if reason.contains("shutting down")
        ));

        let (tx, _rx2) = mpsc::channel(SESSION_BUFFER);
        let refused = registry.attach(SessionHandle {
            session_id: "s2".to_string(),
            user_id: "u1".to_string(),
            sender: tx,
            user_agent: None,
            remote_addr: None,
        });
        assert!(refused.is_err());
    }
}

//! [`SessionRegistry`] – client identity, expiry and supervisor privilege.
//!
//! The registry exclusively owns every [`Session`].  Callers hold a
//! [`SessionId`] and get cloned snapshots back; nothing outside this module
//! mutates a session.
//!
//! Expiry is evaluated lazily on [`SessionRegistry::get_session`] and eagerly
//! by [`SessionRegistry::sweep_expired`], which the runtime drives from a
//! background loop so abandoned sessions never accumulate.
//!
//! Every lifecycle change is appended to a bounded per-session event log.
//! Logs of removed sessions are retired into a second bounded buffer so the
//! most recent departures stay inspectable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use armgate_types::{ArmError, Clock, Permission, Session, SessionId, SystemClock};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::credential::SupervisorSecret;
use crate::ring_log::RingLog;

/// Construction parameters for [`SessionRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lifetime of a new session and default extension.
    pub timeout: TimeDelta,
    /// Live sessions allowed before the oldest is evicted.
    pub max_sessions: usize,
    /// Events retained per session.
    pub log_capacity: usize,
    pub supervisor: SupervisorSecret,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: TimeDelta::seconds(3600),
            max_sessions: 10,
            log_capacity: 1000,
            supervisor: SupervisorSecret::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session events
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    SessionCreated,
    SessionEvicted,
    SessionExpired,
    SessionExtended,
    SessionRemoved,
    SupervisorAuthSuccess,
    SupervisorAuthFailed,
    SupervisorRevoked,
    CommandIssued,
}

/// One entry of a session's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    #[serde(rename = "event_type")]
    pub event: SessionEventKind,
    pub detail: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

struct Entry {
    session: Session,
    /// Creation order; breaks `created_at` ties during eviction.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    logs: HashMap<SessionId, RingLog<SessionEvent>>,
    retired: VecDeque<(SessionId, RingLog<SessionEvent>)>,
    next_seq: u64,
}

/// Session store with expiry, eviction and supervisor escalation.
///
/// # Example
///
/// ```
/// use armgate_kernel::{RegistryConfig, SessionRegistry};
///
/// let registry = SessionRegistry::new(RegistryConfig::default());
/// let session = registry.create_session(Some("pendant".into()), None);
/// assert!(registry.get_session(session.id).is_some());
///
/// assert!(registry.authenticate_supervisor(session.id, "0000").is_err());
/// assert!(registry.authenticate_supervisor(session.id, "1234").is_ok());
/// ```
pub struct SessionRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Use an explicit time source; tests pass a `ManualClock`.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry_from(now: DateTime<Utc>, extra: TimeDelta) -> DateTime<Utc> {
        now.checked_add_signed(extra)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn push_event(
        &self,
        inner: &mut Inner,
        id: SessionId,
        event: SessionEventKind,
        detail: impl Into<String>,
    ) {
        let entry = SessionEvent {
            timestamp: self.clock.now(),
            session_id: id,
            event,
            detail: detail.into(),
        };
        if let Some(log) = inner.logs.get_mut(&id) {
            log.push(entry);
        } else if let Some((_, log)) = inner.retired.iter_mut().find(|(rid, _)| *rid == id) {
            log.push(entry);
        }
    }

    /// Drop a session, closing its log with `reason` and retiring it.
    fn remove_locked(&self, inner: &mut Inner, id: SessionId, reason: SessionEventKind) -> bool {
        let Some(entry) = inner.sessions.remove(&id) else {
            return false;
        };
        let lived = self.clock.now() - entry.session.created_at;
        self.push_event(
            inner,
            id,
            reason,
            format!("duration {}s", lived.num_seconds()),
        );
        if let Some(log) = inner.logs.remove(&id) {
            inner.retired.push_back((id, log));
            while inner.retired.len() > self.config.max_sessions.max(1) {
                inner.retired.pop_front();
            }
        }
        info!(session_id = %id, reason = ?reason, "session removed");
        true
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Issue a fresh session.  At the cap, the session with the smallest
    /// `created_at` is evicted first.
    pub fn create_session(&self, client_id: Option<String>, user_agent: Option<String>) -> Session {
        let now = self.clock.now();
        let mut inner = self.lock();

        if inner.sessions.len() >= self.config.max_sessions.max(1) {
            let oldest = inner
                .sessions
                .values()
                .min_by_key(|e| (e.session.created_at, e.seq))
                .map(|e| e.session.id);
            if let Some(oldest) = oldest {
                self.remove_locked(&mut inner, oldest, SessionEventKind::SessionEvicted);
            }
        }

        let session = Session {
            id: Uuid::new_v4(),
            client_id,
            user_agent,
            created_at: now,
            last_activity: now,
            expires_at: Self::expiry_from(now, self.config.timeout),
            is_supervisor: false,
            permissions: Vec::new(),
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sessions.insert(
            session.id,
            Entry {
                session: session.clone(),
                seq,
            },
        );
        inner
            .logs
            .insert(session.id, RingLog::new(self.config.log_capacity));
        let detail = format!(
            "client_id={} user_agent={}",
            session.client_id.as_deref().unwrap_or("-"),
            session.user_agent.as_deref().unwrap_or("-")
        );
        self.push_event(&mut inner, session.id, SessionEventKind::SessionCreated, detail);

        info!(
            session_id = %session.id,
            client_id = session.client_id.as_deref().unwrap_or("-"),
            "session created"
        );
        session
    }

    /// Live session by id.  An expired session is removed and `None` is
    /// returned; otherwise `last_activity` is refreshed.
    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired = inner.sessions.get(&id)?.session.is_expired_at(now);
        if expired {
            self.remove_locked(&mut inner, id, SessionEventKind::SessionExpired);
            return None;
        }
        let entry = inner.sessions.get_mut(&id)?;
        entry.session.last_activity = now;
        Some(entry.session.clone())
    }

    /// Refresh `last_activity` without touching `expires_at`.
    pub fn touch(&self, id: SessionId) {
        let now = self.clock.now();
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.session.last_activity = now;
        }
    }

    /// Push `expires_at` to `now + extra` (default: the configured timeout).
    /// Never shortens an existing expiry.
    pub fn extend(&self, id: SessionId, extra: Option<TimeDelta>) -> Result<Session, ArmError> {
        let now = self.clock.now();
        let extra = extra.unwrap_or(self.config.timeout);
        let mut inner = self.lock();

        let expired = inner
            .sessions
            .get(&id)
            .map(|e| e.session.is_expired_at(now))
            .ok_or_else(|| ArmError::SessionNotFound(id.to_string()))?;
        if expired {
            self.remove_locked(&mut inner, id, SessionEventKind::SessionExpired);
            return Err(ArmError::SessionNotFound(id.to_string()));
        }

        let session = {
            let entry = inner
                .sessions
                .get_mut(&id)
                .ok_or_else(|| ArmError::SessionNotFound(id.to_string()))?;
            let candidate = Self::expiry_from(now, extra);
            entry.session.expires_at = entry.session.expires_at.max(candidate);
            entry.session.last_activity = now;
            entry.session.clone()
        };
        self.push_event(
            &mut inner,
            id,
            SessionEventKind::SessionExtended,
            format!("extension {}s", extra.num_seconds()),
        );
        Ok(session)
    }

    pub fn remove_session(&self, id: SessionId) -> bool {
        let mut inner = self.lock();
        self.remove_locked(&mut inner, id, SessionEventKind::SessionRemoved)
    }

    /// Remove every expired session; returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|e| e.session.is_expired_at(now))
            .map(|e| e.session.id)
            .collect();
        for id in &expired {
            self.remove_locked(&mut inner, *id, SessionEventKind::SessionExpired);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions swept");
        }
        expired.len()
    }

    // ── privilege ────────────────────────────────────────────────────────

    /// Grant supervisor rights when `pin` matches.  A failed attempt is
    /// logged and leaves the session untouched.
    pub fn authenticate_supervisor(&self, id: SessionId, pin: &str) -> Result<Session, ArmError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let live = inner
            .sessions
            .get(&id)
            .is_some_and(|e| !e.session.is_expired_at(now));
        if !live {
            warn!(target: "armgate::security", session_id = %id, "supervisor auth for unknown session");
            return Err(ArmError::SessionNotFound(id.to_string()));
        }

        if !self.config.supervisor.matches(pin) {
            self.push_event(
                &mut inner,
                id,
                SessionEventKind::SupervisorAuthFailed,
                "pin_attempt=***",
            );
            warn!(target: "armgate::security", session_id = %id, "supervisor authentication failed");
            return Err(ArmError::Unauthorized("Invalid supervisor PIN".into()));
        }

        let session = {
            let entry = inner
                .sessions
                .get_mut(&id)
                .ok_or_else(|| ArmError::SessionNotFound(id.to_string()))?;
            entry.session.is_supervisor = true;
            for permission in Permission::SUPERVISOR {
                if !entry.session.permissions.contains(&permission) {
                    entry.session.permissions.push(permission);
                }
            }
            entry.session.last_activity = now;
            entry.session.clone()
        };
        self.push_event(&mut inner, id, SessionEventKind::SupervisorAuthSuccess, "");
        info!(target: "armgate::security", session_id = %id, "supervisor access granted");
        Ok(session)
    }

    pub fn revoke_supervisor(&self, id: SessionId) -> Result<(), ArmError> {
        let mut inner = self.lock();
        let entry = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| ArmError::SessionNotFound(id.to_string()))?;
        entry.session.is_supervisor = false;
        entry
            .session
            .permissions
            .retain(|p| !Permission::SUPERVISOR.contains(p));
        self.push_event(&mut inner, id, SessionEventKind::SupervisorRevoked, "");
        info!(target: "armgate::security", session_id = %id, "supervisor access revoked");
        Ok(())
    }

    /// `false` for unknown or expired sessions.
    pub fn has_permission(&self, id: SessionId, permission: Permission) -> bool {
        self.get_session(id)
            .is_some_and(|s| s.has_permission(permission))
    }

    // ── queries ──────────────────────────────────────────────────────────

    /// Unexpired sessions, oldest first.
    pub fn active_sessions(&self) -> Vec<Session> {
        let now = self.clock.now();
        let inner = self.lock();
        let mut live: Vec<&Entry> = inner
            .sessions
            .values()
            .filter(|e| !e.session.is_expired_at(now))
            .collect();
        live.sort_by_key(|e| e.seq);
        live.into_iter().map(|e| e.session.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.lock()
            .sessions
            .values()
            .filter(|e| !e.session.is_expired_at(now))
            .count()
    }

    /// Append an application event (e.g. an issued command) to a session's
    /// trail.  Unknown ids are ignored.
    pub fn record_event(&self, id: SessionId, event: SessionEventKind, detail: impl Into<String>) {
        let mut inner = self.lock();
        self.push_event(&mut inner, id, event, detail);
    }

    /// Up to `limit` events of one session, newest first.
    pub fn session_logs(&self, id: SessionId, limit: usize) -> Vec<SessionEvent> {
        let inner = self.lock();
        inner
            .logs
            .get(&id)
            .or_else(|| {
                inner
                    .retired
                    .iter()
                    .find(|(rid, _)| *rid == id)
                    .map(|(_, log)| log)
            })
            .map(|log| log.recent(limit))
            .unwrap_or_default()
    }

    /// Up to `limit` events across live and retired sessions, newest first.
    pub fn all_logs(&self, limit: usize) -> Vec<SessionEvent> {
        let inner = self.lock();
        let mut all: Vec<SessionEvent> = inner
            .logs
            .values()
            .chain(inner.retired.iter().map(|(_, log)| log))
            .flat_map(|log| log.iter().cloned())
            .collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        all
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armgate_types::{ErrorKind, ManualClock};
    use chrono::TimeZone;

    // ------------------------------------------------------------------ helpers

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn registry(max_sessions: usize) -> (Arc<ManualClock>, SessionRegistry) {
        let clock = Arc::new(ManualClock::new(t0()));
        let config = RegistryConfig {
            timeout: TimeDelta::seconds(60),
            max_sessions,
            ..RegistryConfig::default()
        };
        let registry = SessionRegistry::with_clock(config, clock.clone());
        (clock, registry)
    }

    // ------------------------------------------------------------------ expiry

    #[test]
    fn new_session_expires_after_timeout() {
        let (_clock, registry) = registry(10);
        let session = registry.create_session(Some("ui".into()), Some("firefox".into()));
        assert_eq!(session.created_at, t0());
        assert_eq!(session.expires_at, t0() + TimeDelta::seconds(60));
        assert!(!session.is_supervisor);
        assert!(session.permissions.is_empty());
    }

    #[test]
    fn get_before_expiry_refreshes_activity() {
        let (clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(59));
        let fetched = registry.get_session(session.id).unwrap();
        assert_eq!(fetched.last_activity, t0() + TimeDelta::seconds(59));
        assert_eq!(fetched.expires_at, session.expires_at);
    }

    #[test]
    fn get_at_expiry_removes_session() {
        let (clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(60));
        assert!(registry.get_session(session.id).is_none());
        assert_eq!(registry.active_count(), 0);

        // Still gone once the clock is wound back.
        clock.set(t0());
        assert!(registry.get_session(session.id).is_none());
        let trail = registry.session_logs(session.id, 10);
        assert_eq!(trail[0].event, SessionEventKind::SessionExpired);
    }

    #[test]
    fn touch_does_not_move_expiry() {
        let (clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(30));
        registry.touch(session.id);
        let fetched = registry.get_session(session.id).unwrap();
        assert_eq!(fetched.expires_at, session.expires_at);
    }

    #[test]
    fn extend_pushes_expiry_forward() -> Result<(), Box<dyn std::error::Error>> {
        let (clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(50));
        let extended = registry.extend(session.id, Some(TimeDelta::seconds(120)))?;
        assert_eq!(extended.expires_at, t0() + TimeDelta::seconds(170));

        let defaulted = registry.extend(session.id, None)?;
        assert_eq!(defaulted.expires_at, t0() + TimeDelta::seconds(170));
        Ok(())
    }

    #[test]
    fn extend_never_shortens() {
        let (_clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        let extended = registry
            .extend(session.id, Some(TimeDelta::seconds(5)))
            .unwrap();
        assert_eq!(extended.expires_at, session.expires_at);
    }

    #[test]
    fn extend_unknown_or_expired_fails() {
        let (clock, registry) = registry(10);
        let err = registry.extend(Uuid::new_v4(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let session = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(61));
        assert!(registry.extend(session.id, None).is_err());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn sweep_removes_abandoned_sessions() {
        let (clock, registry) = registry(10);
        let stale = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(30));
        let fresh = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(31));

        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(registry.active_sessions().len(), 1);
        assert_eq!(registry.active_sessions()[0].id, fresh.id);
        assert!(registry.get_session(stale.id).is_none());
        assert_eq!(registry.sweep_expired(), 0);
    }

    // ------------------------------------------------------------------ eviction

    #[test]
    fn cap_evicts_exactly_the_oldest() {
        let (clock, registry) = registry(3);
        let first = registry.create_session(Some("a".into()), None);
        clock.advance(TimeDelta::seconds(1));
        let second = registry.create_session(Some("b".into()), None);
        clock.advance(TimeDelta::seconds(1));
        let third = registry.create_session(Some("c".into()), None);

        // Recent activity on the oldest does not save it.
        registry.touch(first.id);
        clock.advance(TimeDelta::seconds(1));
        let fourth = registry.create_session(Some("d".into()), None);

        let ids: Vec<_> = registry.active_sessions().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id, third.id, fourth.id]);
        assert_eq!(
            registry.session_logs(first.id, 1)[0].event,
            SessionEventKind::SessionEvicted
        );
    }

    #[test]
    fn eviction_tie_breaks_by_creation_order() {
        let (_clock, registry) = registry(2);
        let first = registry.create_session(None, None);
        let second = registry.create_session(None, None);
        let third = registry.create_session(None, None);

        assert!(registry.get_session(first.id).is_none());
        assert!(registry.get_session(second.id).is_some());
        assert!(registry.get_session(third.id).is_some());
    }

    // ------------------------------------------------------------------ privilege

    #[test]
    fn supervisor_auth_grants_permissions() {
        let (_clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        let elevated = registry.authenticate_supervisor(session.id, "1234").unwrap();
        assert!(elevated.is_supervisor);
        assert_eq!(elevated.permissions, Permission::SUPERVISOR.to_vec());
        assert!(registry.has_permission(session.id, Permission::ClearEstop));

        // A second grant does not duplicate permissions.
        let again = registry.authenticate_supervisor(session.id, "1234").unwrap();
        assert_eq!(again.permissions.len(), 3);
    }

    #[test]
    fn failed_auth_leaves_session_unchanged() {
        let (_clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        let err = registry
            .authenticate_supervisor(session.id, "9999")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let after = registry.get_session(session.id).unwrap();
        assert!(!after.is_supervisor);
        assert!(after.permissions.is_empty());
        assert_eq!(after.expires_at, session.expires_at);
        assert_eq!(
            registry.session_logs(session.id, 1)[0].event,
            SessionEventKind::SupervisorAuthFailed
        );
    }

    #[test]
    fn auth_for_unknown_session_fails() {
        let (_clock, registry) = registry(10);
        assert!(matches!(
            registry.authenticate_supervisor(Uuid::new_v4(), "1234"),
            Err(ArmError::SessionNotFound(_))
        ));
    }

    #[test]
    fn revoke_strips_supervisor_permissions() {
        let (_clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        registry.authenticate_supervisor(session.id, "1234").unwrap();
        registry.revoke_supervisor(session.id).unwrap();
        let after = registry.get_session(session.id).unwrap();
        assert!(!after.is_supervisor);
        assert!(after.permissions.is_empty());
        assert!(!registry.has_permission(session.id, Permission::UpdateLimits));
    }

    #[test]
    fn configured_pin_replaces_default() {
        let config = RegistryConfig {
            supervisor: SupervisorSecret::new("2468"),
            ..RegistryConfig::default()
        };
        let registry = SessionRegistry::new(config);
        let session = registry.create_session(None, None);
        assert!(registry.authenticate_supervisor(session.id, "1234").is_err());
        assert!(registry.authenticate_supervisor(session.id, "2468").is_ok());
    }

    // ------------------------------------------------------------------ logs

    #[test]
    fn logs_are_newest_first_and_bounded() {
        let clock = Arc::new(ManualClock::new(t0()));
        let config = RegistryConfig {
            log_capacity: 3,
            ..RegistryConfig::default()
        };
        let registry = SessionRegistry::with_clock(config, clock.clone());
        let session = registry.create_session(None, None);
        for i in 0..5 {
            clock.advance(TimeDelta::seconds(1));
            registry.record_event(session.id, SessionEventKind::CommandIssued, format!("cmd {i}"));
        }
        let trail = registry.session_logs(session.id, 10);
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].detail, "cmd 4");
        assert_eq!(trail[2].detail, "cmd 2");
    }

    #[test]
    fn all_logs_merges_sessions_newest_first() {
        let (clock, registry) = registry(10);
        let a = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(1));
        let b = registry.create_session(None, None);
        clock.advance(TimeDelta::seconds(1));
        registry.remove_session(a.id);

        let all = registry.all_logs(10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event, SessionEventKind::SessionRemoved);
        assert_eq!(all[1].session_id, b.id);
        assert_eq!(registry.all_logs(1).len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_clock, registry) = registry(10);
        let session = registry.create_session(None, None);
        assert!(registry.remove_session(session.id));
        assert!(!registry.remove_session(session.id));
    }
}

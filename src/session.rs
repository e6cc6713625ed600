//! Fixed-capacity table of authenticated browser sessions.
//!
//! Sessions live in an arena of slots addressed by index. Each slot carries a
//! generation that is bumped whenever its occupant is removed, so a stale
//! [`Session`] handle can never destroy or alias a later session in the same
//! slot. The table never grows: when every slot holds a live session,
//! creation fails and the caller proceeds anonymously.

use std::fmt;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use rand::Rng;
use tokio::time::Instant;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE_NAME: &str = "telemetry_session";

pub const NUM_SESSIONS: usize = 5;
pub const SESSION_TTL: Duration = Duration::from_secs(3600);
pub const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Opaque non-zero session token. Rendered as 16 hex digits in cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > 16 {
            return None;
        }
        match u64::from_str_radix(s, 16) {
            Ok(0) | Err(_) => None,
            Ok(id) => Some(Self(id)),
        }
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A live session as seen by callers. A copy: holding one does not keep the
/// session alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub slot: usize,
    pub generation: u64,
    pub last_used: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Occupant {
    id: SessionId,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    occupant: Option<Occupant>,
}

impl Slot {
    fn session(&self, index: usize) -> Option<Session> {
        self.occupant.map(|o| Session {
            id: o.id,
            slot: index,
            generation: self.generation,
            last_used: o.last_used,
        })
    }

    fn vacate(&mut self) -> Option<Occupant> {
        let occupant = self.occupant.take();
        if occupant.is_some() {
            self.generation += 1;
        }
        occupant
    }
}

pub struct SessionTable {
    slots: Vec<Slot>,
    ttl: Duration,
}

impl fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTable")
            .field("capacity", &self.slots.len())
            .field("live", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(NUM_SESSIONS, SESSION_TTL)
    }
}

impl SessionTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Occupied slots, including expired sessions not yet swept.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.occupant.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, occupant: &Occupant, now: Instant) -> bool {
        now.saturating_duration_since(occupant.last_used) >= self.ttl
    }

    /// Start a session in an empty or expired slot.
    ///
    /// Returns `None` when every slot holds a live session.
    pub fn create(&mut self, now: Instant) -> Option<Session> {
        let index = self.slots.iter().position(|slot| match &slot.occupant {
            None => true,
            Some(o) => self.expired(o, now),
        })?;

        let id = self.fresh_id();
        let slot = &mut self.slots[index];
        if let Some(old) = slot.vacate() {
            tracing::debug!(session = %old.id, slot = index, "reclaiming expired session");
        }
        slot.occupant = Some(Occupant { id, last_used: now });
        tracing::debug!(session = %id, slot = index, "session created");
        slot.session(index)
    }

    fn fresh_id(&self) -> SessionId {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.gen();
            if id == 0 {
                continue;
            }
            let taken = self
                .slots
                .iter()
                .any(|s| s.occupant.is_some_and(|o| o.id.0 == id));
            if !taken {
                return SessionId(id);
            }
        }
    }

    /// Look up a live session and refresh its last-used time.
    pub fn get(&mut self, id: SessionId, now: Instant) -> Option<Session> {
        let index = self
            .slots
            .iter()
            .position(|s| s.occupant.is_some_and(|o| o.id == id))?;
        let ttl = self.ttl;
        let slot = &mut self.slots[index];
        let occupant = slot.occupant.as_mut()?;
        if now.saturating_duration_since(occupant.last_used) >= ttl {
            slot.vacate();
            tracing::debug!(session = %id, slot = index, "session expired on lookup");
            return None;
        }
        occupant.last_used = now;
        slot.session(index)
    }

    /// Resolve the session named by the request's cookie. A missing or
    /// malformed cookie is an anonymous request, not an error.
    pub fn get_from_headers(&mut self, headers: &HeaderMap, now: Instant) -> Option<Session> {
        let id = session_id_from_headers(headers)?;
        self.get(id, now)
    }

    /// End `session`. Returns `false` if its slot has since been reused or
    /// cleared.
    pub fn destroy(&mut self, session: &Session) -> bool {
        let Some(slot) = self.slots.get_mut(session.slot) else {
            return false;
        };
        if slot.generation != session.generation
            || !slot.occupant.is_some_and(|o| o.id == session.id)
        {
            return false;
        }
        slot.vacate();
        tracing::debug!(session = %session.id, slot = session.slot, "session destroyed");
        true
    }

    /// Drop every session whose idle time has reached the TTL. Returns the
    /// number removed.
    pub fn check(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let expired = slot
                .occupant
                .is_some_and(|o| now.saturating_duration_since(o.last_used) >= ttl);
            if expired {
                if let Some(old) = slot.vacate() {
                    tracing::debug!(session = %old.id, slot = index, "session expired");
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.session(i))
            .collect()
    }
}

/// Extract the session token from the `Cookie` header(s).
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE_NAME)
        .and_then(|(_, value)| SessionId::parse(value.trim()))
}

/// `Set-Cookie` value establishing `id`.
pub fn session_cookie(id: SessionId) -> String {
    format!("{SESSION_COOKIE_NAME}={id}; Path=/; HttpOnly; SameSite=Strict")
}

/// `Set-Cookie` value clearing the session cookie.
pub fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test(start_paused = true)]
    async fn full_table_refuses_until_expired_slot_is_swept() {
        let mut table = SessionTable::new(5, SESSION_TTL);
        let t0 = Instant::now();
        let first: Vec<Session> = (0..5).map(|_| table.create(t0).unwrap()).collect();

        assert!(table.create(t0).is_none());
        assert_eq!(table.len(), 5);

        // Keep s2..s5 fresh, let s1 age out.
        tokio::time::advance(SESSION_TTL - Duration::from_secs(10)).await;
        let mid = Instant::now();
        for s in &first[1..] {
            assert!(table.get(s.id, mid).is_some());
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        let later = Instant::now();
        assert_eq!(table.check(later), 1);

        let sixth = table.create(later).unwrap();
        assert_eq!(sixth.slot, first[0].slot);
        assert_ne!(sixth.id, first[0].id);
        assert!(table.get(first[0].id, later).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_valid_until_ttl() {
        let mut table = SessionTable::new(2, Duration::from_secs(100));
        let s = table.create(Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(99)).await;
        assert_eq!(table.check(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(table.check(Instant::now()), 1);
        assert!(table.get(s.id, Instant::now()).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_refreshes_last_used() {
        let mut table = SessionTable::new(1, Duration::from_secs(100));
        let s = table.create(Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(table.get(s.id, Instant::now()).is_some());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(table.check(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(table.get(s.id, Instant::now()).is_none());
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let mut table = SessionTable::new(NUM_SESSIONS, SESSION_TTL);
        let now = Instant::now();
        let ids: Vec<SessionId> = (0..NUM_SESSIONS)
            .map(|_| table.create(now).unwrap().id)
            .collect();
        for (i, a) in ids.iter().enumerate() {
            assert_ne!(a.as_u64(), 0);
            assert!(ids[i + 1..].iter().all(|b| b != a));
        }
    }

    #[test]
    fn stale_handle_cannot_destroy_new_occupant() {
        let mut table = SessionTable::new(1, SESSION_TTL);
        let now = Instant::now();
        let old = table.create(now).unwrap();
        assert!(table.destroy(&old));
        assert!(!table.destroy(&old));

        let new = table.create(now).unwrap();
        assert_eq!(new.slot, old.slot);
        assert_ne!(new.generation, old.generation);
        assert!(!table.destroy(&old));
        assert!(table.get(new.id, now).is_some());
    }

    #[test]
    fn cookie_round_trip() {
        let mut table = SessionTable::default();
        let now = Instant::now();
        let s = table.create(now).unwrap();

        let mut headers = HeaderMap::new();
        let cookie = format!("theme=dark; {SESSION_COOKIE_NAME}={}", s.id);
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
        assert_eq!(table.get_from_headers(&headers, now).map(|x| x.id), Some(s.id));
        assert!(session_cookie(s.id).starts_with(&format!("{SESSION_COOKIE_NAME}={}", s.id)));
        assert!(expired_session_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn malformed_cookie_is_anonymous() {
        let mut table = SessionTable::default();
        let now = Instant::now();
        table.create(now).unwrap();
        for bad in ["", "telemetry_session=", "telemetry_session=zz", "telemetry_session=0", "other=1"] {
            let mut headers = HeaderMap::new();
            headers.insert(header::COOKIE, HeaderValue::from_static(bad));
            assert!(table.get_from_headers(&headers, now).is_none(), "{bad:?}");
        }
        assert!(table.get_from_headers(&HeaderMap::new(), now).is_none());
    }
}

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use utoipa::ToSchema;

use crate::models::{InstrumentKey, SessionId};

/// Result of [`SubscriptionRegistry::add_interest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// Another session (or this one) already held interest, so the
    /// instrument is already subscribed upstream
    pub already_subscribed_upstream: bool,
}

/// Result of [`SubscriptionRegistry::remove_interest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// This call removed the last interested session
    pub now_empty: bool,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegistryStats {
    /// Instruments with at least one interested session
    pub instrument_count: usize,
    /// Sessions holding at least one subscription
    pub session_count: usize,
    /// Total (instrument, session) associations
    pub association_count: usize,
}

#[derive(Default)]
struct RegistryInner {
    /// Instrument -> interested sessions. Never holds an empty set.
    instruments: HashMap<InstrumentKey, HashSet<SessionId>>,
    /// Session -> instruments it subscribed to
    sessions: HashMap<SessionId, HashSet<InstrumentKey>>,
    /// Token -> keys with that token, for exchange-less fan-out lookup
    tokens: HashMap<String, HashSet<InstrumentKey>>,
}

/// Process-wide map of instrument interest
///
/// The set of instruments subscribed upstream is exactly the key set of
/// `instruments`: a key is present iff its session set is non-empty.
/// All three indexes live behind one lock so readers never see a
/// partially applied mutation.
///
/// Mutation is crate-private and goes through the session handler; the
/// feed connection and the broadcaster only read.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session` wants `key`. Idempotent.
    pub(crate) fn add_interest(&self, key: InstrumentKey, session: SessionId) -> AddOutcome {
        let mut inner = self.inner.write();

        let already_subscribed_upstream = inner.instruments.contains_key(&key);

        inner
            .tokens
            .entry(key.token().to_string())
            .or_default()
            .insert(key.clone());
        inner
            .sessions
            .entry(session)
            .or_default()
            .insert(key.clone());
        inner.instruments.entry(key).or_default().insert(session);

        AddOutcome {
            already_subscribed_upstream,
        }
    }

    /// Drop `session`'s interest in `key`. Removing an absent pair is a no-op.
    pub(crate) fn remove_interest(&self, key: &InstrumentKey, session: SessionId) -> RemoveOutcome {
        let mut inner = self.inner.write();
        let now_empty = inner.remove_pair(key, session);
        RemoveOutcome { now_empty }
    }

    /// Remove `session` from every interest set
    ///
    /// Returns the keys whose interest set this emptied, sorted.
    pub(crate) fn remove_session(&self, session: SessionId) -> Vec<InstrumentKey> {
        let mut inner = self.inner.write();

        let Some(keys) = inner.sessions.remove(&session) else {
            return Vec::new();
        };

        let mut emptied: Vec<InstrumentKey> = keys
            .into_iter()
            .filter(|key| inner.remove_pair(key, session))
            .collect();
        emptied.sort();
        emptied
    }

    /// Sessions interested in exactly this key
    pub fn interested_sessions(&self, key: &InstrumentKey) -> HashSet<SessionId> {
        self.inner
            .read()
            .instruments
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Sessions interested in `token` on any exchange
    ///
    /// Upstream frames carry no exchange code, so fan-out can only match on
    /// the token. Identical tokens on two exchanges reach the union of both
    /// interest sets.
    pub fn sessions_for_token(&self, token: &str) -> HashSet<SessionId> {
        let inner = self.inner.read();

        let Some(keys) = inner.tokens.get(token) else {
            return HashSet::new();
        };

        keys.iter()
            .filter_map(|key| inner.instruments.get(key))
            .flatten()
            .copied()
            .collect()
    }

    pub fn has_interest(&self, key: &InstrumentKey) -> bool {
        self.inner.read().instruments.contains_key(key)
    }

    /// Instruments that must be subscribed upstream, sorted
    pub fn upstream_instruments(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<InstrumentKey> = self.inner.read().instruments.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Instruments one session is subscribed to, sorted
    pub fn session_instruments(&self, session: SessionId) -> Vec<InstrumentKey> {
        let mut keys: Vec<InstrumentKey> = self
            .inner
            .read()
            .sessions
            .get(&session)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Consistent copy of every instrument with its sessions, sorted by key
    pub fn snapshot(&self) -> Vec<(InstrumentKey, Vec<SessionId>)> {
        let inner = self.inner.read();
        let mut entries: Vec<(InstrumentKey, Vec<SessionId>)> = inner
            .instruments
            .iter()
            .map(|(key, sessions)| {
                let mut sessions: Vec<SessionId> = sessions.iter().copied().collect();
                sessions.sort();
                (key.clone(), sessions)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            instrument_count: inner.instruments.len(),
            session_count: inner.sessions.len(),
            association_count: inner.instruments.values().map(HashSet::len).sum(),
        }
    }
}

impl RegistryInner {
    /// Remove one association from all indexes. Returns true if the
    /// instrument's interest set became empty.
    fn remove_pair(&mut self, key: &InstrumentKey, session: SessionId) -> bool {
        if let Some(keys) = self.sessions.get_mut(&session) {
            keys.remove(key);
            if keys.is_empty() {
                self.sessions.remove(&session);
            }
        }

        let Some(sessions) = self.instruments.get_mut(key) else {
            return false;
        };
        if !sessions.remove(&session) || !sessions.is_empty() {
            return false;
        }

        self.instruments.remove(key);
        if let Some(keys) = self.tokens.get_mut(key.token()) {
            keys.remove(key);
            if keys.is_empty() {
                self.tokens.remove(key.token());
            }
        }
        true
    }
}

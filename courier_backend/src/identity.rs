//! Sending identities and the policy that picks one for each send.
//!
//! The pool is shared by every flow task. Its cooldown map, rotation cursor
//! and in-flight set live behind a single mutex; selection and all state
//! changes happen inside that one critical section.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sends one identity may perform for a flow before it is rotated out.
pub const DEFAULT_TURN_CAP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendMode {
    #[serde(rename = "single_account", alias = "single")]
    Single,
    #[serde(rename = "random")]
    Random,
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
}

impl SendMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" | "single_account" => Some(SendMode::Single),
            "random" => Some(SendMode::Random),
            "round_robin" | "roundrobin" | "rr" => Some(SendMode::RoundRobin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub index: usize,
    pub session: String,
}

/// Pure selection policy.
///
/// `cursor` is the index handed out by the previous round-robin call (`None`
/// before the first). Returns the chosen index, or `None` when nothing is
/// usable under `mode`.
pub fn select_identity<F, R>(
    mode: SendMode,
    count: usize,
    cursor: Option<usize>,
    is_available: F,
    rng: &mut R,
) -> Option<usize>
where
    F: Fn(usize) -> bool,
    R: Rng + ?Sized,
{
    if count == 0 {
        return None;
    }

    match mode {
        SendMode::Single => is_available(0).then_some(0),
        SendMode::Random => {
            let mut order: Vec<usize> = (0..count).collect();
            order.shuffle(rng);
            order.into_iter().find(|&i| is_available(i))
        }
        SendMode::RoundRobin => {
            let start = cursor.map(|c| (c + 1) % count).unwrap_or(0);
            (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| is_available(i))
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    cursor: Option<usize>,
    cooldown_until: HashMap<String, DateTime<Utc>>,
    in_flight: HashSet<String>,
}

pub struct IdentityPool {
    sessions: Vec<String>,
    blocked: HashSet<String>,
    state: Mutex<PoolState>,
}

impl IdentityPool {
    pub fn new(sessions: Vec<String>, blocked: HashSet<String>) -> Self {
        Self {
            sessions,
            blocked,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sessions(&self) -> &[String] {
        &self.sessions
    }

    fn usable(&self, state: &PoolState, session: &str, now: DateTime<Utc>) -> bool {
        if self.blocked.contains(session) || state.in_flight.contains(session) {
            return false;
        }
        state
            .cooldown_until
            .get(session)
            .map_or(true, |until| now >= *until)
    }

    pub fn acquire(self: &Arc<Self>, mode: SendMode) -> Option<IdentityLease> {
        self.acquire_at(mode, Utc::now())
    }

    /// Pick an identity and mark it in flight until the lease is dropped.
    pub fn acquire_at(self: &Arc<Self>, mode: SendMode, now: DateTime<Utc>) -> Option<IdentityLease> {
        let mut state = self.lock_state();
        let idx = select_identity(
            mode,
            self.sessions.len(),
            state.cursor,
            |i| self.usable(&state, &self.sessions[i], now),
            &mut rand::rng(),
        )?;

        if mode == SendMode::RoundRobin {
            state.cursor = Some(idx);
        }
        let session = self.sessions[idx].clone();
        state.in_flight.insert(session.clone());

        Some(IdentityLease {
            pool: Arc::clone(self),
            identity: Identity {
                index: idx,
                session,
            },
        })
    }

    /// Put `session` on cooldown for `duration` from now. An existing longer
    /// cooldown is kept.
    pub fn cool_down(&self, session: &str, duration: Duration) -> DateTime<Utc> {
        self.cool_down_from(session, duration, Utc::now())
    }

    pub fn cool_down_from(&self, session: &str, duration: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut state = self.lock_state();
        let until = now
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let slot = state
            .cooldown_until
            .entry(session.to_string())
            .or_insert(until);
        if until > *slot {
            *slot = until;
        }
        *slot
    }

    pub fn cooldown_until(&self, session: &str) -> Option<DateTime<Utc>> {
        self.lock_state().cooldown_until.get(session).copied()
    }

    pub fn is_available_at(&self, session: &str, now: DateTime<Utc>) -> bool {
        let state = self.lock_state();
        self.sessions.iter().any(|s| s == session) && self.usable(&state, session, now)
    }

    pub fn available_count(&self) -> usize {
        let now = Utc::now();
        let state = self.lock_state();
        self.sessions
            .iter()
            .filter(|s| self.usable(&state, s, now))
            .count()
    }

    fn release(&self, session: &str) {
        self.lock_state().in_flight.remove(session);
    }
}

/// An identity checked out of the pool for one send attempt.
pub struct IdentityLease {
    pool: Arc<IdentityPool>,
    identity: Identity,
}

impl IdentityLease {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session(&self) -> &str {
        &self.identity.session
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        self.pool.release(&self.identity.session);
    }
}

/// Flow-local count of consecutive sends per identity.
///
/// Each flow owns its own counter, but the cooldown applied when the cap is
/// reached lands in the shared pool and therefore affects every flow.
#[derive(Debug)]
pub struct TurnCounter {
    cap: u32,
    counts: HashMap<String, u32>,
}

impl TurnCounter {
    pub fn new(cap: u32) -> Self {
        Self {
            cap: cap.max(1),
            counts: HashMap::new(),
        }
    }

    pub fn count(&self, session: &str) -> u32 {
        self.counts.get(session).copied().unwrap_or(0)
    }

    /// Count a successful send. Returns true when the identity just used up
    /// its turn; the count then starts over for the next turn.
    pub fn record_send(&mut self, session: &str) -> bool {
        let count = self.counts.entry(session.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.cap {
            self.counts.remove(session);
            true
        } else {
            false
        }
    }
}

impl Default for TurnCounter {
    fn default() -> Self {
        Self::new(DEFAULT_TURN_CAP)
    }
}

/// Load the static deny-list of permanently blocked sessions.
pub fn load_deny_list<P: AsRef<Path>>(path: P) -> Result<HashSet<String>> {
    let path = path.as_ref();
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read deny-list {:?}", path)),
    };
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

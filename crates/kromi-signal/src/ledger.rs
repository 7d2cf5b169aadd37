//! Relay-side record of live device/viewer pairs.
//!
//! The relay never sees descriptions or candidates as anything but opaque
//! blobs; it only tracks where each pair is in the negotiation so it can
//! enforce one session per pair, tear pairs down when a participant leaves,
//! and expire negotiations that stall.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use kromi_common::{Error, PairKey, Result, SessionState};

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub state: SessionState,
    pub created_at: Instant,
    pub updated_at: Instant,
}

#[derive(Debug, Default)]
pub struct SessionLedger {
    entries: HashMap<PairKey, LedgerEntry>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pair in `new`. Returns false when the pair already has a live
    /// entry, which callers treat as a no-op.
    pub fn begin(&mut self, pair: PairKey, now: Instant) -> bool {
        if self.entries.contains_key(&pair) {
            return false;
        }
        self.entries.insert(
            pair,
            LedgerEntry {
                state: SessionState::New,
                created_at: now,
                updated_at: now,
            },
        );
        true
    }

    pub fn get(&self, pair: &PairKey) -> Option<&LedgerEntry> {
        self.entries.get(pair)
    }

    pub fn contains(&self, pair: &PairKey) -> bool {
        self.entries.contains_key(pair)
    }

    /// Move a live pair to `next`, returning the previous state.
    pub fn advance(&mut self, pair: &PairKey, next: SessionState, now: Instant) -> Result<SessionState> {
        let entry = self
            .entries
            .get_mut(pair)
            .ok_or_else(|| Error::UnknownSession(pair.to_string()))?;
        let from = entry.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        entry.state = next;
        entry.updated_at = now;
        Ok(from)
    }

    pub fn remove(&mut self, pair: &PairKey) -> Option<LedgerEntry> {
        self.entries.remove(pair)
    }

    /// Every pair with `participant_id` on either side.
    pub fn pairs_involving(&self, participant_id: &str) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self
            .entries
            .keys()
            .filter(|pair| pair.involves(participant_id))
            .cloned()
            .collect();
        pairs.sort();
        pairs
    }

    pub fn device_has_sessions(&self, device_id: &str) -> bool {
        self.entries.keys().any(|pair| pair.device_id == device_id)
    }

    /// Pairs that have not reached `connected` within `timeout` of their
    /// creation.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.state != SessionState::Connected
                    && now.saturating_duration_since(entry.created_at) >= timeout
            })
            .map(|(pair, _)| pair.clone())
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state_counts(&self) -> SessionStateCounts {
        let mut counts = SessionStateCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                SessionState::New => counts.new += 1,
                SessionState::OfferSent => counts.offer_sent += 1,
                SessionState::AnswerSent => counts.answer_sent += 1,
                SessionState::Connected => counts.connected += 1,
                SessionState::Failed | SessionState::Closed => {}
            }
        }
        counts
    }
}

/// Session state counts for metrics
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct SessionStateCounts {
    pub new: usize,
    pub offer_sent: usize,
    pub answer_sent: usize,
    pub connected: usize,
}

//! Per-pair negotiation state owned by one coordinator.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use kromi_common::{Error, IceCandidate, PairKey, Result, SessionDescription, SessionState};

pub struct PeerSession {
    pub pair: PairKey,
    /// Distinguishes this session from earlier ones on the same pair.
    pub epoch: u64,
    pub state: SessionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub started_at: Instant,
    pending_candidates: VecDeque<IceCandidate>,
    applying_candidates: bool,
    /// Offer received before the capture source was ready.
    pending_offer: Option<SessionDescription>,
    /// A transport future for this session is in flight.
    negotiating: bool,
}

impl PeerSession {
    pub fn new(pair: PairKey, epoch: u64, now: Instant) -> Self {
        Self {
            pair,
            epoch,
            state: SessionState::New,
            local_description: None,
            remote_description: None,
            started_at: now,
            pending_candidates: VecDeque::new(),
            applying_candidates: false,
            pending_offer: None,
            negotiating: false,
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn set_local_description(&mut self, description: SessionDescription) {
        self.local_description = Some(description);
    }

    /// Store the remote description and hand back the candidates that were
    /// waiting for it, oldest first.
    pub fn set_remote_description(&mut self, description: SessionDescription) -> Option<Vec<IceCandidate>> {
        self.remote_description = Some(description);
        self.next_candidate_batch()
    }

    /// Returns the candidates to apply now, or `None` if `candidate` was
    /// queued behind a missing remote description or an in-flight batch.
    pub fn receive_candidate(&mut self, candidate: IceCandidate) -> Option<Vec<IceCandidate>> {
        self.pending_candidates.push_back(candidate);
        self.next_candidate_batch()
    }

    /// The previous batch reached the transport; release the next one.
    pub fn finish_candidate_batch(&mut self) -> Option<Vec<IceCandidate>> {
        self.applying_candidates = false;
        self.next_candidate_batch()
    }

    fn next_candidate_batch(&mut self) -> Option<Vec<IceCandidate>> {
        if self.remote_description.is_none()
            || self.applying_candidates
            || self.pending_candidates.is_empty()
        {
            return None;
        }
        self.applying_candidates = true;
        Some(self.pending_candidates.drain(..).collect())
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn hold_offer(&mut self, offer: SessionDescription) {
        self.pending_offer = Some(offer);
    }

    pub fn take_pending_offer(&mut self) -> Option<SessionDescription> {
        self.pending_offer.take()
    }

    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.is_some()
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    pub fn set_negotiating(&mut self, negotiating: bool) {
        self.negotiating = negotiating;
    }

    /// Enter `closed` and drop buffered candidates. Returns how many were
    /// discarded.
    pub fn close(&mut self) -> usize {
        self.state = SessionState::Closed;
        self.pending_offer = None;
        self.applying_candidates = false;
        let dropped = self.pending_candidates.len();
        self.pending_candidates.clear();
        dropped
    }

    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.state != SessionState::Connected
            && !self.state.is_terminal()
            && now.saturating_duration_since(self.started_at) >= timeout
    }
}

/// Live sessions of one participant, at most one per pair.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<PairKey, PeerSession>,
    next_epoch: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, pair: PairKey, now: Instant) -> Result<&mut PeerSession> {
        if self.sessions.contains_key(&pair) {
            return Err(Error::DuplicateSession(pair.to_string()));
        }
        self.next_epoch += 1;
        let session = PeerSession::new(pair.clone(), self.next_epoch, now);
        Ok(self.sessions.entry(pair).or_insert(session))
    }

    pub fn get(&self, pair: &PairKey) -> Option<&PeerSession> {
        self.sessions.get(pair)
    }

    pub fn get_mut(&mut self, pair: &PairKey) -> Option<&mut PeerSession> {
        self.sessions.get_mut(pair)
    }

    /// The session for `pair` only if it is still the one tagged `epoch`.
    pub fn current_mut(&mut self, pair: &PairKey, epoch: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(pair)
            .filter(|session| session.epoch == epoch)
    }

    pub fn contains(&self, pair: &PairKey) -> bool {
        self.sessions.contains_key(pair)
    }

    pub fn remove(&mut self, pair: &PairKey) -> Option<PeerSession> {
        self.sessions.remove(pair)
    }

    pub fn pairs_involving(&self, participant_id: &str) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self
            .sessions
            .keys()
            .filter(|pair| pair.involves(participant_id))
            .cloned()
            .collect();
        pairs.sort();
        pairs
    }

    pub fn pairs(&self) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self.sessions.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Sessions waiting on the capture source with an offer in hand.
    pub fn awaiting_source(&self) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self
            .sessions
            .values()
            .filter(|session| session.has_pending_offer())
            .map(|session| session.pair.clone())
            .collect();
        pairs.sort();
        pairs
    }

    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self
            .sessions
            .values()
            .filter(|session| session.is_stalled(now, timeout))
            .map(|session| session.pair.clone())
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

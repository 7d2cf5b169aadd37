//! Session Negotiation Coordinator.
//!
//! One actor per local participant. Everything that mutates a
//! [`PeerSession`] runs on the actor task: signaling messages, transport
//! callbacks, local intents and the completions of transport futures all
//! arrive as messages. Transport futures run on spawned tasks and report back
//! tagged with the session epoch, so a completion for a session that was
//! closed (or closed and reopened) in the meantime is discarded.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kromi_common::{
    AnswerPayload, CandidatePayload, CloseReason, DeviceInfo, Empty, Error, IceCandidate,
    OfferPayload, PairKey, ParticipantRole, Registered, Result, SessionDescription, SessionState,
    SessionStateReport, SignalMessage, StreamCommand, StreamTarget, TransportState,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::roster::DeviceRoster;
use crate::session::SessionTable;
use crate::transport::{CaptureLayer, LocalSource, MediaTransport, TransportEvent};

const INPUT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub local_id: String,
    pub role: ParticipantRole,
    /// Sessions not `connected` after this long are closed on the next tick.
    pub negotiation_timeout: Duration,
    pub tick_interval: Duration,
}

impl CoordinatorConfig {
    pub fn viewer(viewer_id: impl Into<String>) -> Self {
        Self::new(viewer_id, ParticipantRole::Viewer)
    }

    pub fn device(device_id: impl Into<String>) -> Self {
        Self::new(device_id, ParticipantRole::Device)
    }

    fn new(local_id: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            local_id: local_id.into(),
            role,
            negotiation_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_secs(5),
        }
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

#[derive(Debug)]
pub enum CoordinatorInput {
    Signal(SignalMessage),
    Transport(TransportEvent),
    /// Viewer intent.
    StartStream { device_id: String },
    /// Viewer intent.
    StopStream { device_id: String },
    Tick,
    Shutdown,
}

/// What the coordinator reports to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Registered(Registered),
    DevicesListed(Vec<DeviceInfo>),
    DeviceOnline(DeviceInfo),
    DeviceOffline(DeviceInfo),
    StreamAccepted { device_id: String },
    StreamUnavailable { device_id: String },
    SessionState { pair: PairKey, state: SessionState },
    SessionClosed { pair: PairKey, reason: CloseReason },
    RelayError { message: String },
}

enum Completion {
    SourceAcquired(Result<LocalSource>),
    OfferCreated {
        pair: PairKey,
        epoch: u64,
        result: Result<SessionDescription>,
    },
    OfferAccepted {
        pair: PairKey,
        epoch: u64,
        offer: SessionDescription,
        result: Result<SessionDescription>,
    },
    AnswerApplied {
        pair: PairKey,
        epoch: u64,
        answer: SessionDescription,
        result: Result<()>,
    },
    CandidatesApplied {
        pair: PairKey,
        epoch: u64,
        applied: usize,
        failed: usize,
    },
}

enum SourceState {
    Idle,
    Acquiring,
    Ready(LocalSource),
}

/// Cloneable mailbox of a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorInput>,
}

impl CoordinatorHandle {
    pub async fn send(&self, input: CoordinatorInput) -> Result<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| Error::internal("coordinator stopped"))
    }

    pub async fn signal(&self, msg: SignalMessage) -> Result<()> {
        self.send(CoordinatorInput::Signal(msg)).await
    }

    pub async fn start_stream(&self, device_id: impl Into<String>) -> Result<()> {
        self.send(CoordinatorInput::StartStream {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn stop_stream(&self, device_id: impl Into<String>) -> Result<()> {
        self.send(CoordinatorInput::StopStream {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn tick(&self) -> Result<()> {
        self.send(CoordinatorInput::Tick).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(CoordinatorInput::Shutdown).await
    }

    /// Post a transport callback without waiting. Usable from the media
    /// layer's own callback threads.
    pub fn post_transport_event(&self, event: TransportEvent) -> bool {
        self.tx.try_send(CoordinatorInput::Transport(event)).is_ok()
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn MediaTransport>,
    capture: Option<Arc<dyn CaptureLayer>>,
    sessions: SessionTable,
    roster: DeviceRoster,
    source: SourceState,
    outbox: mpsc::Sender<SignalMessage>,
    events: mpsc::Sender<CoordinatorEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    completions_rx: Option<mpsc::UnboundedReceiver<Completion>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn MediaTransport>,
        outbox: mpsc::Sender<SignalMessage>,
        events: mpsc::Sender<CoordinatorEvent>,
    ) -> Self {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        Self {
            config,
            transport,
            capture: None,
            sessions: SessionTable::new(),
            roster: DeviceRoster::new(),
            source: SourceState::Idle,
            outbox,
            events,
            completions,
            completions_rx: Some(completions_rx),
        }
    }

    /// Capture layer shared by every session of a device.
    pub fn with_capture(mut self, capture: Arc<dyn CaptureLayer>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (CoordinatorHandle { tx }, task)
    }

    async fn run(mut self, mut inputs: mpsc::Receiver<CoordinatorInput>) {
        let Some(mut completions) = self.completions_rx.take() else {
            warn!("coordinator for {} started twice", self.config.local_id);
            return;
        };
        let period = self.config.tick_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        info!(
            "{} coordinator running for {}",
            self.config.role, self.config.local_id
        );

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(CoordinatorInput::Shutdown) | None => break,
                    Some(input) => self.handle_input(input),
                },
                Some(done) = completions.recv() => self.handle_completion(done),
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
        }

        self.shutdown().await;
    }

    fn handle_input(&mut self, input: CoordinatorInput) {
        match input {
            CoordinatorInput::Signal(msg) => self.handle_signal(msg),
            CoordinatorInput::Transport(event) => self.handle_transport_event(event),
            CoordinatorInput::StartStream { device_id } => self.start_stream(device_id),
            CoordinatorInput::StopStream { device_id } => self.stop_stream(device_id),
            CoordinatorInput::Tick => self.on_tick(Instant::now()),
            CoordinatorInput::Shutdown => {}
        }
    }

    fn local_id(&self) -> &str {
        &self.config.local_id
    }

    fn is_viewer(&self) -> bool {
        self.config.role == ParticipantRole::Viewer
    }

    /// Pair between this participant and `remote_id`.
    fn pair_with(&self, remote_id: &str) -> PairKey {
        match self.config.role {
            ParticipantRole::Device => PairKey::new(self.local_id(), remote_id),
            ParticipantRole::Viewer => PairKey::new(remote_id, self.local_id()),
        }
    }

    fn remote_of(&self, pair: &PairKey) -> String {
        match self.config.role {
            ParticipantRole::Device => pair.viewer_id.clone(),
            ParticipantRole::Viewer => pair.device_id.clone(),
        }
    }

    fn send_signal(&self, msg: SignalMessage) {
        let kind = msg.kind();
        if self.outbox.try_send(msg).is_err() {
            warn!("dropping outbound {}: signaling outbox unavailable", kind);
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        if self.events.try_send(event).is_err() {
            debug!("coordinator event dropped: no listener capacity");
        }
    }

    fn emit_state(&self, pair: &PairKey, state: SessionState) {
        self.emit(CoordinatorEvent::SessionState {
            pair: pair.clone(),
            state,
        });
    }

    fn spawn_transport<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let done = self.completions.clone();
        tokio::spawn(async move {
            let _ = done.send(work.await);
        });
    }

    fn handle_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::Registered(registered) => {
                info!(
                    "registered as {} {} for event {}",
                    registered.role, registered.participant_id, registered.event_id
                );
                self.emit(CoordinatorEvent::Registered(registered));
            }
            SignalMessage::DevicesList(devices) => {
                self.roster.replace(devices.clone());
                self.emit(CoordinatorEvent::DevicesListed(devices));
            }
            SignalMessage::DeviceOnline(device) => {
                self.roster.upsert(device.clone());
                self.emit(CoordinatorEvent::DeviceOnline(device));
            }
            SignalMessage::DeviceOffline(device) => {
                self.roster.remove(&device.device_id);
                for pair in self.sessions.pairs_involving(&device.device_id) {
                    self.close_session(&pair, CloseReason::ParticipantLeft);
                }
                self.emit(CoordinatorEvent::DeviceOffline(device));
            }
            SignalMessage::StreamAccepted(target) => {
                debug!("relay forwarded start for {}", target.device_id);
                self.emit(CoordinatorEvent::StreamAccepted {
                    device_id: target.device_id,
                });
            }
            SignalMessage::DeviceUnavailable(target) => {
                let pair = self.pair_with(&target.device_id);
                self.close_session(&pair, CloseReason::DeviceUnavailable);
                self.emit(CoordinatorEvent::StreamUnavailable {
                    device_id: target.device_id,
                });
            }
            SignalMessage::StreamCommand(command) => {
                if self.is_viewer() {
                    warn!("viewer {} ignoring stream-command", self.local_id());
                    return;
                }
                match command.command {
                    StreamCommand::Start => {
                        info!("start requested by {}", command.viewer_id);
                        self.ensure_source();
                    }
                    StreamCommand::Stop => {
                        let pair = self.pair_with(&command.viewer_id);
                        self.close_session(&pair, CloseReason::StopRequested);
                    }
                }
            }
            SignalMessage::Offer(payload) => self.on_remote_offer(payload),
            SignalMessage::Answer(payload) => self.on_remote_answer(payload),
            SignalMessage::IceCandidate(payload) => self.on_remote_candidate(payload),
            SignalMessage::SessionClosed(closed) => {
                let pair = closed.pair();
                if pair.involves(self.local_id()) {
                    self.close_session(&pair, closed.reason);
                }
            }
            SignalMessage::Error(error) => {
                warn!("relay error: {}", error.message);
                self.emit(CoordinatorEvent::RelayError {
                    message: error.message,
                });
            }
            other => debug!("ignoring {} from relay", other.kind()),
        }
    }

    fn start_stream(&mut self, device_id: String) {
        if !self.is_viewer() {
            warn!("start-stream is a viewer intent; ignored on device");
            return;
        }
        let pair = self.pair_with(&device_id);
        let epoch = match self.sessions.open(pair.clone(), Instant::now()) {
            Ok(session) => {
                session.set_negotiating(true);
                session.epoch
            }
            Err(err) => {
                debug!("start-stream for {} ignored: {}", device_id, err);
                return;
            }
        };
        info!("starting stream from {}", device_id);
        self.emit_state(&pair, SessionState::New);
        self.send_signal(SignalMessage::StartStream(StreamTarget { device_id }));

        let transport = self.transport.clone();
        self.spawn_transport(async move {
            let result = transport.create_offer(&pair).await;
            Completion::OfferCreated {
                pair,
                epoch,
                result,
            }
        });
    }

    fn stop_stream(&mut self, device_id: String) {
        if !self.is_viewer() {
            warn!("stop-stream is a viewer intent; ignored on device");
            return;
        }
        let pair = self.pair_with(&device_id);
        self.send_signal(SignalMessage::StopStream(StreamTarget { device_id }));
        self.close_session(&pair, CloseReason::StopRequested);
    }

    fn on_remote_offer(&mut self, payload: OfferPayload) {
        if self.is_viewer() {
            warn!("viewer {} ignoring offer from {}", self.local_id(), payload.from);
            return;
        }
        let pair = self.pair_with(&payload.from);
        let epoch = match self.sessions.open(pair.clone(), Instant::now()) {
            Ok(session) => session.epoch,
            Err(err) => {
                warn!("rejecting offer from {}: {}", payload.from, err);
                return;
            }
        };
        self.emit_state(&pair, SessionState::New);

        match &self.source {
            SourceState::Ready(source) => {
                let source = source.clone();
                self.begin_accept(pair, epoch, payload.offer, source);
            }
            _ => {
                debug!("holding offer for {} until capture is ready", pair);
                if let Some(session) = self.sessions.get_mut(&pair) {
                    session.hold_offer(payload.offer);
                }
                self.ensure_source();
            }
        }
    }

    fn begin_accept(
        &mut self,
        pair: PairKey,
        epoch: u64,
        offer: SessionDescription,
        source: LocalSource,
    ) {
        let Some(session) = self.sessions.current_mut(&pair, epoch) else {
            return;
        };
        session.set_negotiating(true);

        let transport = self.transport.clone();
        self.spawn_transport(async move {
            let result = transport.accept_offer(&pair, offer.clone(), source).await;
            Completion::OfferAccepted {
                pair,
                epoch,
                offer,
                result,
            }
        });
    }

    fn on_remote_answer(&mut self, payload: AnswerPayload) {
        if !self.is_viewer() {
            warn!("device {} ignoring answer from {}", self.local_id(), payload.from);
            return;
        }
        let pair = self.pair_with(&payload.from);
        let epoch = match self.sessions.get_mut(&pair) {
            Some(session) if session.state == SessionState::OfferSent && !session.is_negotiating() => {
                session.set_negotiating(true);
                session.epoch
            }
            Some(session) => {
                warn!("unexpected answer for {} in state {}", pair, session.state);
                return;
            }
            None => {
                debug!("dropping answer for unknown pair {}", pair);
                return;
            }
        };

        let transport = self.transport.clone();
        let answer = payload.answer;
        self.spawn_transport(async move {
            let result = transport.apply_answer(&pair, answer.clone()).await;
            Completion::AnswerApplied {
                pair,
                epoch,
                answer,
                result,
            }
        });
    }

    fn on_remote_candidate(&mut self, payload: CandidatePayload) {
        let pair = self.pair_with(&payload.from);
        let Some(session) = self.sessions.get_mut(&pair) else {
            debug!("dropping candidate for unknown pair {}", pair);
            return;
        };
        let epoch = session.epoch;
        match session.receive_candidate(payload.candidate) {
            Some(batch) => self.apply_candidates(pair, epoch, batch),
            None => debug!(
                "buffered candidate for {} ({} pending)",
                pair,
                session.pending_candidates()
            ),
        }
    }

    /// Apply `batch` in order on one task; the next batch waits for this one.
    fn apply_candidates(&self, pair: PairKey, epoch: u64, batch: Vec<IceCandidate>) {
        let transport = self.transport.clone();
        self.spawn_transport(async move {
            let mut applied = 0;
            let mut failed = 0;
            for candidate in batch {
                match transport.add_remote_candidate(&pair, candidate).await {
                    Ok(()) => applied += 1,
                    Err(err) => {
                        warn!("failed to add candidate for {}: {}", pair, err);
                        failed += 1;
                    }
                }
            }
            Completion::CandidatesApplied {
                pair,
                epoch,
                applied,
                failed,
            }
        });
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate { pair, candidate } => {
                if !self.sessions.contains(&pair) {
                    debug!("dropping local candidate for closed pair {}", pair);
                    return;
                }
                let to = self.remote_of(&pair);
                self.send_signal(SignalMessage::IceCandidate(CandidatePayload {
                    from: self.local_id().to_string(),
                    to,
                    candidate,
                }));
            }
            TransportEvent::StateChanged { pair, state } => self.on_transport_state(pair, state),
        }
    }

    fn on_transport_state(&mut self, pair: PairKey, state: TransportState) {
        let Some(session) = self.sessions.get_mut(&pair) else {
            debug!("ignoring {:?} for closed pair {}", state, pair);
            return;
        };

        let next = match state {
            TransportState::Connecting => return,
            TransportState::Connected => SessionState::Connected,
            TransportState::Disconnected | TransportState::Failed => SessionState::Failed,
        };
        if let Err(err) = session.transition(next) {
            debug!("transport {:?} for {}: {}", state, pair, err);
            return;
        }

        self.emit_state(&pair, next);
        self.report_state(&pair, state);
        if next == SessionState::Failed {
            warn!("transport for {} {:?}", pair, state);
            self.close_session(&pair, CloseReason::TransportFailed);
        } else {
            info!("pair {} connected", pair);
        }
    }

    fn report_state(&self, pair: &PairKey, state: TransportState) {
        self.send_signal(SignalMessage::SessionState(SessionStateReport {
            from: self.local_id().to_string(),
            to: self.remote_of(pair),
            state,
        }));
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::SourceAcquired(result) => self.on_source_acquired(result),
            Completion::OfferCreated {
                pair,
                epoch,
                result,
            } => self.on_offer_created(pair, epoch, result),
            Completion::OfferAccepted {
                pair,
                epoch,
                offer,
                result,
            } => self.on_offer_accepted(pair, epoch, offer, result),
            Completion::AnswerApplied {
                pair,
                epoch,
                answer,
                result,
            } => self.on_answer_applied(pair, epoch, answer, result),
            Completion::CandidatesApplied {
                pair,
                epoch,
                applied,
                failed,
            } => {
                debug!("{} candidates applied for {} ({} failed)", applied, pair, failed);
                let Some(session) = self.sessions.current_mut(&pair, epoch) else {
                    return;
                };
                if let Some(batch) = session.finish_candidate_batch() {
                    self.apply_candidates(pair, epoch, batch);
                }
            }
        }
    }

    fn on_offer_created(&mut self, pair: PairKey, epoch: u64, result: Result<SessionDescription>) {
        let Some(session) = self.sessions.current_mut(&pair, epoch) else {
            debug!("discarding offer for superseded session {}", pair);
            return;
        };
        session.set_negotiating(false);

        let outcome = result.and_then(|offer| {
            session.set_local_description(offer.clone());
            session.transition(SessionState::OfferSent).map(|_| offer)
        });
        match outcome {
            Ok(offer) => {
                self.send_signal(SignalMessage::Offer(OfferPayload {
                    from: self.local_id().to_string(),
                    to: pair.device_id.clone(),
                    offer,
                }));
                self.emit_state(&pair, SessionState::OfferSent);
            }
            Err(err) => self.fail_negotiation(&pair, err),
        }
    }

    fn on_offer_accepted(
        &mut self,
        pair: PairKey,
        epoch: u64,
        offer: SessionDescription,
        result: Result<SessionDescription>,
    ) {
        let Some(session) = self.sessions.current_mut(&pair, epoch) else {
            debug!("discarding answer for superseded session {}", pair);
            return;
        };
        session.set_negotiating(false);

        let outcome = result.and_then(|answer| {
            let flushed = session.set_remote_description(offer);
            session.set_local_description(answer.clone());
            session
                .transition(SessionState::AnswerSent)
                .map(|_| (answer, flushed))
        });
        match outcome {
            Ok((answer, flushed)) => {
                self.send_signal(SignalMessage::Answer(AnswerPayload {
                    from: self.local_id().to_string(),
                    to: pair.viewer_id.clone(),
                    answer,
                }));
                self.emit_state(&pair, SessionState::AnswerSent);
                if let Some(batch) = flushed {
                    debug!("flushing {} buffered candidates for {}", batch.len(), pair);
                    self.apply_candidates(pair, epoch, batch);
                }
            }
            Err(err) => self.fail_negotiation(&pair, err),
        }
    }

    fn on_answer_applied(
        &mut self,
        pair: PairKey,
        epoch: u64,
        answer: SessionDescription,
        result: Result<()>,
    ) {
        let Some(session) = self.sessions.current_mut(&pair, epoch) else {
            debug!("discarding applied answer for superseded session {}", pair);
            return;
        };
        session.set_negotiating(false);

        let outcome = result.and_then(|()| {
            let flushed = session.set_remote_description(answer);
            session
                .transition(SessionState::AnswerSent)
                .map(|_| flushed)
        });
        match outcome {
            Ok(flushed) => {
                self.emit_state(&pair, SessionState::AnswerSent);
                if let Some(batch) = flushed {
                    debug!("flushing {} buffered candidates for {}", batch.len(), pair);
                    self.apply_candidates(pair, epoch, batch);
                }
            }
            Err(err) => self.fail_negotiation(&pair, err),
        }
    }

    /// Local negotiation error: tell the relay the pair failed and close it.
    fn fail_negotiation(&mut self, pair: &PairKey, err: Error) {
        warn!("negotiation for {} failed: {}", pair, err);
        self.report_state(pair, TransportState::Failed);
        self.close_session(pair, CloseReason::NegotiationError);
    }

    fn ensure_source(&mut self) {
        if !matches!(self.source, SourceState::Idle) {
            return;
        }
        let Some(capture) = self.capture.clone() else {
            warn!("device {} has no capture layer", self.local_id());
            self.on_source_acquired(Err(Error::config("no capture layer configured")));
            return;
        };
        self.source = SourceState::Acquiring;
        self.spawn_transport(async move { Completion::SourceAcquired(capture.acquire().await) });
    }

    fn on_source_acquired(&mut self, result: Result<LocalSource>) {
        match result {
            Ok(source) => {
                if !matches!(self.source, SourceState::Acquiring) {
                    debug!("releasing capture source {} nobody waits for", source.id);
                    self.release(source);
                    return;
                }
                info!("capture source {} ready", source.label);
                self.source = SourceState::Ready(source.clone());
                for pair in self.sessions.awaiting_source() {
                    let Some(session) = self.sessions.get_mut(&pair) else {
                        continue;
                    };
                    let epoch = session.epoch;
                    if let Some(offer) = session.take_pending_offer() {
                        self.begin_accept(pair, epoch, offer, source.clone());
                    }
                }
            }
            Err(err) => {
                warn!("capture acquisition failed: {}", err);
                self.source = SourceState::Idle;
                for pair in self.sessions.awaiting_source() {
                    self.fail_negotiation(&pair, Error::transport(&err));
                }
            }
        }
    }

    fn release(&self, source: LocalSource) {
        if let Some(capture) = self.capture.clone() {
            tokio::spawn(async move { capture.release(source).await });
        }
    }

    /// Tear down `pair` locally. Closing an absent pair is a no-op.
    fn close_session(&mut self, pair: &PairKey, reason: CloseReason) -> bool {
        let Some(mut session) = self.sessions.remove(pair) else {
            self.release_source_if_idle();
            return false;
        };
        let dropped = session.close();
        info!(
            "closed {} ({}), {} buffered candidates dropped",
            pair, reason, dropped
        );

        let transport = self.transport.clone();
        let teardown_pair = pair.clone();
        tokio::spawn(async move { transport.teardown(&teardown_pair).await });

        self.emit(CoordinatorEvent::SessionClosed {
            pair: pair.clone(),
            reason,
        });

        self.release_source_if_idle();
        true
    }

    /// A device with no sessions left gives its capture source back. An
    /// acquisition still in flight is abandoned and released on arrival.
    fn release_source_if_idle(&mut self) {
        if self.is_viewer() || !self.sessions.is_empty() {
            return;
        }
        match std::mem::replace(&mut self.source, SourceState::Idle) {
            SourceState::Ready(source) => {
                info!("no sessions left, releasing capture source {}", source.id);
                self.release(source);
            }
            SourceState::Acquiring => debug!("capture acquisition no longer needed"),
            SourceState::Idle => {}
        }
    }

    fn on_tick(&mut self, now: Instant) {
        for pair in self
            .sessions
            .stalled(now, self.config.negotiation_timeout)
        {
            warn!("negotiation for {} timed out", pair);
            if self.is_viewer() {
                self.send_signal(SignalMessage::StopStream(StreamTarget {
                    device_id: pair.device_id.clone(),
                }));
            }
            self.close_session(&pair, CloseReason::NegotiationTimeout);
        }
    }

    async fn shutdown(&mut self) {
        for pair in self.sessions.pairs() {
            if let Some(mut session) = self.sessions.remove(&pair) {
                session.close();
                self.transport.teardown(&pair).await;
                self.emit(CoordinatorEvent::SessionClosed {
                    pair,
                    reason: CloseReason::ParticipantLeft,
                });
            }
        }
        if let SourceState::Ready(source) = std::mem::replace(&mut self.source, SourceState::Idle) {
            if let Some(capture) = &self.capture {
                capture.release(source).await;
            }
        }
        self.send_signal(SignalMessage::Unregister(Empty {}));
        info!("coordinator for {} stopped", self.config.local_id);
    }
}

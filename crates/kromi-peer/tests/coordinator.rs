//! Coordinator behavior against scripted transport and capture layers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kromi_common::{
    AnswerPayload, CandidatePayload, CloseReason, DeviceInfo, DeviceStatus, Error, IceCandidate,
    OfferPayload, PairKey, Result, SessionClosed, SessionDescription, SessionState, SignalMessage,
    StreamCommand, StreamCommandPayload, TransportState,
};
use kromi_peer::{
    CaptureLayer, Coordinator, CoordinatorConfig, CoordinatorEvent, CoordinatorHandle,
    LocalSource, MediaTransport, TransportEvent,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    CreateOffer(PairKey),
    AcceptOffer(PairKey, String),
    ApplyAnswer(PairKey),
    Candidate(PairKey, IceCandidate),
    Teardown(PairKey),
}

type Gate = Mutex<Option<oneshot::Receiver<()>>>;

#[derive(Default)]
struct MockTransport {
    calls: Mutex<Vec<Call>>,
    offer_gate: Gate,
    accept_gate: Gate,
    fail_answers: bool,
}

impl MockTransport {
    fn failing_answers() -> Self {
        Self {
            fail_answers: true,
            ..Self::default()
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Candidate(_, candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }

    fn hold_next_offer(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.offer_gate.lock().unwrap() = Some(rx);
        tx
    }

    fn hold_next_accept(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.accept_gate.lock().unwrap() = Some(rx);
        tx
    }
}

async fn pass(gate: &Gate) {
    let held = gate.lock().unwrap().take();
    if let Some(rx) = held {
        let _ = rx.await;
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn create_offer(&self, pair: &PairKey) -> Result<SessionDescription> {
        pass(&self.offer_gate).await;
        self.record(Call::CreateOffer(pair.clone()));
        Ok(SessionDescription(json!({"type": "offer", "sdp": format!("offer {pair}")})))
    }

    async fn accept_offer(
        &self,
        pair: &PairKey,
        _offer: SessionDescription,
        source: LocalSource,
    ) -> Result<SessionDescription> {
        pass(&self.accept_gate).await;
        self.record(Call::AcceptOffer(pair.clone(), source.id));
        Ok(SessionDescription(json!({"type": "answer", "sdp": format!("answer {pair}")})))
    }

    async fn apply_answer(&self, pair: &PairKey, _answer: SessionDescription) -> Result<()> {
        self.record(Call::ApplyAnswer(pair.clone()));
        if self.fail_answers {
            return Err(Error::transport("remote description rejected"));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, pair: &PairKey, candidate: IceCandidate) -> Result<()> {
        self.record(Call::Candidate(pair.clone(), candidate));
        Ok(())
    }

    async fn teardown(&self, pair: &PairKey) {
        self.record(Call::Teardown(pair.clone()));
    }
}

#[derive(Default)]
struct MockCapture {
    acquired: AtomicUsize,
    released: Mutex<Vec<String>>,
}

#[async_trait]
impl CaptureLayer for MockCapture {
    async fn acquire(&self) -> Result<LocalSource> {
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LocalSource {
            id: format!("camera-{n}"),
            label: "rear camera".into(),
        })
    }

    async fn release(&self, source: LocalSource) {
        self.released.lock().unwrap().push(source.id);
    }
}

struct Harness {
    handle: CoordinatorHandle,
    outbox: mpsc::Receiver<SignalMessage>,
    events: mpsc::Receiver<CoordinatorEvent>,
    transport: Arc<MockTransport>,
    capture: Arc<MockCapture>,
}

fn start(config: CoordinatorConfig, transport: MockTransport) -> Harness {
    let transport = Arc::new(transport);
    let capture = Arc::new(MockCapture::default());
    let (out_tx, outbox) = mpsc::channel(256);
    let (event_tx, events) = mpsc::channel(256);
    let (handle, _task) = Coordinator::new(
        config.with_tick_interval(Duration::from_secs(3600)),
        transport.clone(),
        out_tx,
        event_tx,
    )
    .with_capture(capture.clone())
    .spawn();
    Harness {
        handle,
        outbox,
        events,
        transport,
        capture,
    }
}

fn viewer(id: &str) -> Harness {
    start(CoordinatorConfig::viewer(id), MockTransport::default())
}

fn device(id: &str) -> Harness {
    start(CoordinatorConfig::device(id), MockTransport::default())
}

impl Harness {
    async fn next_out(&mut self) -> SignalMessage {
        timeout(Duration::from_secs(2), self.outbox.recv())
            .await
            .expect("timed out waiting for outbound signal")
            .expect("outbox closed")
    }

    async fn assert_quiet(&mut self) {
        assert!(
            timeout(Duration::from_millis(100), self.outbox.recv()).await.is_err(),
            "unexpected outbound signal"
        );
    }

    async fn wait_event(&mut self, pred: impl Fn(&CoordinatorEvent) -> bool) -> CoordinatorEvent {
        loop {
            let event = timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("events closed");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_closed(&mut self, pair: &PairKey) -> CloseReason {
        match self
            .wait_event(|e| matches!(e, CoordinatorEvent::SessionClosed { pair: p, .. } if p == pair))
            .await
        {
            CoordinatorEvent::SessionClosed { reason, .. } => reason,
            _ => unreachable!(),
        }
    }

    async fn wait_state(&mut self, pair: &PairKey, state: SessionState) {
        self.wait_event(
            |e| matches!(e, CoordinatorEvent::SessionState { pair: p, state: s } if p == pair && *s == state),
        )
        .await;
    }

    async fn signal(&self, msg: SignalMessage) {
        self.handle.signal(msg).await.expect("coordinator running");
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate(json!({"candidate": format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host")}))
}

fn candidate_msg(from: &str, to: &str, n: u32) -> SignalMessage {
    SignalMessage::IceCandidate(CandidatePayload {
        from: from.into(),
        to: to.into(),
        candidate: candidate(n),
    })
}

fn offer_msg(from: &str, to: &str) -> SignalMessage {
    SignalMessage::Offer(OfferPayload {
        from: from.into(),
        to: to.into(),
        offer: SessionDescription(json!({"type": "offer", "sdp": "v=0"})),
    })
}

fn answer_msg(from: &str, to: &str) -> SignalMessage {
    SignalMessage::Answer(AnswerPayload {
        from: from.into(),
        to: to.into(),
        answer: SessionDescription(json!({"type": "answer", "sdp": "v=0"})),
    })
}

fn start_command(viewer_id: &str) -> SignalMessage {
    SignalMessage::StreamCommand(StreamCommandPayload {
        command: StreamCommand::Start,
        viewer_id: viewer_id.into(),
    })
}

fn stop_command(viewer_id: &str) -> SignalMessage {
    SignalMessage::StreamCommand(StreamCommandPayload {
        command: StreamCommand::Stop,
        viewer_id: viewer_id.into(),
    })
}

#[tokio::test]
async fn test_viewer_start_sends_command_then_offer() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");

    v1.handle.start_stream("D1").await.unwrap();

    assert!(matches!(v1.next_out().await, SignalMessage::StartStream(t) if t.device_id == "D1"));
    match v1.next_out().await {
        SignalMessage::Offer(offer) => {
            assert_eq!(offer.from, "V1");
            assert_eq!(offer.to, "D1");
        }
        other => panic!("expected offer, got {}", other.kind()),
    }
    v1.wait_state(&pair, SessionState::OfferSent).await;
}

#[tokio::test]
async fn test_duplicate_start_keeps_single_session() {
    let mut v1 = viewer("V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.handle.start_stream("D1").await.unwrap();

    assert!(matches!(v1.next_out().await, SignalMessage::StartStream(_)));
    assert!(matches!(v1.next_out().await, SignalMessage::Offer(_)));
    v1.assert_quiet().await;
    assert_eq!(v1.transport.count(|c| matches!(c, Call::CreateOffer(_))), 1);
}

#[tokio::test]
async fn test_device_flushes_candidates_buffered_before_offer_applied() {
    let mut d1 = device("D1");
    let pair = PairKey::new("D1", "V1");
    let release_accept = d1.transport.hold_next_accept();

    d1.signal(start_command("V1")).await;
    d1.signal(offer_msg("V1", "D1")).await;
    for n in 0..3 {
        d1.signal(candidate_msg("V1", "D1", n)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(d1.transport.candidates().is_empty());

    release_accept.send(()).unwrap();

    match d1.next_out().await {
        SignalMessage::Answer(answer) => {
            assert_eq!(answer.from, "D1");
            assert_eq!(answer.to, "V1");
        }
        other => panic!("expected answer, got {}", other.kind()),
    }
    d1.wait_state(&pair, SessionState::AnswerSent).await;

    let transport = d1.transport.clone();
    eventually("three candidates applied", || transport.candidates().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        d1.transport.candidates(),
        vec![candidate(0), candidate(1), candidate(2)]
    );
}

#[tokio::test]
async fn test_candidate_for_unknown_pair_is_dropped() {
    let mut d1 = device("D1");

    d1.signal(candidate_msg("V9", "D1", 0)).await;
    d1.assert_quiet().await;
    assert!(d1.transport.calls().is_empty());
}

#[tokio::test]
async fn test_device_rejects_second_offer_for_live_pair() {
    let mut d1 = device("D1");

    d1.signal(offer_msg("V1", "D1")).await;
    assert!(matches!(d1.next_out().await, SignalMessage::Answer(_)));

    d1.signal(offer_msg("V1", "D1")).await;
    d1.assert_quiet().await;
    assert_eq!(d1.transport.count(|c| matches!(c, Call::AcceptOffer(..))), 1);
}

#[tokio::test]
async fn test_device_shares_one_capture_source_across_viewers() {
    let mut d1 = device("D1");
    let v1_pair = PairKey::new("D1", "V1");
    let v2_pair = PairKey::new("D1", "V2");

    d1.signal(start_command("V1")).await;
    d1.signal(offer_msg("V1", "D1")).await;
    assert!(matches!(d1.next_out().await, SignalMessage::Answer(a) if a.to == "V1"));
    d1.signal(start_command("V2")).await;
    d1.signal(offer_msg("V2", "D1")).await;
    assert!(matches!(d1.next_out().await, SignalMessage::Answer(a) if a.to == "V2"));

    assert_eq!(d1.capture.acquired.load(Ordering::SeqCst), 1);
    let calls = d1.transport.calls();
    assert!(calls.contains(&Call::AcceptOffer(v1_pair.clone(), "camera-1".into())));
    assert!(calls.contains(&Call::AcceptOffer(v2_pair.clone(), "camera-1".into())));

    d1.signal(stop_command("V1")).await;
    assert_eq!(d1.wait_closed(&v1_pair).await, CloseReason::StopRequested);
    assert!(d1.capture.released.lock().unwrap().is_empty());

    d1.signal(stop_command("V2")).await;
    assert_eq!(d1.wait_closed(&v2_pair).await, CloseReason::StopRequested);
    let capture = d1.capture.clone();
    eventually("capture released", || capture.released.lock().unwrap().len() == 1).await;
    assert_eq!(*d1.capture.released.lock().unwrap(), vec!["camera-1".to_string()]);
}

#[tokio::test]
async fn test_stop_before_any_offer_releases_capture() {
    let d1 = device("D1");

    d1.signal(start_command("V1")).await;
    let capture = d1.capture.clone();
    eventually("capture acquired", || capture.acquired.load(Ordering::SeqCst) == 1).await;

    d1.signal(stop_command("V1")).await;
    eventually("capture released", || capture.released.lock().unwrap().len() == 1).await;
    assert_eq!(*d1.capture.released.lock().unwrap(), vec!["camera-1".to_string()]);
    assert!(d1.transport.calls().is_empty());
}

#[tokio::test]
async fn test_relay_close_of_unopened_pair_releases_capture() {
    let d1 = device("D1");

    d1.signal(start_command("V1")).await;
    let capture = d1.capture.clone();
    eventually("capture acquired", || capture.acquired.load(Ordering::SeqCst) == 1).await;

    d1.signal(SignalMessage::SessionClosed(SessionClosed {
        device_id: "D1".into(),
        viewer_id: "V1".into(),
        reason: CloseReason::NegotiationTimeout,
    }))
    .await;
    eventually("capture released", || capture.released.lock().unwrap().len() == 1).await;

    // A later viewer gets a freshly acquired source.
    d1.signal(offer_msg("V2", "D1")).await;
    let transport = d1.transport.clone();
    eventually("offer accepted", || {
        transport.count(|c| matches!(c, Call::AcceptOffer(..))) == 1
    })
    .await;
    assert!(d1
        .transport
        .calls()
        .contains(&Call::AcceptOffer(PairKey::new("D1", "V2"), "camera-2".into())));
}

#[tokio::test]
async fn test_stop_then_start_opens_fresh_session() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;
    v1.next_out().await;

    v1.handle.stop_stream("D1").await.unwrap();
    assert!(matches!(v1.next_out().await, SignalMessage::StopStream(t) if t.device_id == "D1"));
    assert_eq!(v1.wait_closed(&pair).await, CloseReason::StopRequested);

    // The relay echoes the close; it must not disturb anything.
    v1.signal(SignalMessage::SessionClosed(SessionClosed {
        device_id: "D1".into(),
        viewer_id: "V1".into(),
        reason: CloseReason::StopRequested,
    }))
    .await;

    v1.handle.start_stream("D1").await.unwrap();
    assert!(matches!(v1.next_out().await, SignalMessage::StartStream(_)));
    v1.wait_state(&pair, SessionState::New).await;
    assert!(matches!(v1.next_out().await, SignalMessage::Offer(_)));

    let transport = v1.transport.clone();
    eventually("single teardown", || {
        transport.count(|c| matches!(c, Call::Teardown(_))) == 1
    })
    .await;
}

#[tokio::test]
async fn test_offer_completing_after_stop_is_discarded() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");
    let release_offer = v1.transport.hold_next_offer();

    v1.handle.start_stream("D1").await.unwrap();
    assert!(matches!(v1.next_out().await, SignalMessage::StartStream(_)));
    v1.handle.stop_stream("D1").await.unwrap();
    assert!(matches!(v1.next_out().await, SignalMessage::StopStream(_)));
    assert_eq!(v1.wait_closed(&pair).await, CloseReason::StopRequested);

    release_offer.send(()).unwrap();
    v1.assert_quiet().await;
}

#[tokio::test]
async fn test_viewer_applies_candidates_after_answer() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;
    v1.next_out().await;

    v1.signal(candidate_msg("D1", "V1", 7)).await;
    v1.signal(answer_msg("D1", "V1")).await;
    v1.wait_state(&pair, SessionState::AnswerSent).await;
    v1.signal(candidate_msg("D1", "V1", 8)).await;

    let transport = v1.transport.clone();
    eventually("both candidates applied", || transport.candidates().len() == 2).await;
    assert_eq!(v1.transport.candidates(), vec![candidate(7), candidate(8)]);
}

#[tokio::test]
async fn test_local_candidates_are_forwarded_immediately() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;

    assert!(v1.handle.post_transport_event(TransportEvent::LocalCandidate {
        pair: pair.clone(),
        candidate: candidate(1),
    }));

    let mut saw_candidate = false;
    for _ in 0..2 {
        if let SignalMessage::IceCandidate(c) = v1.next_out().await {
            assert_eq!(c.from, "V1");
            assert_eq!(c.to, "D1");
            saw_candidate = true;
        }
    }
    assert!(saw_candidate);
}

#[tokio::test]
async fn test_transport_failure_reports_and_closes() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;
    v1.next_out().await;
    v1.signal(answer_msg("D1", "V1")).await;
    v1.wait_state(&pair, SessionState::AnswerSent).await;

    v1.handle.post_transport_event(TransportEvent::StateChanged {
        pair: pair.clone(),
        state: TransportState::Failed,
    });

    match v1.next_out().await {
        SignalMessage::SessionState(report) => {
            assert_eq!(report.to, "D1");
            assert_eq!(report.state, TransportState::Failed);
        }
        other => panic!("expected session-state, got {}", other.kind()),
    }
    v1.wait_state(&pair, SessionState::Failed).await;
    assert_eq!(v1.wait_closed(&pair).await, CloseReason::TransportFailed);
}

#[tokio::test]
async fn test_rejected_answer_closes_with_negotiation_error() {
    let mut v1 = start(CoordinatorConfig::viewer("V1"), MockTransport::failing_answers());
    let pair = PairKey::new("D1", "V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;
    v1.next_out().await;
    v1.signal(answer_msg("D1", "V1")).await;

    assert_eq!(v1.wait_closed(&pair).await, CloseReason::NegotiationError);
}

#[tokio::test]
async fn test_connected_session_survives_tick() {
    let mut v1 = start(
        CoordinatorConfig::viewer("V1").with_negotiation_timeout(Duration::from_millis(20)),
        MockTransport::default(),
    );
    let connected = PairKey::new("D1", "V1");
    let stalled = PairKey::new("D2", "V1");

    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;
    v1.next_out().await;
    v1.signal(answer_msg("D1", "V1")).await;
    v1.wait_state(&connected, SessionState::AnswerSent).await;
    v1.handle.post_transport_event(TransportEvent::StateChanged {
        pair: connected.clone(),
        state: TransportState::Connected,
    });
    v1.wait_state(&connected, SessionState::Connected).await;
    assert!(matches!(v1.next_out().await, SignalMessage::SessionState(r) if r.state == TransportState::Connected));

    v1.handle.start_stream("D2").await.unwrap();
    v1.next_out().await;
    v1.next_out().await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    v1.handle.tick().await.unwrap();

    assert!(matches!(v1.next_out().await, SignalMessage::StopStream(t) if t.device_id == "D2"));
    assert_eq!(v1.wait_closed(&stalled).await, CloseReason::NegotiationTimeout);
    v1.assert_quiet().await;
}

#[tokio::test]
async fn test_device_offline_closes_viewer_sessions() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("D1", "V1");
    let d1 = DeviceInfo {
        device_id: "D1".into(),
        device_name: "Finish line".into(),
        status: DeviceStatus::Online,
        streaming: false,
    };

    v1.signal(SignalMessage::DevicesList(vec![d1.clone()])).await;
    v1.handle.start_stream("D1").await.unwrap();
    v1.next_out().await;

    v1.signal(SignalMessage::DeviceOffline(DeviceInfo {
        status: DeviceStatus::Offline,
        ..d1
    }))
    .await;

    assert_eq!(v1.wait_closed(&pair).await, CloseReason::ParticipantLeft);
    v1.wait_event(|e| matches!(e, CoordinatorEvent::DeviceOffline(d) if d.device_id == "D1"))
        .await;
}

#[tokio::test]
async fn test_unavailable_device_closes_pending_session() {
    let mut v1 = viewer("V1");
    let pair = PairKey::new("ghost", "V1");

    v1.handle.start_stream("ghost").await.unwrap();
    v1.next_out().await;
    v1.signal(SignalMessage::DeviceUnavailable(kromi_common::StreamTarget {
        device_id: "ghost".into(),
    }))
    .await;

    assert_eq!(v1.wait_closed(&pair).await, CloseReason::DeviceUnavailable);
    v1.wait_event(|e| matches!(e, CoordinatorEvent::StreamUnavailable { device_id } if device_id == "ghost"))
        .await;
}

#[tokio::test]
async fn test_shutdown_tears_down_and_unregisters() {
    let mut d1 = device("D1");
    let pair = PairKey::new("D1", "V1");

    d1.signal(offer_msg("V1", "D1")).await;
    assert!(matches!(d1.next_out().await, SignalMessage::Answer(_)));

    d1.handle.shutdown().await.unwrap();
    assert!(matches!(d1.next_out().await, SignalMessage::Unregister(_)));
    assert!(d1.transport.calls().contains(&Call::Teardown(pair)));
    assert_eq!(*d1.capture.released.lock().unwrap(), vec!["camera-1".to_string()]);
}

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use kromi_common::{is_valid_participant_id, Error, SignalMessage};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SignalLimits;
use crate::dispatch::StartOutcome;
use crate::hub::{Participant, SignalHub};
use crate::security;

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;

static ACTIVE_WS_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static IP_CONNECTIONS: Lazy<Mutex<HashMap<IpAddr, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub type ConnectionId = Uuid;

/// Outbound half of one signaling connection.
#[derive(Clone, Debug)]
pub struct Signaler {
    tx: mpsc::Sender<SignalMessage>,
}

impl Signaler {
    pub fn new(tx: mpsc::Sender<SignalMessage>) -> Self {
        Self { tx }
    }

    /// Queue without waiting. False when the outbox is full or closed.
    pub fn try_send(&self, signal: SignalMessage) -> bool {
        self.tx.try_send(signal).is_ok()
    }
}

pub fn active_connections() -> usize {
    ACTIVE_WS_CONNECTIONS.load(Ordering::Relaxed)
}

fn acquire_ip_slot(ip: IpAddr, max_per_ip: usize) -> bool {
    let mut counts = IP_CONNECTIONS.lock().unwrap_or_else(|e| e.into_inner());
    let count = counts.get(&ip).copied().unwrap_or(0);
    if count >= max_per_ip {
        return false;
    }
    counts.insert(ip, count + 1);
    true
}

fn release_ip_slot(ip: IpAddr) {
    let mut counts = IP_CONNECTIONS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(count) = counts.get_mut(&ip) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&ip);
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<SignalHub>,
    State(limits): State<SignalLimits>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !security::ws_origin_allowed(origin) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let ip = addr.ip();
    if !acquire_ip_slot(ip, limits.max_per_ip) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    if active_connections() >= limits.max_connections {
        release_ip_slot(ip);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, hub, limits, addr))
        .into_response()
}

enum Flow {
    Continue,
    Close,
}

fn reply(signaler: &Signaler, signal: SignalMessage) {
    let kind = signal.kind();
    if !signaler.try_send(signal) {
        warn!("failed to queue {} reply", kind);
    }
}

async fn handle_socket(stream: WebSocket, hub: SignalHub, limits: SignalLimits, addr: SocketAddr) {
    ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = stream.split();
    serve_connection(sender, receiver, hub, limits, addr).await;
    ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    release_ip_slot(addr.ip());
}

/// Run one signaling connection until either side goes away, then unregister
/// the identity it holds.
async fn serve_connection<Tx, Rx, E>(
    mut sender: Tx,
    mut receiver: Rx,
    hub: SignalHub,
    limits: SignalLimits,
    addr: SocketAddr,
) where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Rx: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
    E: std::fmt::Display + Send,
{
    let connection: ConnectionId = Uuid::new_v4();
    info!("signaling connection {} from {}", connection, addr);

    let (tx, mut rx) = mpsc::channel::<SignalMessage>(WS_OUTBOX_CAPACITY);
    let signaler = Signaler::new(tx);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let text = match serde_json::to_string(&signal) {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode {}: {}", signal.kind(), err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut participant: Option<Participant> = None;
    let mut message_window_start = Instant::now();
    let mut message_count: u32 = 0;

    let register_deadline = tokio::time::sleep(limits.register_timeout);
    tokio::pin!(register_deadline);

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            _ = &mut register_deadline, if participant.is_none() => {
                reply(&signaler, SignalMessage::error("Registration timeout"));
                break;
            }
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        debug!("read error on {}: {}", connection, err);
                        break;
                    }
                    None => break,
                };

                let now = Instant::now();
                if now.duration_since(message_window_start) >= Duration::from_secs(60) {
                    message_window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > limits.max_messages_per_minute {
                    reply(&signaler, SignalMessage::error("Rate limit exceeded"));
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        reply(&signaler, SignalMessage::error("Binary messages are not supported"));
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    reply(&signaler, SignalMessage::error("Message too large"));
                    break;
                }

                let signal: SignalMessage = match serde_json::from_str(&text) {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!("invalid JSON from {}: {}", addr, err);
                        reply(&signaler, SignalMessage::error("Invalid JSON"));
                        break;
                    }
                };

                debug!("{} from {}", signal.kind(), connection);
                let flow = handle_signal(&hub, &signaler, connection, addr, &mut participant, signal).await;
                if let Flow::Close = flow {
                    break;
                }
            }
        }
    }

    if let Some(participant) = participant {
        info!("{} {} disconnected", participant.role, participant.id);
        hub.disconnect(&participant).await;
    }
}

async fn handle_signal(
    hub: &SignalHub,
    signaler: &Signaler,
    connection: ConnectionId,
    addr: SocketAddr,
    participant: &mut Option<Participant>,
    signal: SignalMessage,
) -> Flow {
    match signal {
        SignalMessage::RegisterDevice(registration) => {
            if !security::allow_register_request(&format!("register:{}", addr.ip())) {
                reply(signaler, SignalMessage::error("Register rate limit exceeded"));
                return Flow::Close;
            }
            match hub
                .register_device(registration, connection, signaler.clone())
                .await
            {
                Ok(registered) => adopt(hub, participant, registered).await,
                Err(err) => reply(signaler, SignalMessage::error(err.to_string())),
            }
            Flow::Continue
        }
        SignalMessage::RegisterViewer(registration) => {
            if !security::allow_register_request(&format!("register:{}", addr.ip())) {
                reply(signaler, SignalMessage::error("Register rate limit exceeded"));
                return Flow::Close;
            }
            match hub
                .register_viewer(registration, connection, signaler.clone())
                .await
            {
                Ok(registered) => adopt(hub, participant, registered).await,
                Err(err) => reply(signaler, SignalMessage::error(err.to_string())),
            }
            Flow::Continue
        }
        SignalMessage::Unregister(_) => {
            if let Some(previous) = participant.take() {
                hub.disconnect(&previous).await;
            }
            Flow::Continue
        }
        other => {
            let Some(sender) = participant.as_ref() else {
                reply(signaler, SignalMessage::error("Register before signaling"));
                return Flow::Close;
            };
            handle_registered(hub, signaler, sender, other).await;
            Flow::Continue
        }
    }
}

/// Make `registered` the connection's identity. A previous identity under a
/// different id is unregistered; a failed registration never gets here, so
/// the old identity stays owned by the connection.
async fn adopt(hub: &SignalHub, participant: &mut Option<Participant>, registered: Participant) {
    let previous = participant.replace(registered);
    if let (Some(previous), Some(current)) = (previous, participant.as_ref()) {
        if previous.id != current.id {
            hub.disconnect(&previous).await;
        }
    }
}

async fn handle_registered(
    hub: &SignalHub,
    signaler: &Signaler,
    sender: &Participant,
    signal: SignalMessage,
) {
    let result = match signal {
        SignalMessage::StartStream(target) => {
            match hub.start_stream(sender, &target.device_id).await {
                Ok(StartOutcome::Forwarded) => {
                    reply(signaler, SignalMessage::StreamAccepted(target));
                    Ok(())
                }
                Ok(StartOutcome::AlreadyActive) => Ok(()),
                Err(Error::DeviceUnavailable(_)) => {
                    reply(signaler, SignalMessage::DeviceUnavailable(target));
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        SignalMessage::StopStream(target) => hub.stop_stream(sender, &target.device_id).await.map(|_| ()),
        SignalMessage::Offer(payload) => {
            if !is_valid_participant_id(&payload.to) || !security::is_valid_description(&payload.offer) {
                Err(Error::protocol("Invalid offer payload"))
            } else {
                hub.relay_offer(sender, payload).await.map(|_| ())
            }
        }
        SignalMessage::Answer(payload) => {
            if !is_valid_participant_id(&payload.to) || !security::is_valid_description(&payload.answer) {
                Err(Error::protocol("Invalid answer payload"))
            } else {
                hub.relay_answer(sender, payload).await.map(|_| ())
            }
        }
        SignalMessage::IceCandidate(payload) => {
            if !is_valid_participant_id(&payload.to) || !security::is_valid_candidate(&payload.candidate) {
                Err(Error::protocol("Invalid ice-candidate payload"))
            } else {
                hub.relay_candidate(sender, payload).await.map(|_| ())
            }
        }
        SignalMessage::SessionState(report) => hub.report_state(sender, report).await,
        SignalMessage::RegisterDevice(_)
        | SignalMessage::RegisterViewer(_)
        | SignalMessage::Unregister(_) => Ok(()),
        SignalMessage::Registered(_)
        | SignalMessage::DevicesList(_)
        | SignalMessage::DeviceOnline(_)
        | SignalMessage::DeviceOffline(_)
        | SignalMessage::StreamAccepted(_)
        | SignalMessage::DeviceUnavailable(_)
        | SignalMessage::StreamCommand(_)
        | SignalMessage::SessionClosed(_)
        | SignalMessage::Error(_) => Err(Error::protocol("Unsupported client message type")),
    };

    if let Err(err) = result {
        debug!("rejecting message from {}: {}", sender.id, err);
        reply(signaler, SignalMessage::error(err.to_string()));
    }
}

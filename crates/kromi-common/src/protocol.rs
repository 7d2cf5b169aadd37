use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::PairKey;

/// Opaque session description (offer or answer). Never inspected by the
/// signaling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub serde_json::Value);

/// Opaque connectivity candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

impl SessionDescription {
    /// Serialized size, used for payload limits.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_string(&self.0).map(|s| s.len()).unwrap_or(usize::MAX)
    }
}

impl IceCandidate {
    pub fn encoded_len(&self) -> usize {
        serde_json::to_string(&self.0).map(|s| s.len()).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Device,
    Viewer,
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::Device => f.write_str("device"),
            ParticipantRole::Viewer => f.write_str("viewer"),
        }
    }
}

/// Negotiation state of one device/viewer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    OfferSent,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            (New, OfferSent) | (New, AnswerSent) | (OfferSent, AnswerSent) => true,
            (AnswerSent, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::OfferSent => "offer_sent",
            SessionState::AnswerSent => "answer_sent",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection state as reported by the external media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    StopRequested,
    ParticipantLeft,
    TransportFailed,
    NegotiationTimeout,
    NegotiationError,
    DeviceUnavailable,
    Replaced,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::StopRequested => "stop-requested",
            CloseReason::ParticipantLeft => "participant-left",
            CloseReason::TransportFailed => "transport-failed",
            CloseReason::NegotiationTimeout => "negotiation-timeout",
            CloseReason::NegotiationError => "negotiation-error",
            CloseReason::DeviceUnavailable => "device-unavailable",
            CloseReason::Replaced => "replaced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCommand {
    Start,
    Stop,
}

/// Presence entry as seen by viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub status: DeviceStatus,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub device_id: String,
    pub event_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRegistration {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub participant_id: String,
    pub role: ParticipantRole,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTarget {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCommandPayload {
    pub command: StreamCommand,
    pub viewer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub from: String,
    pub to: String,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub from: String,
    pub to: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub from: String,
    pub to: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateReport {
    pub from: String,
    pub to: String,
    pub state: TransportState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosed {
    pub device_id: String,
    pub viewer_id: String,
    pub reason: CloseReason,
}

impl SessionClosed {
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.device_id.clone(), self.viewer_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Every frame carried by the Signaling Channel.
///
/// Encoded as `{"type": "<kebab-case>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalMessage {
    RegisterDevice(DeviceRegistration),
    RegisterViewer(ViewerRegistration),
    Registered(Registered),
    Unregister(Empty),

    DevicesList(Vec<DeviceInfo>),
    DeviceOnline(DeviceInfo),
    DeviceOffline(DeviceInfo),

    StartStream(StreamTarget),
    StopStream(StreamTarget),
    StreamAccepted(StreamTarget),
    DeviceUnavailable(StreamTarget),
    StreamCommand(StreamCommandPayload),

    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(CandidatePayload),

    SessionState(SessionStateReport),
    SessionClosed(SessionClosed),

    Error(ErrorPayload),
}

impl SignalMessage {
    pub fn error(message: impl Into<String>) -> Self {
        SignalMessage::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::RegisterDevice(_) => "register-device",
            SignalMessage::RegisterViewer(_) => "register-viewer",
            SignalMessage::Registered(_) => "registered",
            SignalMessage::Unregister(_) => "unregister",
            SignalMessage::DevicesList(_) => "devices-list",
            SignalMessage::DeviceOnline(_) => "device-online",
            SignalMessage::DeviceOffline(_) => "device-offline",
            SignalMessage::StartStream(_) => "start-stream",
            SignalMessage::StopStream(_) => "stop-stream",
            SignalMessage::StreamAccepted(_) => "stream-accepted",
            SignalMessage::DeviceUnavailable(_) => "device-unavailable",
            SignalMessage::StreamCommand(_) => "stream-command",
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::IceCandidate(_) => "ice-candidate",
            SignalMessage::SessionState(_) => "session-state",
            SignalMessage::SessionClosed(_) => "session-closed",
            SignalMessage::Error(_) => "error",
        }
    }
}

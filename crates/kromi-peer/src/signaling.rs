use futures::{SinkExt, StreamExt};
use kromi_common::{
    DeviceRegistration, Error, Result, SignalMessage, ViewerRegistration,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::coordinator::CoordinatorHandle;

/// Check a signaling URL before dialing it.
pub fn validate_signaling_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw).map_err(|e| Error::config(format!("invalid signaling url: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(Error::config(format!(
            "signaling url must use ws:// or wss://, got {other}://"
        ))),
    }
}

pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let url = validate_signaling_url(url)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(Error::transport)?;
        Ok(Self { ws })
    }

    pub async fn register_device(&mut self, registration: DeviceRegistration) -> Result<()> {
        self.send(&SignalMessage::RegisterDevice(registration)).await
    }

    pub async fn register_viewer(&mut self, registration: ViewerRegistration) -> Result<()> {
        self.send(&SignalMessage::RegisterViewer(registration)).await
    }

    pub async fn send(&mut self, msg: &SignalMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(Error::transport)
    }

    pub async fn recv(&mut self) -> Result<SignalMessage> {
        while let Some(msg) = self.ws.next().await {
            let msg = msg.map_err(Error::transport)?;
            if let Message::Text(text) = msg {
                return Ok(serde_json::from_str(&text)?);
            }
        }
        Err(Error::transport("signaling connection closed"))
    }

    /// Split into an outbox and an inbound stream, each driven by a
    /// background task. Both end when the socket closes.
    pub fn into_channels(
        self,
        capacity: usize,
    ) -> (mpsc::Sender<SignalMessage>, mpsc::Receiver<SignalMessage>) {
        let (mut sink, mut stream) = self.ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SignalMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<SignalMessage>(capacity);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode {}: {}", msg.kind(), err);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("ignoring malformed signaling frame: {}", err),
                }
            }
            debug!("signaling read loop ended");
        });

        (out_tx, in_rx)
    }
}

/// Feed every inbound signaling message into a coordinator. Ends when either
/// side goes away.
pub fn forward_to_coordinator(
    mut inbound: mpsc::Receiver<SignalMessage>,
    coordinator: CoordinatorHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if coordinator.signal(msg).await.is_err() {
                break;
            }
        }
        let _ = coordinator.shutdown().await;
    })
}

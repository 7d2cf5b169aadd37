//! Connectivity-establishment configuration handed to the media transport.
//!
//! None of these values are interpreted by the signaling layer; the relay
//! serves them to clients and the peer side passes them to its transport.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    /// Ordered; reflection endpoints first, relay fallback last.
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub bundle_policy: String,
    pub rtcp_mux_policy: String,
}

impl RtcConfig {
    /// Replace every relay entry with `server`, keeping reflection endpoints.
    pub fn with_relay(mut self, server: IceServer) -> Self {
        self.ice_servers.retain(|s| !s.is_relay());
        self.ice_servers.push(server);
        self
    }

    pub fn has_relay_fallback(&self) -> bool {
        self.ice_servers
            .iter()
            .any(|s| s.is_relay() && s.username.is_some() && s.credential.is_some())
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun.stunprotocol.org:3478"),
                IceServer::turn(
                    "turn:openrelay.metered.ca:80",
                    "openrelayproject",
                    "openrelayproject",
                ),
            ],
            ice_candidate_pool_size: 10,
            bundle_policy: "max-bundle".to_string(),
            rtcp_mux_policy: "require".to_string(),
        }
    }
}

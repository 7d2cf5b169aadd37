//! Participant identifiers and the device/viewer pair key.

use std::fmt;

use serde::{Deserialize, Serialize};

const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Key of a peer session: exactly one device and one viewer.
///
/// The pair is unordered in the sense that both sides address the same
/// session; the roles fix a canonical layout so `(D, V)` and `(V, D)` never
/// produce two keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairKey {
    pub device_id: String,
    pub viewer_id: String,
}

impl PairKey {
    pub fn new(device_id: impl Into<String>, viewer_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            viewer_id: viewer_id.into(),
        }
    }

    /// True when `participant_id` is either side of the pair.
    pub fn involves(&self, participant_id: &str) -> bool {
        self.device_id == participant_id || self.viewer_id == participant_id
    }

    /// The side of the pair that is not `participant_id`.
    pub fn other(&self, participant_id: &str) -> Option<&str> {
        if self.device_id == participant_id {
            Some(&self.viewer_id)
        } else if self.viewer_id == participant_id {
            Some(&self.device_id)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.device_id, self.viewer_id)
    }
}

/// Fresh viewer id for a connection that did not bring its own.
pub fn generate_viewer_id() -> String {
    format!("viewer_{}", uuid::Uuid::new_v4().simple())
}

pub fn is_valid_participant_id(id: &str) -> bool {
    let len = id.len();
    (1..=MAX_PARTICIPANT_ID_LEN).contains(&len)
        && id.chars().all(|c| !c.is_control() && !c.is_whitespace())
}

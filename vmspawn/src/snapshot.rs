//! Inspectable captures of runtime state.
//!
//! A snapshot records every instance and every live pipe, buffered bytes
//! included. Futures of in-flight instances cannot be captured, so a snapshot
//! cannot be resumed; it exists for inspection and determinism checks.

use crate::core::{Endpoint, InstanceId, InstanceState};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance identity.
    pub id: InstanceId,
    /// Spawning instance, absent for the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<InstanceId>,
    /// Spawn depth.
    pub depth: u32,
    /// Lifecycle state.
    #[serde(flatten)]
    pub state: InstanceState,
    /// Fault message of a failed program.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// One end of a pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    /// Endpoint value.
    pub endpoint: Endpoint,
    /// Owning instance.
    pub owner: InstanceId,
    /// Whether the end is still open.
    pub open: bool,
    /// Bytes waiting to be read on this end, base64 encoded.
    pub buffered: String,
}

impl EndpointSnapshot {
    /// Decodes the buffered bytes.
    pub fn buffered_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.buffered)
    }

    pub(crate) fn encode(bytes: impl IntoIterator<Item = u8>) -> String {
        STANDARD.encode(bytes.into_iter().collect::<Vec<u8>>())
    }
}

/// A pipe with at least one open end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// The two ends, in creation order.
    pub ends: [EndpointSnapshot; 2],
}

/// A capture of a whole scheduling session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// The session the snapshot belongs to.
    pub session_id: Uuid,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Steps the scheduler had consumed.
    pub consumed_steps: u64,
    /// Open endpoints across the session.
    pub open_endpoints: usize,
    /// Every instance record, in identity order.
    pub instances: Vec<InstanceSnapshot>,
    /// Live pipes, in creation order.
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Serialize)]
struct FingerprintView<'a> {
    consumed_steps: u64,
    open_endpoints: usize,
    instances: &'a [InstanceSnapshot],
    channels: &'a [ChannelSnapshot],
}

impl RuntimeSnapshot {
    /// Returns a SHA-256 digest of the deterministic content.
    ///
    /// The session id and the capture time are left out, so two runs of the
    /// same workload produce the same fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let view = FingerprintView {
            consumed_steps: self.consumed_steps,
            open_endpoints: self.open_endpoints,
            instances: &self.instances,
            channels: &self.channels,
        };
        let json = serde_json::to_string(&view).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Looks up an instance.
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<&InstanceSnapshot> {
        self.instances.iter().find(|instance| instance.id == id)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

//! Restart snapshots
//!
//! `shutdown` and `backup-state` hand back the whole coordinator state as a
//! versioned JSON document. The state is wrapped in an envelope that carries
//! the schema version and a CRC32 of the state, so a truncated or edited file
//! is rejected at startup instead of being served from.

use crate::common::{crc32, Error, Result};
use crate::coordinator::metadata::{InstanceBindings, InstanceId, Space, SpaceId, Transfer};
use crate::coordinator::state::LifecycleState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const STATE_VERSION: u32 = 1;

/// Next epoch to hand out for one `(addr, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEpoch {
    pub addr: String,
    pub port: u16,
    pub next: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub bindings: InstanceBindings,
    pub pid: u32,
    pub token: String,
    pub last_acked: u64,
    pub last_rejected: u64,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub id: SpaceId,
    pub space: Space,
}

/// Everything needed to bring a coordinator back after a shutdown.
/// Pending configuration queues are not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub saved_at: DateTime<Utc>,
    pub lifecycle: LifecycleState,
    pub port_epochs: Vec<PortEpoch>,
    pub instance_counter: InstanceId,
    pub instances: Vec<InstanceRecord>,
    pub space_counter: SpaceId,
    pub spaces: Vec<SpaceRecord>,
    pub config_counter: u64,
    pub config_data: String,
    pub xfer_counter: u16,
    pub transfers: Vec<Transfer>,
    pub quiesce_state_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    state_version: u32,
    checksum: u32,
    state: serde_json::Value,
}

fn checksum_of(state: &serde_json::Value) -> Result<u32> {
    Ok(crc32(&serde_json::to_vec(state)?))
}

/// Serialize a snapshot as pretty JSON.
pub fn encode(snapshot: &StateSnapshot) -> Result<String> {
    let state = serde_json::to_value(snapshot)?;
    let envelope = Envelope {
        state_version: STATE_VERSION,
        checksum: checksum_of(&state)?,
        state,
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

/// Parse and verify a snapshot produced by [`encode`].
pub fn decode(text: &str) -> Result<StateSnapshot> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
        tracing::error!("Error decoding given state information: {}", e);
        Error::InvalidStateData(format!("undecodable snapshot: {}", e))
    })?;

    if envelope.state_version != STATE_VERSION {
        tracing::error!(
            "Invalid state data used (incompatible version {})",
            envelope.state_version
        );
        return Err(Error::InvalidStateData(format!(
            "unsupported state_version {} (expected {})",
            envelope.state_version, STATE_VERSION
        )));
    }

    let actual = checksum_of(&envelope.state)?;
    if actual != envelope.checksum {
        tracing::error!("Invalid state data used (checksum mismatch)");
        return Err(Error::InvalidStateData(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            envelope.checksum, actual
        )));
    }

    serde_json::from_value(envelope.state)
        .map_err(|e| Error::InvalidStateData(format!("malformed state: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;
    use crate::coordinator::metadata::{Dimension, Region, Subspace};

    fn sample() -> StateSnapshot {
        let mut region = Region::new(0, 0, 0);
        region.replicas = vec![1];
        StateSnapshot {
            saved_at: Utc::now(),
            lifecycle: LifecycleState::Shutdown,
            port_epochs: vec![PortEpoch {
                addr: "10.0.0.1".into(),
                port: 2012,
                next: 3,
            }],
            instance_counter: 2,
            instances: vec![InstanceRecord {
                id: 1,
                bindings: InstanceBindings {
                    addr: "10.0.0.1".into(),
                    inport: 2012,
                    inver: 2,
                    outport: 2013,
                    outver: 1,
                },
                pid: 77,
                token: "f".repeat(32),
                last_acked: 4,
                last_rejected: 0,
                failed: false,
            }],
            space_counter: 2,
            spaces: vec![SpaceRecord {
                id: 1,
                space: Space {
                    name: "kv".into(),
                    dimensions: vec![Dimension::new("k", "string")],
                    subspaces: vec![Subspace {
                        dimensions: vec!["k".into()],
                        nosearch: vec![],
                        regions: vec![region],
                    }],
                },
            }],
            config_counter: 5,
            config_data: "version 5\nshutdown".into(),
            xfer_counter: 0,
            transfers: vec![],
            quiesce_state_id: Some("00ff".into()),
        }
    }

    #[test]
    fn test_encode_decode() {
        let snapshot = sample();
        let text = encode(&snapshot).unwrap();
        assert!(text.contains("\"state_version\": 1"));
        assert_eq!(decode(&text).unwrap(), snapshot);
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let text = encode(&sample()).unwrap();
        let tampered = text.replace("\"pid\": 77", "\"pid\": 78");
        assert_ne!(text, tampered);
        let err = decode(&tampered).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateData);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let text = encode(&sample())
            .unwrap()
            .replace("\"state_version\": 1", "\"state_version\": 2");
        assert_eq!(decode(&text).unwrap_err().kind(), ErrorKind::InvalidStateData);
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(
            decode("not json").unwrap_err().kind(),
            ErrorKind::InvalidStateData
        );
        assert_eq!(decode("{}").unwrap_err().kind(), ErrorKind::InvalidStateData);
    }
}

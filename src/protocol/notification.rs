//! Payloads pushed to the peer on the State and Status characteristics

use serde::{Deserialize, Serialize};

use crate::core::{
    error::TransportResult,
    types::{AppState, ProvisioningState, StateSnapshot, StatusCode},
};

/// Largest value accepted on the Status characteristic
pub const MAX_STATUS_LEN: usize = 512;

/// One-byte State characteristic value
pub fn state_payload(state: AppState) -> Vec<u8> {
    vec![u8::from(state)]
}

/// Status characteristic document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub state: ProvisioningState,
    pub status: StatusCode,
    pub message: String,
    /// Milliseconds since the provisioning session started
    pub timestamp: u64,
}

impl StatusReport {
    pub fn new(snapshot: &StateSnapshot, timestamp: u64) -> Self {
        Self {
            state: snapshot.state,
            status: snapshot.status,
            message: snapshot.message.clone(),
            timestamp,
        }
    }

    /// Serialized report, shortening the message to fit [`MAX_STATUS_LEN`]
    pub fn to_payload(&self) -> TransportResult<Vec<u8>> {
        let mut report = self.clone();
        loop {
            let payload = serde_json::to_vec(&report)?;
            if payload.len() <= MAX_STATUS_LEN || report.message.is_empty() {
                return Ok(payload);
            }

            let excess = payload.len() - MAX_STATUS_LEN;
            let mut cut = report.message.len().saturating_sub(excess);
            while !report.message.is_char_boundary(cut) {
                cut -= 1;
            }
            report.message.truncate(cut);
        }
    }
}

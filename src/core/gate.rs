//! Bonding gate in front of the credential data path

use tracing::{info, warn};

use crate::core::{
    error::ProvisioningError,
    types::{Connection, PeerId},
};

/// Decides which peers may hand over credentials.
///
/// Pairing itself is "just works" bonding: the BlueZ agent registers no
/// passkey callbacks, so no MITM protection is requested.
#[derive(Debug, Clone, Default)]
pub struct SecurityGate;

impl SecurityGate {
    /// Security requests are always granted without user interaction
    pub fn on_security_request(&self, peer: PeerId) -> bool {
        info!(%peer, "Accepting security request");
        true
    }

    /// Record the pairing outcome on the active connection
    pub fn on_pairing_complete(&self, connection: &mut Connection, success: bool, reason: Option<&str>) {
        connection.bonded = success;
        if success {
            info!(peer = %connection.peer, "Pairing complete, peer bonded");
        } else {
            warn!(
                peer = %connection.peer,
                reason = reason.unwrap_or("unknown"),
                "Pairing failed"
            );
        }
    }

    /// Admit credential bytes only from a bonded peer
    pub fn admit(&self, connection: Option<&Connection>) -> Result<(), ProvisioningError> {
        match connection {
            Some(conn) if conn.bonded => Ok(()),
            Some(conn) => {
                warn!(peer = %conn.peer, "Rejecting credential write from unbonded peer");
                Err(ProvisioningError::NotBonded)
            }
            None => {
                warn!("Rejecting credential write without an active connection");
                Err(ProvisioningError::NotBonded)
            }
        }
    }
}

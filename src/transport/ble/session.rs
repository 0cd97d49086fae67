//! BLE link bookkeeping

use std::collections::{HashMap, HashSet};

use bluer::Address;
use tracing::debug;

use crate::core::{
    event::SessionEvent,
    types::{DEFAULT_ATT_MTU, PeerId},
};

pub fn peer_id(address: Address) -> PeerId {
    PeerId(address.0)
}

pub fn address(peer: PeerId) -> Address {
    Address::new(peer.0)
}

/// Tracks which centrals are linked and what the provisioning session has
/// been told about them, so repeated BlueZ property signals are not replayed.
#[derive(Debug, Default)]
pub struct BleSession {
    links: HashMap<Address, u16>,
    watched: HashSet<Address>,
}

impl BleSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device as monitored; `false` if a watcher already exists
    pub fn watch(&mut self, address: Address) -> bool {
        self.watched.insert(address)
    }

    pub fn unwatch(&mut self, address: Address) {
        self.watched.remove(&address);
    }

    pub fn is_linked(&self, address: Address) -> bool {
        self.links.contains_key(&address)
    }

    pub fn linked(&self) -> impl Iterator<Item = Address> + '_ {
        self.links.keys().copied()
    }

    /// Record a link; the event to forward when it is new
    pub fn link_up(&mut self, address: Address) -> Option<SessionEvent> {
        if self.links.contains_key(&address) {
            return None;
        }
        self.links.insert(address, DEFAULT_ATT_MTU);
        debug!(%address, "Link up");
        Some(SessionEvent::Connected {
            peer: peer_id(address),
        })
    }

    /// Drop a link; the event to forward when it was known
    pub fn link_down(&mut self, address: Address) -> Option<SessionEvent> {
        self.links.remove(&address)?;
        debug!(%address, "Link down");
        Some(SessionEvent::Disconnected {
            peer: peer_id(address),
        })
    }

    /// Bond created or removed outside the pairing request, e.g. a central
    /// forgetting the device; only linked devices matter to the session
    pub fn pairing_changed(&self, address: Address, paired: bool) -> Option<SessionEvent> {
        if !self.is_linked(address) {
            return None;
        }
        debug!(%address, paired, "Pairing changed");
        Some(SessionEvent::PairingComplete {
            peer: peer_id(address),
            success: paired,
            reason: (!paired).then(|| "bond removed".to_string()),
        })
    }

    /// MTU carried on an ATT request; an event when it differs from the last one
    pub fn observe_mtu(&mut self, address: Address, mtu: u16) -> Option<SessionEvent> {
        let known = self.links.get_mut(&address)?;
        if *known == mtu {
            return None;
        }
        *known = mtu;
        Some(SessionEvent::MtuChanged {
            peer: peer_id(address),
            mtu,
        })
    }
}

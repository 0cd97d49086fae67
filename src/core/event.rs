//! Inputs and outputs of the serialized provisioning session

use tokio::sync::oneshot;

use crate::core::{
    credentials::Credentials,
    error::ProvisioningError,
    reassembly::TransferId,
    types::{CharacteristicId, NotifyChannel, PeerId, StateSnapshot},
};

/// Everything the session reacts to, delivered in order on one channel
#[derive(Debug)]
pub enum SessionEvent {
    Connected {
        peer: PeerId,
    },
    Disconnected {
        peer: PeerId,
    },
    /// The peer asked for a security upgrade; the gate answers on `reply`
    SecurityRequest {
        peer: PeerId,
        reply: Option<oneshot::Sender<bool>>,
    },
    PairingComplete {
        peer: PeerId,
        success: bool,
        reason: Option<String>,
    },
    MtuChanged {
        peer: PeerId,
        mtu: u16,
    },
    Write(WriteRequest),
    ExecuteWrite {
        flag: ExecuteWriteFlag,
        reply: Option<oneshot::Sender<WriteResponse>>,
    },
    Read {
        characteristic: CharacteristicId,
        reply: oneshot::Sender<Vec<u8>>,
    },
    ReassemblyTimeout(TransferId),
    Wifi(WifiEvent),
    /// Connect with credentials loaded from the store at startup
    ConnectStored(Credentials),
    /// Abandon a WiFi attempt that is still running and return to `Idle`
    CancelWifi,
    /// External mutation through the state setter
    SetState(StateSnapshot),
    StartAdvertising,
    StopAdvertising,
    Shutdown,
}

/// One ATT write as seen by the session
#[derive(Debug)]
pub struct WriteRequest {
    /// Writing central; `None` for CCCD changes from a notification session,
    /// which BlueZ does not attribute to a device
    pub peer: Option<PeerId>,
    pub characteristic: CharacteristicId,
    pub offset: u16,
    pub value: Vec<u8>,
    /// Part of a prepare/execute long write
    pub prepared: bool,
    pub needs_response: bool,
    pub reply: Option<oneshot::Sender<WriteResponse>>,
}

impl WriteRequest {
    /// Plain or write-without-response write of `value` by `peer`
    pub fn new(
        peer: PeerId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        needs_response: bool,
    ) -> Self {
        Self {
            peer: Some(peer),
            characteristic,
            offset: 0,
            value,
            prepared: false,
            needs_response,
            reply: None,
        }
    }

    /// Prepared long-write fragment at `offset`
    pub fn prepared(
        peer: PeerId,
        characteristic: CharacteristicId,
        offset: u16,
        value: Vec<u8>,
    ) -> Self {
        Self {
            offset,
            prepared: true,
            ..Self::new(peer, characteristic, value, true)
        }
    }

    /// Descriptor write implied by a notification session opening or closing
    pub fn cccd(channel: NotifyChannel, value: Vec<u8>) -> Self {
        Self {
            peer: None,
            characteristic: CharacteristicId::Cccd(channel),
            offset: 0,
            value,
            prepared: false,
            needs_response: false,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: oneshot::Sender<WriteResponse>) -> Self {
        self.reply = Some(reply);
        self
    }
}

/// Wire-level acknowledgement for a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResponse {
    Ack,
    /// Prepare-write response echoing the queued fragment
    PreparedEcho { offset: u16, value: Vec<u8> },
    NotPermitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteWriteFlag {
    Commit,
    Cancel,
}

/// Asynchronous outcome reported by the WiFi connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    Connected { ip: String },
    Disconnected { reason: DisconnectReason },
    Persisted(Result<(), String>),
}

/// Station disconnect reasons the session distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthFailed,
    FourWayHandshakeTimeout,
    HandshakeTimeout,
    NoApFound,
    BeaconTimeout,
    Other(u16),
}

impl DisconnectReason {
    /// Map an 802.11 / vendor reason code
    pub fn from_code(code: u16) -> Self {
        match code {
            15 => DisconnectReason::FourWayHandshakeTimeout,
            200 => DisconnectReason::BeaconTimeout,
            201 => DisconnectReason::NoApFound,
            202 => DisconnectReason::AuthFailed,
            204 => DisconnectReason::HandshakeTimeout,
            other => DisconnectReason::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DisconnectReason::FourWayHandshakeTimeout => 15,
            DisconnectReason::BeaconTimeout => 200,
            DisconnectReason::NoApFound => 201,
            DisconnectReason::AuthFailed => 202,
            DisconnectReason::HandshakeTimeout => 204,
            DisconnectReason::Other(code) => *code,
        }
    }

    /// Error reported once retries are exhausted
    pub fn to_error(&self) -> ProvisioningError {
        match self {
            DisconnectReason::AuthFailed
            | DisconnectReason::FourWayHandshakeTimeout
            | DisconnectReason::HandshakeTimeout => ProvisioningError::WifiAuthFailed,
            DisconnectReason::NoApFound | DisconnectReason::BeaconTimeout => {
                ProvisioningError::WifiApNotFound
            }
            DisconnectReason::Other(_) => ProvisioningError::WifiTimeout,
        }
    }
}

/// Side effects the session asks the BLE adapter to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Notify {
        channel: NotifyChannel,
        value: Vec<u8>,
    },
    Advertise(bool),
    RequestSecurity(PeerId),
}

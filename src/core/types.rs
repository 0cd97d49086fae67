//! Domain types for BLE WiFi provisioning

use serde::{Deserialize, Serialize};

/// Provisioning lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Idle,
    BleConnected,
    CredentialsReceived,
    WifiConnecting,
    WifiConnected,
    WifiFailed,
    Provisioned,
    Error,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Idle => "idle",
            ProvisioningState::BleConnected => "ble_connected",
            ProvisioningState::CredentialsReceived => "credentials_received",
            ProvisioningState::WifiConnecting => "wifi_connecting",
            ProvisioningState::WifiConnected => "wifi_connected",
            ProvisioningState::WifiFailed => "wifi_failed",
            ProvisioningState::Provisioned => "provisioned",
            ProvisioningState::Error => "error",
        }
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code carried by every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    InvalidPayload,
    MissingNetworkName,
    MissingSecret,
    BufferOverflow,
    NotBonded,
    WifiTimeout,
    WifiAuthFailed,
    WifiApNotFound,
    StorageFailed,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::InvalidPayload => "invalid_payload",
            StatusCode::MissingNetworkName => "missing_network_name",
            StatusCode::MissingSecret => "missing_secret",
            StatusCode::BufferOverflow => "buffer_overflow",
            StatusCode::NotBonded => "not_bonded",
            StatusCode::WifiTimeout => "wifi_timeout",
            StatusCode::WifiAuthFailed => "wifi_auth_failed",
            StatusCode::WifiApNotFound => "wifi_ap_not_found",
            StatusCode::StorageFailed => "storage_failed",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse state exposed on the 1-byte State characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AppState {
    Awaiting = 0,
    Provisioning = 1,
    Success = 2,
    Failed = 3,
}

impl From<ProvisioningState> for AppState {
    fn from(state: ProvisioningState) -> Self {
        match state {
            ProvisioningState::Idle
            | ProvisioningState::BleConnected
            | ProvisioningState::CredentialsReceived => AppState::Awaiting,
            ProvisioningState::WifiConnecting => AppState::Provisioning,
            ProvisioningState::WifiConnected | ProvisioningState::Provisioned => {
                AppState::Success
            }
            ProvisioningState::WifiFailed | ProvisioningState::Error => AppState::Failed,
        }
    }
}

impl TryFrom<u8> for AppState {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(AppState::Awaiting),
            1 => Ok(AppState::Provisioning),
            2 => Ok(AppState::Success),
            3 => Ok(AppState::Failed),
            _ => Err(()),
        }
    }
}

impl From<AppState> for u8 {
    fn from(state: AppState) -> Self {
        state as u8
    }
}

/// Point-in-time view of the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ProvisioningState,
    pub status: StatusCode,
    pub message: String,
}

impl StateSnapshot {
    pub fn new(state: ProvisioningState, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            state,
            status,
            message: message.into(),
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::from(self.state)
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new(
            ProvisioningState::Idle,
            StatusCode::Success,
            "Ready to receive WiFi credentials",
        )
    }
}

/// BLE device address of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 6]);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Identifier the session assigns to each accepted link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u16);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Default ATT MTU before the exchange completes
pub const DEFAULT_ATT_MTU: u16 = 23;

/// The single active peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub bonded: bool,
    pub mtu: u16,
    pub state_subscribed: bool,
    pub status_subscribed: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            bonded: false,
            mtu: DEFAULT_ATT_MTU,
            state_subscribed: false,
            status_subscribed: false,
        }
    }

    /// Largest value a single ATT write can carry on this link
    pub fn max_write_len(&self) -> usize {
        usize::from(self.mtu.saturating_sub(3))
    }

    pub fn is_subscribed(&self, channel: NotifyChannel) -> bool {
        match channel {
            NotifyChannel::State => self.state_subscribed,
            NotifyChannel::Status => self.status_subscribed,
        }
    }
}

/// Notify-capable characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyChannel {
    State,
    Status,
}

/// Attributes a peer may write to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    Credentials,
    /// Client characteristic configuration descriptor of a notify characteristic
    Cccd(NotifyChannel),
    State,
    Status,
}

/// Session identifier used to correlate log lines of one provisioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Error types for the BLE WiFi provisioning service

use thiserror::Error;

use super::types::{ProvisioningState, StatusCode};

/// Result type for WiFi backend operations
pub type WifiResult<T> = Result<T, WifiError>;

/// Result type for credential store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures of a single credential submission attempt.
///
/// These never cross the BLE write boundary. Each one is surfaced to the peer by
/// moving the state machine into `Error` (or `WifiFailed`) with the matching
/// [`StatusCode`] and [`ProvisioningError::peer_message`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("invalid credential payload: {0}")]
    InvalidPayload(String),

    #[error("network name missing or invalid")]
    MissingNetworkName,

    #[error("secret missing or invalid")]
    MissingSecret,

    #[error("credential payload exceeds {capacity} bytes")]
    BufferOverflow { capacity: usize },

    #[error("peer is not bonded")]
    NotBonded,

    #[error("WiFi connection timed out")]
    WifiTimeout,

    #[error("WiFi authentication failed")]
    WifiAuthFailed,

    #[error("WiFi access point not found")]
    WifiApNotFound,

    #[error("failed to persist credentials: {0}")]
    StorageFailed(String),
}

impl ProvisioningError {
    /// Status code reported alongside the `Error`/`WifiFailed` transition
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProvisioningError::InvalidPayload(_) => StatusCode::InvalidPayload,
            ProvisioningError::MissingNetworkName => StatusCode::MissingNetworkName,
            ProvisioningError::MissingSecret => StatusCode::MissingSecret,
            ProvisioningError::BufferOverflow { .. } => StatusCode::BufferOverflow,
            ProvisioningError::NotBonded => StatusCode::NotBonded,
            ProvisioningError::WifiTimeout => StatusCode::WifiTimeout,
            ProvisioningError::WifiAuthFailed => StatusCode::WifiAuthFailed,
            ProvisioningError::WifiApNotFound => StatusCode::WifiApNotFound,
            ProvisioningError::StorageFailed(_) => StatusCode::StorageFailed,
        }
    }

    /// Human-readable message pushed to the peer on the status channel.
    ///
    /// Kept stable because provisioning apps display these verbatim.
    pub fn peer_message(&self) -> &'static str {
        match self {
            ProvisioningError::InvalidPayload(_) => "Invalid JSON format",
            ProvisioningError::MissingNetworkName => "SSID field missing or invalid",
            ProvisioningError::MissingSecret => "Password field missing or invalid",
            ProvisioningError::BufferOverflow { .. } => "Credentials too long",
            ProvisioningError::NotBonded => "Device must be bonded before sending credentials",
            ProvisioningError::WifiTimeout => "Connection timeout",
            ProvisioningError::WifiAuthFailed => "Authentication failed - check password",
            ProvisioningError::WifiApNotFound => "Access point not found - check SSID",
            ProvisioningError::StorageFailed(_) => "Failed to save credentials",
        }
    }
}

/// Errors related to WiFi backend operations
#[derive(Error, Debug, Clone)]
pub enum WifiError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Network interface error: {0}")]
    InterfaceError(String),

    #[error("wpa_supplicant error: {0}")]
    WpaSupplicantError(String),

    #[error("No credentials pending")]
    NoPendingCredentials,
}

/// Errors related to the persistent credential store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt credential store: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors related to core service operations
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid state transition from {from:?} on {event}")]
    InvalidStateTransition {
        from: ProvisioningState,
        event: &'static str,
    },

    #[error("WiFi connector unavailable")]
    ConnectorUnavailable,

    #[error("Provisioning session closed")]
    SessionClosed,

    #[error("Backend error: {0}")]
    Backend(#[from] WifiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors related to the BLE transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No peer connected")]
    NotConnected,

    #[error("Outbound link closed")]
    LinkClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("BLE error: {0}")]
    Ble(String),
}

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        TransportError::Ble(e.to_string())
    }
}

//! WiFi backend trait definition

use trait_variant::make;

use crate::core::{error::WifiResult, event::DisconnectReason};

/// How a single association attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Associated and an IPv4 address was assigned
    Connected { ip: String },
    /// The station gave up on this attempt
    Disconnected(DisconnectReason),
}

/// Abstraction over the WiFi control interface (typically wpa_supplicant)
///
/// This trait enables testing by allowing mock implementations
/// while providing a standard interface for station operations.
#[make(Send)]
pub trait WifiBackend: Sync + 'static {
    /// Run one association attempt and wait for its outcome
    ///
    /// # Arguments
    /// * `ssid` - Network SSID (up to 32 bytes UTF-8)
    /// * `passphrase` - WPA passphrase (8..=63 bytes), empty for open networks
    async fn connect(&self, ssid: &str, passphrase: &str) -> WifiResult<LinkOutcome>;

    /// Disconnect from the current network
    async fn disconnect(&self) -> WifiResult<()>;
}

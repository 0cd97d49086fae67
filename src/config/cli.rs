//! Command-line argument parsing

use clap::{Parser, ValueEnum};

use crate::{
    backend::credential_store::DEFAULT_CREDENTIALS_PATH, transport::ble::DEFAULT_DEVICE_NAME,
};

/// How the end of a credential transfer is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Framing {
    /// A trailing `}` closes the JSON object
    Json,
    /// A 2-byte big-endian length header announces the payload size
    LengthPrefixed,
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "ble-wifi-provisioning", version, author)]
#[clap(about = "Provision WiFi credentials over a bonded BLE GATT link")]
pub struct CliArgs {
    /// Wireless network interface name
    #[clap(short, long, default_value = "wlan0")]
    pub interface: String,

    /// Name advertised to BLE centrals
    #[clap(short = 'n', long, default_value = DEFAULT_DEVICE_NAME)]
    pub device_name: String,

    /// File holding the persisted credentials
    #[clap(long, default_value = DEFAULT_CREDENTIALS_PATH)]
    pub credentials_path: String,

    /// Drop a partial credential transfer after this many idle milliseconds
    #[clap(long, default_value = "2000")]
    pub reassembly_timeout_ms: u64,

    /// Connection retries after the first attempt (0 disables retrying)
    #[clap(long, default_value = "5")]
    pub max_attempts: u8,

    /// Pause between connection attempts in milliseconds
    #[clap(long, default_value = "500")]
    pub retry_delay_ms: u64,

    /// How long stored credentials may take to connect at startup
    #[clap(long, default_value = "30")]
    pub stored_connect_timeout_secs: u64,

    /// Keep the BLE link up this long after provisioning so the final state is delivered
    #[clap(long, default_value = "2000")]
    pub provisioned_grace_ms: u64,

    /// Credential transfer framing
    #[clap(long, value_enum, default_value = "json")]
    pub framing: Framing,

    /// Erase stored credentials and exit
    #[clap(long)]
    pub clear_credentials: bool,

    /// Start BLE provisioning even when stored credentials exist
    #[clap(long)]
    pub force_provisioning: bool,
}

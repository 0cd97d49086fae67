//! WiFi backend abstraction layer

pub mod credential_store;
pub mod mock_backend;
pub mod wifi_backend;
pub mod wifi_ctrl_backend;

pub use credential_store::{CredentialStore, FileCredentialStore};
pub use wifi_backend::{LinkOutcome, WifiBackend};
pub use wifi_ctrl_backend::WifiCtrlBackend;

#[cfg(test)]
pub use mock_backend::{MemoryCredentialStore, MockWifiBackend};

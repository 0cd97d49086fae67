//! BLE WiFi Provisioning Service
//!
//! Receives WiFi credentials from a bonded Bluetooth Low Energy central over a
//! single GATT service, joins the network and persists the credentials.

pub mod backend;
pub mod config;
pub mod core;
pub mod protocol;
pub mod transport;

pub use core::{
    credentials::{Credentials, parse_credentials},
    error::{ProvisioningError, ServiceError, StoreError, TransportError, WifiError},
    service::ProvisioningService,
    session::{ProvisioningSession, SessionConfig},
    types::{AppState, ProvisioningState, StateSnapshot, StatusCode},
};

//! Transport layers

pub mod ble;

//! Bluetooth Low Energy transport layer

pub mod adapter;
pub mod characteristics;
pub mod gatt;
pub mod session;
pub mod uuids;

pub use {
    adapter::BleAdapter,
    characteristics::{CharacteristicHandler, NotifierHub},
    gatt::GattServer,
    session::BleSession,
    uuids::*,
};

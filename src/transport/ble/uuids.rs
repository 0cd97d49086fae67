//! BLE GATT identifiers and link constants

use uuid::Uuid;

/// Provisioning service UUID
pub const PROVISIONING_SERVICE_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x46, 0x77, 0x68, 0x62, 0x28, 0x22, 0x72, 0x46, 0x63, 0x27, 0x74, 0x78, 0x26, 0x80, 0x00,
]);

/// Provisioning state characteristic (read/notify, one byte)
pub const STATE_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x46, 0x77, 0x68, 0x62, 0x28, 0x22, 0x72, 0x46, 0x63, 0x27, 0x74, 0x78, 0x26, 0x80, 0x01,
]);

/// Credentials characteristic (write / write without response, fragmented JSON)
pub const CREDENTIALS_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x46, 0x77, 0x68, 0x62, 0x28, 0x22, 0x72, 0x46, 0x63, 0x27, 0x74, 0x78, 0x26, 0x80, 0x02,
]);

/// Status characteristic (read/notify, JSON report)
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x46, 0x77, 0x68, 0x62, 0x28, 0x22, 0x72, 0x46, 0x63, 0x27, 0x74, 0x78, 0x26, 0x80, 0x03,
]);

/// ATT MTU requested from centrals
pub const ATT_MTU_TARGET: u16 = 517;

/// Advertised name when none is configured
pub const DEFAULT_DEVICE_NAME: &str = "ESP32_WiFi_Prov";

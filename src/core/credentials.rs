//! WiFi credentials and the credential payload parser

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::error::ProvisioningError;

/// Maximum SSID length in bytes (IEEE 802.11)
pub const MAX_NETWORK_NAME_LEN: usize = 32;

/// Maximum WPA passphrase length in bytes
pub const MAX_SECRET_LEN: usize = 63;

const NETWORK_NAME_KEYS: [&str; 2] = ["ssid", "network_name"];
const SECRET_KEYS: [&str; 2] = ["password", "secret"];

/// A network name and secret pair, scrubbed from memory on drop.
///
/// Not `Clone`: a parsed pair is moved into the WiFi connector exactly once.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct Credentials {
    #[serde(rename = "ssid")]
    network_name: String,
    #[serde(rename = "password")]
    secret: String,
}

impl Credentials {
    pub fn new(network_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            secret: secret.into(),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Open networks carry an empty secret
    pub fn is_open(&self) -> bool {
        self.secret.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("network_name", &self.network_name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn field<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

/// Decode a complete credential payload.
///
/// The payload must be a UTF-8 JSON object with a network name (`ssid` or
/// `network_name`) and a secret (`password` or `secret`). Unknown keys are
/// ignored.
pub fn parse_credentials(payload: &[u8]) -> Result<Credentials, ProvisioningError> {
    let mut value: Value = serde_json::from_slice(payload)
        .map_err(|e| ProvisioningError::InvalidPayload(e.to_string()))?;

    let result = match value.as_object() {
        Some(object) => extract(object),
        None => Err(ProvisioningError::InvalidPayload(
            "payload is not a JSON object".into(),
        )),
    };

    scrub(&mut value);
    result
}

fn extract(object: &serde_json::Map<String, Value>) -> Result<Credentials, ProvisioningError> {
    let network_name = match field(object, &NETWORK_NAME_KEYS) {
        Some(Value::String(name)) if !name.is_empty() && name.len() <= MAX_NETWORK_NAME_LEN => {
            name
        }
        _ => return Err(ProvisioningError::MissingNetworkName),
    };

    let secret = match field(object, &SECRET_KEYS) {
        Some(Value::String(secret)) if secret.len() <= MAX_SECRET_LEN => secret,
        _ => return Err(ProvisioningError::MissingSecret),
    };

    debug!(
        network_name = %network_name,
        secret_len = secret.len(),
        "Parsed credentials"
    );
    Ok(Credentials::new(network_name.as_str(), secret.as_str()))
}

/// Zero every string left in the decoded document
fn scrub(value: &mut Value) {
    match value {
        Value::String(s) => s.zeroize(),
        Value::Array(items) => items.iter_mut().for_each(scrub),
        Value::Object(object) => object.values_mut().for_each(scrub),
        _ => {}
    }
}

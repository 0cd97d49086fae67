//! Runtime settings

use std::{path::PathBuf, time::Duration};

use crate::{
    config::{CliArgs, cli::Framing},
    core::{
        framing::{FramingStrategy, JsonObjectTerminator, LengthPrefixed},
        session::SessionConfig,
    },
};

/// Runtime configuration settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub interface: String,
    pub device_name: String,
    pub credentials_path: PathBuf,
    pub reassembly_timeout: Duration,
    pub max_attempts: u8,
    pub retry_delay: Duration,
    pub stored_connect_timeout: Duration,
    pub provisioned_grace: Duration,
    pub framing: Framing,
    pub clear_credentials: bool,
    pub force_provisioning: bool,
}

impl Settings {
    /// Session parameters derived from these settings
    pub fn session_config(&self) -> SessionConfig {
        let framing: Box<dyn FramingStrategy> = match self.framing {
            Framing::Json => Box::new(JsonObjectTerminator),
            Framing::LengthPrefixed => Box::new(LengthPrefixed),
        };

        SessionConfig {
            reassembly_timeout: self.reassembly_timeout,
            max_attempts: self.max_attempts,
            framing,
        }
    }
}

impl From<CliArgs> for Settings {
    fn from(args: CliArgs) -> Self {
        Settings {
            interface: args.interface,
            device_name: args.device_name,
            credentials_path: PathBuf::from(args.credentials_path),
            reassembly_timeout: Duration::from_millis(args.reassembly_timeout_ms),
            max_attempts: args.max_attempts,
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            stored_connect_timeout: Duration::from_secs(args.stored_connect_timeout_secs),
            provisioned_grace: Duration::from_millis(args.provisioned_grace_ms),
            framing: args.framing,
            clear_credentials: args.clear_credentials,
            force_provisioning: args.force_provisioning,
        }
    }
}

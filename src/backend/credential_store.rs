//! Persistent credential storage

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use trait_variant::make;
use zeroize::Zeroize;

use crate::core::{credentials::Credentials, error::StoreResult};

/// Default location of the credential file
pub const DEFAULT_CREDENTIALS_PATH: &str = "/var/lib/ble-wifi-provisioning/credentials.json";

/// Owner read/write only; the file holds the network secret
#[cfg(unix)]
const CREDENTIALS_FILE_MODE: u32 = 0o600;

/// Storage for the last successfully connected network
#[make(Send)]
pub trait CredentialStore: Sync + 'static {
    /// Stored credentials, if the device has been provisioned
    async fn load(&self) -> StoreResult<Option<Credentials>>;

    async fn save(&self, credentials: &Credentials) -> StoreResult<()>;

    /// Forget stored credentials; succeeds if nothing is stored
    async fn clear(&self) -> StoreResult<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    #[serde(flatten)]
    credentials: Credentials,
    provisioned: bool,
}

/// JSON file store, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        PathBuf::from(staging)
    }

    async fn write_staging(&self, staging: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(CREDENTIALS_FILE_MODE);

        let mut file = options.open(staging).await?;
        // A stale staging file keeps its old mode when reopened.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(CREDENTIALS_FILE_MODE))
                .await?;
        }
        file.write_all(bytes).await?;
        file.sync_all().await
    }
}

impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> StoreResult<Option<Credentials>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored credentials");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record: StoredRecord = serde_json::from_slice(&bytes)?;
        if !record.provisioned {
            return Ok(None);
        }
        Ok(Some(record.credentials))
    }

    async fn save(&self, credentials: &Credentials) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let record = StoredRecord {
            credentials: Credentials::new(credentials.network_name(), credentials.secret()),
            provisioned: true,
        };
        let mut bytes = serde_json::to_vec_pretty(&record)?;

        let staging = self.staging_path();
        let written = self.write_staging(&staging, &bytes).await;
        bytes.zeroize();
        written?;
        tokio::fs::rename(&staging, &self.path).await?;

        info!(
            path = %self.path.display(),
            network_name = %credentials.network_name(),
            "Credentials stored"
        );
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Stored credentials cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

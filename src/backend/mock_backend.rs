//! Mock WiFi backend and in-memory credential store for testing

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backend::{CredentialStore, LinkOutcome, WifiBackend};
use crate::core::{
    credentials::Credentials,
    error::{StoreError, StoreResult, WifiError, WifiResult},
};

/// Internal state for the mock backend
#[derive(Debug, Default)]
struct MockState {
    outcomes: VecDeque<LinkOutcome>,
    should_fail_connect: bool,
    attempts: Vec<(String, String)>,
    disconnects: usize,
}

/// Mock WiFi backend for testing
///
/// Each `connect` pops the next scripted outcome; with nothing scripted it
/// connects with `192.168.1.100`.
#[derive(Debug, Clone, Default)]
pub struct MockWifiBackend {
    inner: Arc<Mutex<MockState>>,
}

impl MockWifiBackend {
    /// Create a new mock backend with default state
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of a future connect attempt
    pub async fn push_outcome(&self, outcome: LinkOutcome) {
        self.inner.lock().await.outcomes.push_back(outcome);
    }

    /// Configure mock to fail connect operations
    pub async fn set_connect_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_connect = should_fail;
    }

    /// `(ssid, passphrase)` of every attempt so far
    pub async fn attempts(&self) -> Vec<(String, String)> {
        self.inner.lock().await.attempts.clone()
    }

    pub async fn disconnects(&self) -> usize {
        self.inner.lock().await.disconnects
    }
}

impl WifiBackend for MockWifiBackend {
    async fn connect(&self, ssid: &str, passphrase: &str) -> WifiResult<LinkOutcome> {
        let mut state = self.inner.lock().await;
        state
            .attempts
            .push((ssid.to_string(), passphrase.to_string()));

        if state.should_fail_connect {
            return Err(WifiError::ConnectionFailed("Mock connect failure".into()));
        }

        Ok(state.outcomes.pop_front().unwrap_or(LinkOutcome::Connected {
            ip: "192.168.1.100".into(),
        }))
    }

    async fn disconnect(&self) -> WifiResult<()> {
        self.inner.lock().await.disconnects += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    stored: Option<(String, String)>,
    should_fail_save: bool,
}

/// Credential store kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_credentials(network_name: &str, secret: &str) -> Self {
        let store = Self::new();
        store.inner.lock().await.stored = Some((network_name.into(), secret.into()));
        store
    }

    /// Configure mock to fail save operations
    pub async fn set_save_failure(&self, should_fail: bool) {
        self.inner.lock().await.should_fail_save = should_fail;
    }

    pub async fn stored_network(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .stored
            .as_ref()
            .map(|(name, _)| name.clone())
    }
}

impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> StoreResult<Option<Credentials>> {
        Ok(self
            .inner
            .lock()
            .await
            .stored
            .as_ref()
            .map(|(name, secret)| Credentials::new(name.as_str(), secret.as_str())))
    }

    async fn save(&self, credentials: &Credentials) -> StoreResult<()> {
        let mut state = self.inner.lock().await;
        if state.should_fail_save {
            return Err(StoreError::Io(std::io::Error::other("Mock save failure")));
        }
        state.stored = Some((
            credentials.network_name().to_string(),
            credentials.secret().to_string(),
        ));
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.inner.lock().await.stored = None;
        Ok(())
    }
}

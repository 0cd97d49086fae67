//! Main provisioning service facade

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    backend::{CredentialStore, WifiBackend},
    core::{
        connector::{ConnectionService, ConnectorHandle, DEFAULT_RETRY_DELAY},
        credentials::Credentials,
        error::{ServiceError, ServiceResult},
        event::{Outbound, SessionEvent},
        session::{ProvisioningSession, SessionConfig},
        types::{ProvisioningState, StateSnapshot},
    },
};

/// Default wait for stored credentials at startup
pub const DEFAULT_STORED_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the session task and the connector worker
///
/// The BLE transport talks to the session through [`Self::events`] and
/// performs the [`Outbound`] requests returned by [`Self::start`].
pub struct ProvisioningService {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Receiver<StateSnapshot>,
    connector: ConnectorHandle,
    session_task: JoinHandle<()>,
    connector_task: JoinHandle<()>,
}

impl ProvisioningService {
    /// Spawn the connector worker and the session event loop
    pub fn start<B, S>(
        backend: Arc<B>,
        store: Arc<S>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>)
    where
        B: WifiBackend,
        S: CredentialStore,
    {
        Self::start_with_retry_delay(backend, store, config, DEFAULT_RETRY_DELAY)
    }

    pub fn start_with_retry_delay<B, S>(
        backend: Arc<B>,
        store: Arc<S>,
        config: SessionConfig,
        retry_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>)
    where
        B: WifiBackend,
        S: CredentialStore,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let (connector, connector_task) = ConnectionService::new(backend, store, event_tx.clone())
            .with_retry_delay(retry_delay)
            .spawn();

        let mut session =
            ProvisioningSession::new(config, connector.clone(), event_tx.clone(), outbound_tx);
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot().clone());
        session.register_observer(move |state| {
            snapshot_tx.send_replace(state.clone());
        });
        let session_task = tokio::spawn(session.run(event_rx));

        (
            Self {
                events: event_tx,
                snapshot,
                connector,
                session_task,
                connector_task,
            },
            outbound_rx,
        )
    }

    /// Sender the transport uses to feed the session
    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events.clone()
    }

    fn send(&self, event: SessionEvent) -> ServiceResult<()> {
        self.events
            .send(event)
            .map_err(|_| ServiceError::SessionClosed)
    }

    /// Latest state snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot.clone()
    }

    /// External state setter; applied in order with every other event
    pub fn set(&self, snapshot: StateSnapshot) -> ServiceResult<()> {
        self.send(SessionEvent::SetState(snapshot))
    }

    pub fn start_advertising(&self) -> ServiceResult<()> {
        self.send(SessionEvent::StartAdvertising)
    }

    pub fn stop_advertising(&self) -> ServiceResult<()> {
        self.send(SessionEvent::StopAdvertising)
    }

    pub async fn stored_credentials(&self) -> ServiceResult<Option<Credentials>> {
        Ok(self.connector.stored_credentials().await?)
    }

    pub async fn clear_stored_credentials(&self) -> ServiceResult<()> {
        Ok(self.connector.clear_stored_credentials().await?)
    }

    /// Try stored credentials; `true` once provisioned within `timeout`.
    ///
    /// On failure or timeout the attempt is abandoned and the session is left
    /// ready for BLE provisioning.
    pub async fn connect_stored(
        &self,
        credentials: Credentials,
        timeout: Duration,
    ) -> ServiceResult<bool> {
        let mut snapshot = self.subscribe();
        self.send(SessionEvent::ConnectStored(credentials))?;

        let settled = tokio::time::timeout(
            timeout,
            snapshot.wait_for(|s| {
                matches!(
                    s.state,
                    ProvisioningState::Provisioned
                        | ProvisioningState::WifiFailed
                        | ProvisioningState::Error
                )
            }),
        )
        .await;

        match settled {
            Ok(Ok(state)) if state.state == ProvisioningState::Provisioned => {
                info!(message = %state.message, "Provisioned from stored credentials");
                Ok(true)
            }
            Ok(Ok(state)) => {
                warn!(state = %state.state, status = %state.status, "Stored credentials failed");
                Ok(false)
            }
            Ok(Err(_)) => Err(ServiceError::SessionClosed),
            Err(_) => {
                warn!(timeout_s = timeout.as_secs(), "Stored credentials timed out");
                self.send(SessionEvent::CancelWifi)?;
                Ok(false)
            }
        }
    }

    /// Wait until the session reaches `Provisioned`
    pub async fn wait_provisioned(&self) -> ServiceResult<StateSnapshot> {
        let mut snapshot = self.subscribe();
        let state = snapshot
            .wait_for(|s| s.state == ProvisioningState::Provisioned)
            .await
            .map_err(|_| ServiceError::SessionClosed)?;
        Ok(state.clone())
    }

    /// Stop the session loop and the connector worker
    pub async fn shutdown(self) {
        let _ = self.events.send(SessionEvent::Shutdown);
        let _ = self.session_task.await;
        drop(self.connector);
        self.connector_task.abort();
    }
}

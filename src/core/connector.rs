//! WiFi connector: the session-facing handle and its background worker

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{CredentialStore, LinkOutcome, WifiBackend},
    core::{
        credentials::Credentials,
        error::{StoreError, StoreResult, WifiError, WifiResult},
        event::{DisconnectReason, SessionEvent, WifiEvent},
    },
};

/// Pause before re-running a failed association
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What the session needs from the network side.
///
/// Calls return as soon as the request is queued; outcomes come back as
/// [`WifiEvent`]s on the session channel.
pub trait WifiConnector: Send {
    /// Start connecting with `credentials`; `Err` means the request was rejected
    fn connect(&self, credentials: Credentials) -> WifiResult<()>;

    /// Run another attempt with the credentials of the last `connect`
    fn retry(&self) -> WifiResult<()>;

    /// Store the credentials of the last `connect`
    fn persist(&self) -> WifiResult<()>;

    /// Abort a running attempt and forget its credentials
    fn cancel(&self) -> WifiResult<()>;
}

#[derive(Debug)]
enum ConnectorCommand {
    Connect(Credentials),
    Retry,
    Persist,
    Cancel,
    LoadStored(oneshot::Sender<StoreResult<Option<Credentials>>>),
    ClearStored(oneshot::Sender<StoreResult<()>>),
}

/// Cloneable handle to a running [`ConnectionService`]
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    commands: mpsc::UnboundedSender<ConnectorCommand>,
}

impl ConnectorHandle {
    fn send(&self, command: ConnectorCommand) -> WifiResult<()> {
        self.commands
            .send(command)
            .map_err(|_| WifiError::BackendUnavailable("connector stopped".into()))
    }

    /// Credentials saved by an earlier provisioning run
    pub async fn stored_credentials(&self) -> StoreResult<Option<Credentials>> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectorCommand::LoadStored(tx))
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        rx.await
            .map_err(|_| StoreError::Io(std::io::Error::other("connector stopped")))?
    }

    pub async fn clear_stored_credentials(&self) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectorCommand::ClearStored(tx))
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        rx.await
            .map_err(|_| StoreError::Io(std::io::Error::other("connector stopped")))?
    }
}

impl WifiConnector for ConnectorHandle {
    fn connect(&self, credentials: Credentials) -> WifiResult<()> {
        self.send(ConnectorCommand::Connect(credentials))
    }

    fn retry(&self) -> WifiResult<()> {
        self.send(ConnectorCommand::Retry)
    }

    fn persist(&self) -> WifiResult<()> {
        self.send(ConnectorCommand::Persist)
    }

    fn cancel(&self) -> WifiResult<()> {
        self.send(ConnectorCommand::Cancel)
    }
}

/// Owns the backend and the store; runs one attempt at a time
pub struct ConnectionService<B: WifiBackend, S: CredentialStore> {
    backend: Arc<B>,
    store: Arc<S>,
    events: mpsc::UnboundedSender<SessionEvent>,
    retry_delay: Duration,
    pending: Option<Arc<Credentials>>,
    attempt: Option<JoinHandle<()>>,
}

impl<B: WifiBackend, S: CredentialStore> ConnectionService<B, S> {
    /// Create a new connection service reporting to `events`
    pub fn new(backend: Arc<B>, store: Arc<S>, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            backend,
            store,
            events,
            retry_delay: DEFAULT_RETRY_DELAY,
            pending: None,
            attempt: None,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Spawn the worker and return its handle
    pub fn spawn(self) -> (ConnectorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (ConnectorHandle { commands: tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ConnectorCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                ConnectorCommand::Connect(credentials) => {
                    info!(network_name = %credentials.network_name(), "Connecting to WiFi");
                    self.pending = Some(Arc::new(credentials));
                    self.start_attempt(Duration::ZERO);
                }
                ConnectorCommand::Retry => {
                    if self.pending.is_some() {
                        self.start_attempt(self.retry_delay);
                    } else {
                        warn!("Retry requested without pending credentials");
                        self.report(WifiEvent::Disconnected {
                            reason: DisconnectReason::Other(0),
                        });
                    }
                }
                ConnectorCommand::Persist => {
                    let result = match &self.pending {
                        Some(credentials) => self
                            .store
                            .save(credentials)
                            .await
                            .map_err(|e| e.to_string()),
                        None => Err(WifiError::NoPendingCredentials.to_string()),
                    };
                    if let Err(e) = &result {
                        error!("Failed to persist credentials: {}", e);
                    }
                    self.pending = None;
                    self.report(WifiEvent::Persisted(result));
                }
                ConnectorCommand::Cancel => {
                    self.abort_attempt();
                    self.pending = None;
                    if let Err(e) = self.backend.disconnect().await {
                        warn!("Disconnect after cancel failed: {}", e);
                    }
                }
                ConnectorCommand::LoadStored(reply) => {
                    let _ = reply.send(self.store.load().await);
                }
                ConnectorCommand::ClearStored(reply) => {
                    let _ = reply.send(self.store.clear().await);
                }
            }
        }

        self.abort_attempt();
        debug!("Connector stopped");
    }

    fn abort_attempt(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }

    fn start_attempt(&mut self, delay: Duration) {
        self.abort_attempt();

        let Some(credentials) = self.pending.clone() else {
            return;
        };
        let backend = self.backend.clone();
        let events = self.events.clone();

        self.attempt = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let event = match backend
                .connect(credentials.network_name(), credentials.secret())
                .await
            {
                Ok(LinkOutcome::Connected { ip }) => WifiEvent::Connected { ip },
                Ok(LinkOutcome::Disconnected(reason)) => WifiEvent::Disconnected { reason },
                Err(e) => {
                    warn!("WiFi attempt failed: {}", e);
                    WifiEvent::Disconnected {
                        reason: DisconnectReason::Other(0),
                    }
                }
            };
            let _ = events.send(SessionEvent::Wifi(event));
        }));
    }

    fn report(&self, event: WifiEvent) {
        if self.events.send(SessionEvent::Wifi(event)).is_err() {
            debug!("Session gone, dropping WiFi event");
        }
    }
}

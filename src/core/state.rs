//! Provisioning state machine with synchronous observers

use tracing::{debug, info};

use crate::core::{
    error::{ProvisioningError, ServiceError, ServiceResult},
    types::{ProvisioningState, StateSnapshot, StatusCode},
};

/// Callback invoked on every transition, in registration order
pub type Observer = Box<dyn FnMut(&StateSnapshot) + Send>;

/// Named inputs that drive the transition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    PeerConnected,
    CredentialsParsed,
    /// `attempt` is 0 for the initial attempt and counts retries afterwards
    ConnectAttemptStarted { attempt: u8, max_attempts: u8 },
    IpAcquired { ip: String },
    CredentialsPersisted { ip: String },
    RetriesExhausted(ProvisioningError),
    Failure(ProvisioningError),
    PeerDisconnected,
}

impl ProvisioningEvent {
    fn name(&self) -> &'static str {
        match self {
            ProvisioningEvent::PeerConnected => "peer_connected",
            ProvisioningEvent::CredentialsParsed => "credentials_parsed",
            ProvisioningEvent::ConnectAttemptStarted { .. } => "connect_attempt_started",
            ProvisioningEvent::IpAcquired { .. } => "ip_acquired",
            ProvisioningEvent::CredentialsPersisted { .. } => "credentials_persisted",
            ProvisioningEvent::RetriesExhausted(_) => "retries_exhausted",
            ProvisioningEvent::Failure(_) => "failure",
            ProvisioningEvent::PeerDisconnected => "peer_disconnected",
        }
    }
}

/// Computes the snapshot an event leads to from `from`, or `None` if the
/// transition table has no entry for the pair.
pub fn next_snapshot(from: ProvisioningState, event: &ProvisioningEvent) -> Option<StateSnapshot> {
    use ProvisioningState::*;

    let snapshot = match (from, event) {
        (Idle | Error | WifiFailed, ProvisioningEvent::PeerConnected) => {
            StateSnapshot::new(BleConnected, StatusCode::Success, "BLE client connected")
        }
        (Provisioned | WifiConnected, ProvisioningEvent::CredentialsParsed) => return None,
        (_, ProvisioningEvent::CredentialsParsed) => StateSnapshot::new(
            CredentialsReceived,
            StatusCode::Success,
            "Credentials received successfully",
        ),
        (
            CredentialsReceived | WifiConnecting,
            ProvisioningEvent::ConnectAttemptStarted {
                attempt,
                max_attempts,
            },
        ) => {
            let message = if *attempt == 0 {
                "Initiating WiFi connection".to_string()
            } else {
                format!("Connecting... (attempt {attempt}/{max_attempts})")
            };
            StateSnapshot::new(WifiConnecting, StatusCode::Success, message)
        }
        (WifiConnecting, ProvisioningEvent::IpAcquired { ip }) => {
            StateSnapshot::new(WifiConnected, StatusCode::Success, ip.clone())
        }
        (WifiConnected, ProvisioningEvent::CredentialsPersisted { ip }) => {
            StateSnapshot::new(Provisioned, StatusCode::Success, ip.clone())
        }
        (WifiConnecting, ProvisioningEvent::RetriesExhausted(err)) => {
            StateSnapshot::new(WifiFailed, err.status_code(), err.peer_message())
        }
        (Provisioned, ProvisioningEvent::Failure(_)) => return None,
        (_, ProvisioningEvent::Failure(err)) => {
            StateSnapshot::new(Error, err.status_code(), err.peer_message())
        }
        (
            Idle | BleConnected | CredentialsReceived | Error | WifiFailed,
            ProvisioningEvent::PeerDisconnected,
        ) => StateSnapshot::new(
            Idle,
            StatusCode::Success,
            "BLE disconnected, restarting advertising",
        ),
        _ => return None,
    };

    Some(snapshot)
}

/// Process-wide provisioning state with an ordered observer list
pub struct StateMachine {
    current: StateSnapshot,
    observers: Vec<Observer>,
}

impl StateMachine {
    /// Create a state machine in `Idle`
    pub fn new() -> Self {
        Self {
            current: StateSnapshot::default(),
            observers: Vec::new(),
        }
    }

    /// Register an observer; it sees every later transition
    pub fn register<F>(&mut self, observer: F)
    where
        F: FnMut(&StateSnapshot) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Current snapshot
    pub fn get(&self) -> &StateSnapshot {
        &self.current
    }

    pub fn state(&self) -> ProvisioningState {
        self.current.state
    }

    /// Unconditional setter; the only place the snapshot changes.
    ///
    /// Observers run before this returns.
    pub fn set(
        &mut self,
        state: ProvisioningState,
        status: StatusCode,
        message: impl Into<String>,
    ) -> &StateSnapshot {
        let next = StateSnapshot::new(state, status, message);
        info!(
            from = %self.current.state,
            to = %next.state,
            status = %next.status,
            message = %next.message,
            "Provisioning state changed"
        );

        self.current = next;
        for observer in self.observers.iter_mut() {
            observer(&self.current);
        }
        &self.current
    }

    /// Apply a table-driven transition
    pub fn apply(&mut self, event: ProvisioningEvent) -> ServiceResult<&StateSnapshot> {
        let from = self.current.state;
        match next_snapshot(from, &event) {
            Some(next) => Ok(self.set(next.state, next.status, next.message)),
            None => {
                debug!(%from, event = event.name(), "Transition rejected");
                Err(ServiceError::InvalidStateTransition {
                    from,
                    event: event.name(),
                })
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("observers", &self.observers.len())
            .finish()
    }
}

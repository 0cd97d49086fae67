//! The provisioning session: one owner for connection, buffer, timer and state
//!
//! Every input arrives as a [`SessionEvent`] and is handled to completion
//! before the next one; nothing here awaits while holding session state.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::{
    core::{
        connector::WifiConnector,
        credentials::{Credentials, parse_credentials},
        error::{ProvisioningError, TransportError, TransportResult},
        event::{ExecuteWriteFlag, Outbound, SessionEvent, WifiEvent, WriteRequest, WriteResponse},
        framing::{FramingStrategy, JsonObjectTerminator},
        gate::SecurityGate,
        reassembly::{
            AppendOutcome, CREDENTIAL_BUFFER_CAPACITY, ReassemblyBuffer, TransferId, TransferMode,
        },
        state::{ProvisioningEvent, StateMachine},
        timer::{DEFAULT_REASSEMBLY_TIMEOUT, ReassemblyTimer},
        types::{
            CharacteristicId, Connection, ConnectionId, NotifyChannel, PeerId, ProvisioningState,
            SessionId, StateSnapshot, StatusCode,
        },
    },
    protocol::{MAX_STATUS_LEN, StatusReport, state_payload},
};

/// Connection retries after the initial attempt
pub const DEFAULT_MAX_ATTEMPTS: u8 = 5;

/// Session tuning knobs
pub struct SessionConfig {
    pub reassembly_timeout: Duration,
    pub max_attempts: u8,
    pub framing: Box<dyn FramingStrategy>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            framing: Box::new(JsonObjectTerminator),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("reassembly_timeout", &self.reassembly_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("framing", &self.framing.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialOrigin {
    Peer,
    Store,
}

/// Single-peer provisioning session
pub struct ProvisioningSession<C: WifiConnector> {
    id: SessionId,
    started: Instant,
    machine: StateMachine,
    transitions: mpsc::UnboundedReceiver<StateSnapshot>,
    connection: Option<Connection>,
    next_connection: u16,
    buffer: ReassemblyBuffer,
    framing: Box<dyn FramingStrategy>,
    timer: ReassemblyTimer,
    gate: SecurityGate,
    unbonded_fragments: usize,
    long_write_overflowed: bool,
    connector: C,
    outbound: mpsc::UnboundedSender<Outbound>,
    advertising: bool,
    retries: u8,
    max_attempts: u8,
    origin: Option<CredentialOrigin>,
}

impl<C: WifiConnector> ProvisioningSession<C> {
    /// Create a session in `Idle`.
    ///
    /// `events` is the session's own input channel; the reassembly timer
    /// posts its expiries there.
    pub fn new(
        config: SessionConfig,
        connector: C,
        events: mpsc::UnboundedSender<SessionEvent>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let (transition_tx, transitions) = mpsc::unbounded_channel();
        let mut machine = StateMachine::new();
        machine.register(move |snapshot| {
            let _ = transition_tx.send(snapshot.clone());
        });

        let id = SessionId::new();
        info!(
            session = %id,
            framing = config.framing.name(),
            timeout_ms = config.reassembly_timeout.as_millis() as u64,
            "Provisioning session created"
        );

        Self {
            id,
            started: Instant::now(),
            machine,
            transitions,
            connection: None,
            next_connection: 1,
            buffer: ReassemblyBuffer::new(CREDENTIAL_BUFFER_CAPACITY),
            framing: config.framing,
            timer: ReassemblyTimer::new(config.reassembly_timeout, events),
            gate: SecurityGate::default(),
            unbonded_fragments: 0,
            long_write_overflowed: false,
            connector,
            outbound,
            advertising: false,
            retries: 0,
            max_attempts: config.max_attempts,
            origin: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Add a state observer; it runs after the session's own notifier
    pub fn register_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&StateSnapshot) + Send + 'static,
    {
        self.machine.register(observer);
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        self.machine.get()
    }

    pub fn state(&self) -> ProvisioningState {
        self.machine.state()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Process events until `Shutdown` or until every sender is gone
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }

        self.timer.cancel();
        self.stop_advertising();
        info!(session = %self.id, state = %self.state(), "Provisioning session stopped");
    }

    /// Handle one event to completion, then push resulting notifications
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { peer } => self.on_connect(peer),
            SessionEvent::Disconnected { peer } => self.on_disconnect(peer),
            SessionEvent::SecurityRequest { peer, reply } => {
                let accepted = self.on_security_request(peer);
                if let Some(reply) = reply {
                    let _ = reply.send(accepted);
                }
            }
            SessionEvent::PairingComplete {
                peer,
                success,
                reason,
            } => self.on_pairing_complete(peer, success, reason.as_deref()),
            SessionEvent::MtuChanged { peer, mtu } => self.on_mtu(peer, mtu),
            SessionEvent::Write(mut request) => {
                let reply = request.reply.take();
                let response = self.on_write(request);
                if let (Some(reply), Some(response)) = (reply, response) {
                    let _ = reply.send(response);
                }
            }
            SessionEvent::ExecuteWrite { flag, reply } => {
                let response = self.on_execute_write(flag);
                if let Some(reply) = reply {
                    let _ = reply.send(response);
                }
            }
            SessionEvent::Read {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.read(characteristic));
            }
            SessionEvent::ReassemblyTimeout(transfer) => self.on_reassembly_timeout(transfer),
            SessionEvent::Wifi(event) => self.on_wifi_event(event),
            SessionEvent::ConnectStored(credentials) => self.connect_stored(credentials),
            SessionEvent::CancelWifi => self.cancel_wifi(),
            SessionEvent::SetState(snapshot) => {
                self.machine
                    .set(snapshot.state, snapshot.status, snapshot.message);
            }
            SessionEvent::StartAdvertising => self.start_advertising(),
            SessionEvent::StopAdvertising => self.stop_advertising(),
            SessionEvent::Shutdown => {}
        }

        self.flush_notifications();
    }

    pub fn start_advertising(&mut self) {
        if self.advertising {
            return;
        }
        self.advertising = true;
        self.emit(Outbound::Advertise(true));
    }

    pub fn stop_advertising(&mut self) {
        if !self.advertising {
            return;
        }
        self.advertising = false;
        self.emit(Outbound::Advertise(false));
    }

    pub fn on_connect(&mut self, peer: PeerId) {
        if let Some(existing) = &self.connection {
            if existing.peer != peer {
                warn!(%peer, active = %existing.peer, "Ignoring second connection");
            }
            return;
        }

        let id = ConnectionId(self.next_connection);
        self.next_connection = self.next_connection.wrapping_add(1);
        self.connection = Some(Connection::new(id, peer));
        info!(session = %self.id, %peer, connection = %id, "BLE client connected");

        self.discard_transfer();
        self.stop_advertising();
        self.emit(Outbound::RequestSecurity(peer));
        self.transition(ProvisioningEvent::PeerConnected);
    }

    pub fn on_disconnect(&mut self, peer: PeerId) {
        match &self.connection {
            Some(conn) if conn.peer == peer => {}
            _ => {
                debug!(%peer, "Disconnect for unknown peer");
                return;
            }
        }

        self.connection = None;
        self.discard_transfer();
        info!(session = %self.id, %peer, state = %self.state(), "BLE client disconnected");

        if self.state() != ProvisioningState::Provisioned {
            self.start_advertising();
        }
        self.transition(ProvisioningEvent::PeerDisconnected);
    }

    pub fn on_security_request(&mut self, peer: PeerId) -> bool {
        self.gate.on_security_request(peer)
    }

    pub fn on_pairing_complete(&mut self, peer: PeerId, success: bool, reason: Option<&str>) {
        match self.connection.as_mut() {
            Some(conn) if conn.peer == peer => {
                self.gate.on_pairing_complete(conn, success, reason);
            }
            _ => debug!(%peer, "Pairing result for unknown peer"),
        }
    }

    pub fn on_mtu(&mut self, peer: PeerId, mtu: u16) {
        if let Some(conn) = self.connection.as_mut().filter(|conn| conn.peer == peer) {
            conn.mtu = mtu;
            info!(
                %peer,
                mtu,
                max_write = conn.max_write_len(),
                "ATT MTU negotiated"
            );
        }
    }

    /// Route a write; `None` when the peer did not ask for a response
    pub fn on_write(&mut self, request: WriteRequest) -> Option<WriteResponse> {
        if !self.from_active_peer(&request) {
            return request.needs_response.then_some(WriteResponse::NotPermitted);
        }

        let response = match request.characteristic {
            CharacteristicId::Cccd(channel) => {
                self.on_cccd_write(channel, &request.value);
                WriteResponse::Ack
            }
            CharacteristicId::Credentials if request.prepared => {
                self.on_prepared_fragment(request.offset, &request.value);
                WriteResponse::PreparedEcho {
                    offset: request.offset,
                    value: request.value,
                }
            }
            CharacteristicId::Credentials => {
                self.on_credential_write(request.offset, &request.value);
                WriteResponse::Ack
            }
            CharacteristicId::State | CharacteristicId::Status => {
                warn!(characteristic = ?request.characteristic, "Write to read-only characteristic");
                WriteResponse::NotPermitted
            }
        };

        request.needs_response.then_some(response)
    }

    /// Only the connected central may write. Unattributed CCCD changes
    /// apply to it; unattributed credential bytes are refused.
    fn from_active_peer(&self, request: &WriteRequest) -> bool {
        let active = self.connection.as_ref().map(|conn| conn.peer);
        match (request.peer, active) {
            (Some(peer), Some(active)) if peer != active => {
                warn!(
                    %peer,
                    %active,
                    characteristic = ?request.characteristic,
                    "Ignoring write from second central"
                );
                false
            }
            (None, _) if request.characteristic == CharacteristicId::Credentials => {
                warn!("Ignoring credential write without a peer address");
                false
            }
            _ => true,
        }
    }

    /// Commit or cancel the pending long write; always acknowledged
    pub fn on_execute_write(&mut self, flag: ExecuteWriteFlag) -> WriteResponse {
        let rejected = std::mem::take(&mut self.unbonded_fragments);
        let overflowed = std::mem::take(&mut self.long_write_overflowed);

        match flag {
            ExecuteWriteFlag::Cancel => {
                debug!(len = self.buffer.len(), "Long write cancelled");
                self.discard_transfer();
            }
            ExecuteWriteFlag::Commit => {
                if rejected > 0 {
                    warn!(fragments = rejected, "Dropping long write from unbonded peer");
                    self.discard_transfer();
                    self.fail(ProvisioningError::NotBonded);
                } else if overflowed {
                    warn!("Dropping long write that overflowed the buffer");
                    self.discard_transfer();
                } else if self.buffer.mode() == Some(TransferMode::Prepared) {
                    if let Err(err) = self.gate.admit(self.connection.as_ref()) {
                        self.discard_transfer();
                        self.fail(err);
                    } else if let Some(payload) = self.buffer.commit() {
                        info!(len = payload.len(), "Long write committed");
                        self.dispatch(payload);
                    }
                } else {
                    debug!("Execute write with nothing staged");
                }
            }
        }

        WriteResponse::Ack
    }

    fn on_cccd_write(&mut self, channel: NotifyChannel, value: &[u8]) {
        let enabled = value.first().is_some_and(|flags| flags & 0b11 != 0);
        let Some(conn) = self.connection.as_mut() else {
            debug!(?channel, "CCCD write without connection");
            return;
        };

        match channel {
            NotifyChannel::State => conn.state_subscribed = enabled,
            NotifyChannel::Status => conn.status_subscribed = enabled,
        }
        debug!(?channel, enabled, "Notifications configured");

        if channel == NotifyChannel::Status && enabled {
            let snapshot = self.machine.get().clone();
            self.notify(&snapshot);
        }
    }

    fn on_prepared_fragment(&mut self, offset: u16, value: &[u8]) {
        if self.gate.admit(self.connection.as_ref()).is_err() {
            // Acked to keep the long write alive; refused at execute.
            self.unbonded_fragments += 1;
            return;
        }
        if self.long_write_overflowed {
            debug!(offset, "Dropping fragment of overflowed long write");
            return;
        }

        if self.buffer.mode() == Some(TransferMode::Append) {
            self.timer.cancel();
        }
        if let Err(err) = self.buffer.stage(usize::from(offset), value) {
            // The rest of this long write is dropped until execute.
            self.long_write_overflowed = true;
            self.fail(err);
        }
    }

    fn on_credential_write(&mut self, offset: u16, value: &[u8]) {
        if let Err(err) = self.gate.admit(self.connection.as_ref()) {
            self.fail(err);
            return;
        }

        if offset != 0 && usize::from(offset) != self.buffer.len() {
            debug!(offset, buffered = self.buffer.len(), "Write offset ignored");
        }

        match self.buffer.append(value, self.framing.as_ref()) {
            Ok(AppendOutcome::Complete(payload)) => {
                self.timer.cancel();
                info!(len = payload.len(), "Credential payload complete");
                self.dispatch(payload);
            }
            Ok(AppendOutcome::Pending { transfer, .. }) => self.timer.arm(transfer),
            Err(err) => {
                self.timer.cancel();
                self.fail(err);
            }
        }
    }

    pub fn on_reassembly_timeout(&mut self, transfer: TransferId) {
        self.timer.fired(transfer);

        if self.buffer.active_transfer() != Some(transfer)
            || self.buffer.mode() != Some(TransferMode::Append)
        {
            debug!(%transfer, "Stale reassembly timeout");
            return;
        }

        let payload = self.buffer.take();
        warn!(%transfer, len = payload.len(), "Reassembly timed out, dispatching partial payload");
        self.dispatch(payload);
    }

    /// Parse a complete payload and hand the credentials to the connector
    fn dispatch(&mut self, mut payload: Vec<u8>) {
        let parsed = parse_credentials(&payload);
        payload.zeroize();

        match parsed {
            Ok(credentials) => self.start_connect(credentials, CredentialOrigin::Peer),
            Err(err) => {
                warn!(error = %err, "Rejected credential payload");
                self.fail(err);
            }
        }
    }

    fn start_connect(&mut self, credentials: Credentials, origin: CredentialOrigin) {
        let accepted = match origin {
            CredentialOrigin::Peer => self.transition(ProvisioningEvent::CredentialsParsed),
            CredentialOrigin::Store => {
                self.machine.set(
                    ProvisioningState::CredentialsReceived,
                    StatusCode::Success,
                    "Using stored credentials",
                );
                true
            }
        };
        if !accepted {
            warn!(state = %self.state(), "Ignoring credentials");
            return;
        }

        self.retries = 0;
        self.origin = Some(origin);
        match self.connector.connect(credentials) {
            Ok(()) => {
                self.transition(ProvisioningEvent::ConnectAttemptStarted {
                    attempt: 0,
                    max_attempts: self.max_attempts,
                });
            }
            Err(e) => {
                error!(error = %e, "WiFi connector rejected request");
                self.origin = None;
                self.machine.set(
                    ProvisioningState::Error,
                    StatusCode::WifiTimeout,
                    "Failed to initiate WiFi connection",
                );
            }
        }
    }

    fn connect_stored(&mut self, credentials: Credentials) {
        info!(network_name = %credentials.network_name(), "Connecting with stored credentials");
        self.start_connect(credentials, CredentialOrigin::Store);
    }

    fn cancel_wifi(&mut self) {
        if let Err(e) = self.connector.cancel() {
            warn!(error = %e, "Failed to cancel WiFi attempt");
        }
        self.origin = None;
        if matches!(
            self.state(),
            ProvisioningState::WifiConnecting | ProvisioningState::WifiConnected
        ) {
            let ready = StateSnapshot::default();
            self.machine.set(ready.state, ready.status, ready.message);
        }
    }

    pub fn on_wifi_event(&mut self, event: WifiEvent) {
        match event {
            WifiEvent::Connected { ip } => {
                if self.state() != ProvisioningState::WifiConnecting {
                    debug!(%ip, state = %self.state(), "Ignoring WiFi connect");
                    return;
                }
                info!(%ip, "WiFi connected");
                self.transition(ProvisioningEvent::IpAcquired { ip });
                if let Err(e) = self.connector.persist() {
                    self.fail(ProvisioningError::StorageFailed(e.to_string()));
                }
            }
            WifiEvent::Disconnected { reason } => {
                if self.state() != ProvisioningState::WifiConnecting {
                    debug!(code = reason.code(), state = %self.state(), "Ignoring WiFi disconnect");
                    return;
                }

                if self.retries < self.max_attempts {
                    self.retries += 1;
                    warn!(
                        code = reason.code(),
                        attempt = self.retries,
                        max_attempts = self.max_attempts,
                        "WiFi attempt failed, retrying"
                    );
                    match self.connector.retry() {
                        Ok(()) => {
                            self.transition(ProvisioningEvent::ConnectAttemptStarted {
                                attempt: self.retries,
                                max_attempts: self.max_attempts,
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "WiFi retry rejected");
                            self.exhausted(reason.to_error());
                        }
                    }
                } else {
                    self.exhausted(reason.to_error());
                }
            }
            WifiEvent::Persisted(result) => {
                if self.state() != ProvisioningState::WifiConnected {
                    debug!(state = %self.state(), "Ignoring persistence result");
                    return;
                }

                match (result, self.origin.take()) {
                    (Ok(()), Some(CredentialOrigin::Store)) => {
                        self.machine.set(
                            ProvisioningState::Provisioned,
                            StatusCode::Success,
                            "Connected using stored credentials",
                        );
                    }
                    (Ok(()), _) => {
                        let ip = self.machine.get().message.clone();
                        self.transition(ProvisioningEvent::CredentialsPersisted { ip });
                    }
                    (Err(e), _) => {
                        // WiFi stays up; only the persistence step failed.
                        self.fail(ProvisioningError::StorageFailed(e));
                    }
                }
            }
        }
    }

    fn exhausted(&mut self, err: ProvisioningError) {
        error!(error = %err, retries = self.retries, "WiFi connection failed");
        self.origin = None;
        self.transition(ProvisioningEvent::RetriesExhausted(err));
    }

    /// Current value of a readable characteristic
    pub fn read(&self, characteristic: CharacteristicId) -> Vec<u8> {
        let snapshot = self.machine.get();
        match characteristic {
            CharacteristicId::State => state_payload(snapshot.app_state()),
            CharacteristicId::Status => self.status_payload(snapshot).unwrap_or_default(),
            CharacteristicId::Credentials | CharacteristicId::Cccd(_) => Vec::new(),
        }
    }

    /// Push the 1-byte state to a subscribed peer
    pub fn send_state(&self, state: u8) -> TransportResult<()> {
        self.send(NotifyChannel::State, vec![state])
    }

    /// Push a status document to a subscribed peer
    pub fn send_status(&self, status: &[u8]) -> TransportResult<()> {
        let len = status.len().min(MAX_STATUS_LEN);
        self.send(NotifyChannel::Status, status[..len].to_vec())
    }

    fn send(&self, channel: NotifyChannel, value: Vec<u8>) -> TransportResult<()> {
        let conn = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        if !conn.is_subscribed(channel) {
            debug!(?channel, "Peer not subscribed, skipping notification");
            return Ok(());
        }

        self.outbound
            .send(Outbound::Notify { channel, value })
            .map_err(|_| TransportError::LinkClosed)
    }

    fn status_payload(&self, snapshot: &StateSnapshot) -> TransportResult<Vec<u8>> {
        let timestamp = self.started.elapsed().as_millis() as u64;
        StatusReport::new(snapshot, timestamp).to_payload()
    }

    fn notify(&self, snapshot: &StateSnapshot) {
        let result = self
            .send_state(u8::from(snapshot.app_state()))
            .and_then(|()| self.send_status(&self.status_payload(snapshot)?));

        match result {
            Ok(()) => {}
            Err(TransportError::NotConnected) => {
                debug!(state = %snapshot.state, "No peer to notify");
            }
            Err(e) => warn!(error = %e, "Failed to send notification"),
        }
    }

    fn flush_notifications(&mut self) {
        while let Ok(snapshot) = self.transitions.try_recv() {
            self.notify(&snapshot);
        }
    }

    fn transition(&mut self, event: ProvisioningEvent) -> bool {
        self.machine.apply(event).is_ok()
    }

    fn fail(&mut self, err: ProvisioningError) {
        self.transition(ProvisioningEvent::Failure(err));
    }

    fn discard_transfer(&mut self) {
        self.timer.cancel();
        self.buffer.reset();
        self.unbonded_fragments = 0;
        self.long_write_overflowed = false;
    }

    fn emit(&self, outbound: Outbound) {
        if self.outbound.send(outbound).is_err() {
            debug!("Outbound channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{error::WifiResult, event::DisconnectReason, framing::LengthPrefixed};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    const PEER: PeerId = PeerId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const OTHER: PeerId = PeerId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(String, String),
        Retry,
        Persist,
        Cancel,
    }

    #[derive(Clone, Default)]
    struct RecordingConnector {
        calls: Arc<Mutex<Vec<Call>>>,
        reject: bool,
    }

    impl RecordingConnector {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> WifiResult<()> {
            if self.reject {
                return Err(crate::core::error::WifiError::BackendUnavailable(
                    "rejected".into(),
                ));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl WifiConnector for RecordingConnector {
        fn connect(&self, credentials: Credentials) -> WifiResult<()> {
            self.record(Call::Connect(
                credentials.network_name().to_string(),
                credentials.secret().to_string(),
            ))
        }

        fn retry(&self) -> WifiResult<()> {
            self.record(Call::Retry)
        }

        fn persist(&self) -> WifiResult<()> {
            self.record(Call::Persist)
        }

        fn cancel(&self) -> WifiResult<()> {
            self.record(Call::Cancel)
        }
    }

    struct Harness {
        session: ProvisioningSession<RecordingConnector>,
        connector: RecordingConnector,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(SessionConfig {
                reassembly_timeout: Duration::from_millis(40),
                ..SessionConfig::default()
            })
        }

        fn with_config(config: SessionConfig) -> Self {
            Self::build(config, RecordingConnector::default())
        }

        fn build(config: SessionConfig, connector: RecordingConnector) -> Self {
            let (event_tx, events) = mpsc::unbounded_channel();
            let (outbound_tx, outbound) = mpsc::unbounded_channel();
            let session = ProvisioningSession::new(config, connector.clone(), event_tx, outbound_tx);
            Self {
                session,
                connector,
                events,
                outbound,
            }
        }

        /// Connected, bonded and subscribed to both channels
        fn ready(mut self) -> Self {
            self.session.handle(SessionEvent::Connected { peer: PEER });
            self.session.handle(SessionEvent::PairingComplete {
                peer: PEER,
                success: true,
                reason: None,
            });
            self.subscribe();
            self.drain();
            self
        }

        fn subscribe(&mut self) {
            for channel in [NotifyChannel::State, NotifyChannel::Status] {
                self.write(WriteRequest::new(
                    PEER,
                    CharacteristicId::Cccd(channel),
                    vec![0x01, 0x00],
                    true,
                ));
            }
        }

        fn write(&mut self, request: WriteRequest) {
            self.session.handle(SessionEvent::Write(request));
        }

        fn write_credentials(&mut self, fragment: &[u8]) {
            self.write(WriteRequest::new(
                PEER,
                CharacteristicId::Credentials,
                fragment.to_vec(),
                false,
            ));
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(item) = self.outbound.try_recv() {
                out.push(item);
            }
            out
        }

        fn state_bytes(&mut self) -> Vec<u8> {
            self.drain()
                .into_iter()
                .filter_map(|item| match item {
                    Outbound::Notify {
                        channel: NotifyChannel::State,
                        value,
                    } => Some(value[0]),
                    _ => None,
                })
                .collect()
        }

        /// Let the paused clock run past the reassembly timeout
        async fn pump_timer(&mut self) {
            tokio::time::sleep(Duration::from_millis(80)).await;
            while let Ok(event) = self.events.try_recv() {
                self.session.handle(event);
            }
        }
    }

    fn connects(calls: &[Call]) -> usize {
        calls
            .iter()
            .filter(|call| matches!(call, Call::Connect(..)))
            .count()
    }

    #[tokio::test]
    async fn test_connect_requests_security_and_stops_advertising() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::StartAdvertising);
        h.session.handle(SessionEvent::StartAdvertising);
        assert_eq!(h.drain(), vec![Outbound::Advertise(true)]);

        h.session.handle(SessionEvent::Connected { peer: PEER });
        assert_eq!(
            h.drain(),
            vec![Outbound::Advertise(false), Outbound::RequestSecurity(PEER)]
        );
        assert!(!h.session.is_advertising());
        assert_eq!(h.session.state(), ProvisioningState::BleConnected);
        assert!(!h.session.connection().unwrap().bonded);
    }

    #[tokio::test]
    async fn test_second_peer_is_ignored() {
        let mut h = Harness::new().ready();
        h.session.handle(SessionEvent::Connected { peer: OTHER });
        assert_eq!(h.session.connection().unwrap().peer, PEER);

        h.session.handle(SessionEvent::Disconnected { peer: OTHER });
        assert!(h.session.connection().is_some());
    }

    #[tokio::test]
    async fn test_security_request_is_accepted() {
        let mut h = Harness::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        h.session.handle(SessionEvent::SecurityRequest {
            peer: PEER,
            reply: Some(tx),
        });
        assert!(rx.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_write_without_response() {
        let mut h = Harness::new().ready();

        h.write_credentials(br#"{"ssid":"Home"#);
        h.write_credentials(br#"Net","password":"secr"#);
        assert_eq!(h.session.state(), ProvisioningState::BleConnected);
        assert!(h.connector.calls().is_empty());

        h.write_credentials(br#"et123"}"#);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("HomeNet".into(), "secret123".into())]
        );
        assert_eq!(h.session.state(), ProvisioningState::WifiConnecting);
        assert_eq!(h.session.buffered_len(), 0);

        // CredentialsReceived (0) then WifiConnecting (1)
        assert_eq!(h.state_bytes(), vec![0, 1]);

        // Completed transfer leaves no timer behind
        h.pump_timer().await;
        assert_eq!(connects(&h.connector.calls()), 1);
    }

    #[tokio::test]
    async fn test_any_fragmentation_yields_same_credentials() {
        let payload = br#"{"network_name":"Attic","secret":"correct horse"}"#;
        for mtu in [23u16, 24, 30, 64, 517] {
            let mut h = Harness::new().ready();
            h.session.handle(SessionEvent::MtuChanged { peer: PEER, mtu });
            let chunk = h.session.connection().unwrap().max_write_len();

            for fragment in payload.chunks(chunk) {
                h.write_credentials(fragment);
            }
            assert_eq!(
                h.connector.calls(),
                vec![Call::Connect("Attic".into(), "correct horse".into())],
                "mtu {mtu}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbonded_write_never_reaches_connector() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::Connected { peer: PEER });
        h.subscribe();
        h.drain();

        h.write_credentials(br#"{"ssid":"HomeNet","password":"secret123"}"#);
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.session.buffered_len(), 0);
        assert_eq!(h.session.state(), ProvisioningState::Error);
        assert_eq!(h.session.snapshot().status, StatusCode::NotBonded);
        assert_eq!(
            h.session.snapshot().message,
            "Device must be bonded before sending credentials"
        );
        assert_eq!(h.state_bytes(), vec![3]);

        // Nothing was buffered, so nothing expires later.
        h.pump_timer().await;
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pairing_keeps_gate_closed() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::Connected { peer: PEER });
        h.session.handle(SessionEvent::PairingComplete {
            peer: PEER,
            success: false,
            reason: Some("timeout".into()),
        });

        h.write_credentials(br#"{"ssid":"a","password":"b"}"#);
        assert_eq!(h.session.snapshot().status, StatusCode::NotBonded);
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_removed_bond_closes_gate() {
        let mut h = Harness::new().ready();
        h.session.handle(SessionEvent::PairingComplete {
            peer: PEER,
            success: false,
            reason: Some("bond removed".into()),
        });
        assert!(!h.session.connection().unwrap().bonded);

        h.write_credentials(br#"{"ssid":"a","password":"b"}"#);
        assert_eq!(h.session.snapshot().status, StatusCode::NotBonded);
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_then_fresh_transfer() {
        let mut h = Harness::new().ready();

        h.write_credentials(&[b' '; 500]);
        h.write_credentials(&[b' '; 13]);
        assert_eq!(h.session.state(), ProvisioningState::Error);
        assert_eq!(h.session.snapshot().status, StatusCode::BufferOverflow);
        assert_eq!(h.session.snapshot().message, "Credentials too long");
        assert_eq!(h.session.buffered_len(), 0);

        h.write_credentials(br#"{"ssid":"HomeNet","password":"secret123"}"#);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("HomeNet".into(), "secret123".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_dispatches_partial_payload_once() {
        let mut h = Harness::new().ready();

        h.write_credentials(br#"{"ssid":"Home"#);
        h.pump_timer().await;

        assert_eq!(h.session.state(), ProvisioningState::Error);
        assert_eq!(h.session.snapshot().status, StatusCode::InvalidPayload);
        assert_eq!(h.session.buffered_len(), 0);

        let status_count = h
            .drain()
            .into_iter()
            .filter(|item| {
                matches!(
                    item,
                    Outbound::Notify {
                        channel: NotifyChannel::Status,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(status_count, 1);

        h.pump_timer().await;
        assert!(h.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rearms_after_each_fragment() {
        let mut h = Harness::with_config(SessionConfig {
            reassembly_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        })
        .ready();

        h.write_credentials(br#"{"ssid":"#);
        tokio::time::sleep(Duration::from_millis(120)).await;
        h.write_credentials(br#""Home","#);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // First deadline was replaced; no expiry yet.
        while let Ok(event) = h.events.try_recv() {
            h.session.handle(event);
        }
        assert_eq!(h.session.state(), ProvisioningState::BleConnected);

        h.write_credentials(br#""password":"pw"}"#);
        assert_eq!(connects(&h.connector.calls()), 1);
    }

    #[tokio::test]
    async fn test_stale_timeout_is_ignored() {
        let mut h = Harness::new().ready();
        h.write_credentials(b"{");
        h.session
            .handle(SessionEvent::ReassemblyTimeout(TransferId(999)));
        assert_eq!(h.session.buffered_len(), 1);
        assert_eq!(h.session.state(), ProvisioningState::BleConnected);
    }

    #[tokio::test]
    async fn test_malformed_payloads() {
        let cases: [(&[u8], StatusCode); 3] = [
            (br#"{"ssid"}"#, StatusCode::InvalidPayload),
            (br#"{"password":"x"}"#, StatusCode::MissingNetworkName),
            (br#"{"ssid":"x"}"#, StatusCode::MissingSecret),
        ];

        for (payload, status) in cases {
            let mut h = Harness::new().ready();
            h.write_credentials(payload);
            assert_eq!(h.session.state(), ProvisioningState::Error);
            assert_eq!(h.session.snapshot().status, status);
            assert!(h.connector.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_retry_after_error_is_accepted() {
        let mut h = Harness::new().ready();
        h.write_credentials(br#"{"ssid":"x"}"#);
        assert_eq!(h.session.state(), ProvisioningState::Error);

        h.write_credentials(br#"{"ssid":"x","password":"longenough"}"#);
        assert_eq!(h.session.state(), ProvisioningState::WifiConnecting);
    }

    #[tokio::test]
    async fn test_prepared_write_out_of_order() {
        let mut h = Harness::new().ready();
        let payload = br#"{"ssid":"HomeNet","password":"secret123"}"#;

        for (offset, range) in [(20u16, 20..payload.len()), (0, 0..10), (10, 10..20)] {
            let (tx, rx) = tokio::sync::oneshot::channel();
            h.write(
                WriteRequest::prepared(
                    PEER,
                    CharacteristicId::Credentials,
                    offset,
                    payload[range.clone()].to_vec(),
                )
                .with_reply(tx),
            );
            assert_eq!(
                rx.await.unwrap(),
                WriteResponse::PreparedEcho {
                    offset,
                    value: payload[range].to_vec()
                }
            );
        }
        assert!(h.connector.calls().is_empty());

        let response = h.session.on_execute_write(ExecuteWriteFlag::Commit);
        assert_eq!(response, WriteResponse::Ack);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("HomeNet".into(), "secret123".into())]
        );
    }

    #[tokio::test]
    async fn test_prepared_cancel_discards() {
        let mut h = Harness::new().ready();
        h.write(WriteRequest::prepared(
            PEER,
            CharacteristicId::Credentials,
            0,
            br#"{"ssid":"a","password":"b"}"#.to_vec(),
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        h.session.handle(SessionEvent::ExecuteWrite {
            flag: ExecuteWriteFlag::Cancel,
            reply: Some(tx),
        });
        assert_eq!(rx.await.unwrap(), WriteResponse::Ack);
        assert_eq!(h.session.buffered_len(), 0);

        h.session.on_execute_write(ExecuteWriteFlag::Commit);
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.session.state(), ProvisioningState::BleConnected);
    }

    #[tokio::test]
    async fn test_unbonded_prepared_write_acked_but_refused() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::Connected { peer: PEER });

        let (tx, rx) = tokio::sync::oneshot::channel();
        h.write(
            WriteRequest::prepared(
                PEER,
                CharacteristicId::Credentials,
                0,
                br#"{"ssid":"a","password":"b"}"#.to_vec(),
            )
            .with_reply(tx),
        );
        assert!(matches!(
            rx.await.unwrap(),
            WriteResponse::PreparedEcho { offset: 0, .. }
        ));
        assert_eq!(h.session.buffered_len(), 0);

        h.session.handle(SessionEvent::ExecuteWrite {
            flag: ExecuteWriteFlag::Commit,
            reply: None,
        });
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.session.snapshot().status, StatusCode::NotBonded);
    }

    #[tokio::test]
    async fn test_prepared_overflow() {
        let mut h = Harness::new().ready();
        h.write(WriteRequest::prepared(
            PEER,
            CharacteristicId::Credentials,
            500,
            vec![b'x'; 20],
        ));
        assert_eq!(h.session.snapshot().status, StatusCode::BufferOverflow);

        h.session.on_execute_write(ExecuteWriteFlag::Commit);
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_overflowed_long_write_is_never_committed() {
        let mut h = Harness::new().ready();
        let mut payload = br#"{"ssid":"Evil","password":"pw"}"#.to_vec();
        payload.resize(600, b' ');

        for offset in [400usize, 0, 200] {
            h.write(WriteRequest::prepared(
                PEER,
                CharacteristicId::Credentials,
                offset as u16,
                payload[offset..offset + 200].to_vec(),
            ));
        }
        assert_eq!(h.session.snapshot().status, StatusCode::BufferOverflow);
        assert_eq!(h.session.buffered_len(), 0);

        h.session.on_execute_write(ExecuteWriteFlag::Commit);
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.session.state(), ProvisioningState::Error);
        assert_eq!(h.session.snapshot().status, StatusCode::BufferOverflow);

        // The next long write starts clean.
        h.write(WriteRequest::prepared(
            PEER,
            CharacteristicId::Credentials,
            0,
            br#"{"ssid":"HomeNet","password":"secret123"}"#.to_vec(),
        ));
        h.session.on_execute_write(ExecuteWriteFlag::Commit);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("HomeNet".into(), "secret123".into())]
        );
    }

    #[tokio::test]
    async fn test_second_central_cannot_write_over_bonded_link() {
        let mut h = Harness::new().ready();
        let payload = br#"{"ssid":"Evil","password":"pw123456"}"#;

        let response = h.session.on_write(WriteRequest::new(
            OTHER,
            CharacteristicId::Credentials,
            payload.to_vec(),
            true,
        ));
        assert_eq!(response, Some(WriteResponse::NotPermitted));

        let (tx, rx) = tokio::sync::oneshot::channel();
        h.write(
            WriteRequest::prepared(OTHER, CharacteristicId::Credentials, 0, payload.to_vec())
                .with_reply(tx),
        );
        assert_eq!(rx.await.unwrap(), WriteResponse::NotPermitted);
        h.session.on_execute_write(ExecuteWriteFlag::Commit);

        h.write(WriteRequest::new(
            OTHER,
            CharacteristicId::Cccd(NotifyChannel::State),
            vec![0x00, 0x00],
            true,
        ));
        assert!(h.session.connection().unwrap().state_subscribed);

        let unattributed = WriteRequest {
            peer: None,
            ..WriteRequest::new(PEER, CharacteristicId::Credentials, payload.to_vec(), true)
        };
        assert_eq!(
            h.session.on_write(unattributed),
            Some(WriteResponse::NotPermitted)
        );

        assert!(h.connector.calls().is_empty());
        assert_eq!(h.session.buffered_len(), 0);
        assert_eq!(h.session.state(), ProvisioningState::BleConnected);

        h.write_credentials(br#"{"ssid":"HomeNet","password":"secret123"}"#);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("HomeNet".into(), "secret123".into())]
        );
    }

    #[tokio::test]
    async fn test_write_without_response_gets_no_reply() {
        let mut h = Harness::new().ready();
        let response = h.session.on_write(WriteRequest::new(
            PEER,
            CharacteristicId::Credentials,
            b"{".to_vec(),
            false,
        ));
        assert_eq!(response, None);

        let response = h.session.on_write(WriteRequest::new(
            PEER,
            CharacteristicId::State,
            vec![1],
            true,
        ));
        assert_eq!(response, Some(WriteResponse::NotPermitted));
    }

    #[tokio::test]
    async fn test_status_subscription_emits_snapshot() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::Connected { peer: PEER });
        h.drain();

        h.write(WriteRequest::new(
            PEER,
            CharacteristicId::Cccd(NotifyChannel::State),
            vec![0x01, 0x00],
            true,
        ));
        assert!(h.drain().is_empty());

        h.write(WriteRequest::new(
            PEER,
            CharacteristicId::Cccd(NotifyChannel::Status),
            vec![0x02, 0x00],
            true,
        ));
        let out = h.drain();
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            Outbound::Notify {
                channel: NotifyChannel::State,
                value: vec![0]
            }
        );
        match &out[1] {
            Outbound::Notify {
                channel: NotifyChannel::Status,
                value,
            } => {
                let report: StatusReport = serde_json::from_slice(value).unwrap();
                assert_eq!(report.state, ProvisioningState::BleConnected);
                assert_eq!(report.message, "BLE client connected");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_without_peer() {
        let h = Harness::new();
        assert!(matches!(
            h.session.send_state(0),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            h.session.send_status(b"{}"),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_skipped_when_not_subscribed() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::Connected { peer: PEER });
        h.drain();

        h.session.send_state(2).unwrap();
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_reads_return_snapshot() {
        let h = Harness::new();
        assert_eq!(h.session.read(CharacteristicId::State), vec![0]);

        let report: StatusReport =
            serde_json::from_slice(&h.session.read(CharacteristicId::Status)).unwrap();
        assert_eq!(report.state, ProvisioningState::Idle);
        assert_eq!(report.message, "Ready to receive WiFi credentials");
    }

    #[tokio::test]
    async fn test_full_provisioning_flow() {
        let mut h = Harness::new().ready();
        h.write_credentials(br#"{"ssid":"HomeNet","password":"secret123"}"#);

        h.session.handle(SessionEvent::Wifi(WifiEvent::Connected {
            ip: "192.168.1.50".into(),
        }));
        assert_eq!(h.session.state(), ProvisioningState::WifiConnected);
        assert_eq!(h.connector.calls().last(), Some(&Call::Persist));

        h.session
            .handle(SessionEvent::Wifi(WifiEvent::Persisted(Ok(()))));
        assert_eq!(h.session.state(), ProvisioningState::Provisioned);
        assert_eq!(h.session.snapshot().message, "192.168.1.50");
        assert_eq!(h.state_bytes(), vec![0, 1, 2, 2]);

        // Provisioned is terminal: no advertising after the peer leaves.
        h.session.handle(SessionEvent::Disconnected { peer: PEER });
        assert_eq!(h.session.state(), ProvisioningState::Provisioned);
        assert!(!h.session.is_advertising());
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_reports_error() {
        let mut h = Harness::new().ready();
        h.write_credentials(br#"{"ssid":"HomeNet","password":"secret123"}"#);
        h.session.handle(SessionEvent::Wifi(WifiEvent::Connected {
            ip: "10.0.0.9".into(),
        }));
        h.session.handle(SessionEvent::Wifi(WifiEvent::Persisted(Err(
            "disk full".into(),
        ))));

        assert_eq!(h.session.state(), ProvisioningState::Error);
        assert_eq!(h.session.snapshot().status, StatusCode::StorageFailed);
        assert!(!h.connector.calls().contains(&Call::Cancel));
    }

    #[tokio::test]
    async fn test_retries_then_auth_failure() {
        let mut h = Harness::new().ready();
        h.write_credentials(br#"{"ssid":"HomeNet","password":"wrongpass"}"#);

        for attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            h.session.handle(SessionEvent::Wifi(WifiEvent::Disconnected {
                reason: DisconnectReason::AuthFailed,
            }));
            assert_eq!(h.session.state(), ProvisioningState::WifiConnecting);
            assert_eq!(
                h.session.snapshot().message,
                format!("Connecting... (attempt {attempt}/5)")
            );
        }

        h.session.handle(SessionEvent::Wifi(WifiEvent::Disconnected {
            reason: DisconnectReason::FourWayHandshakeTimeout,
        }));
        assert_eq!(h.session.state(), ProvisioningState::WifiFailed);
        assert_eq!(h.session.snapshot().status, StatusCode::WifiAuthFailed);
        assert_eq!(
            h.connector
                .calls()
                .iter()
                .filter(|call| **call == Call::Retry)
                .count(),
            5
        );
    }

    #[tokio::test]
    async fn test_exhaustion_status_mapping() {
        for (reason, status) in [
            (DisconnectReason::NoApFound, StatusCode::WifiApNotFound),
            (DisconnectReason::BeaconTimeout, StatusCode::WifiApNotFound),
            (DisconnectReason::Other(8), StatusCode::WifiTimeout),
        ] {
            let mut h = Harness::with_config(SessionConfig {
                max_attempts: 0,
                ..SessionConfig::default()
            })
            .ready();
            h.write_credentials(br#"{"ssid":"a","password":"b"}"#);
            h.session
                .handle(SessionEvent::Wifi(WifiEvent::Disconnected { reason }));
            assert_eq!(h.session.snapshot().status, status);
        }
    }

    #[tokio::test]
    async fn test_connector_rejection() {
        let connector = RecordingConnector {
            reject: true,
            ..Default::default()
        };
        let mut h = Harness::build(SessionConfig::default(), connector).ready();
        h.write_credentials(br#"{"ssid":"a","password":"b"}"#);

        assert_eq!(h.session.state(), ProvisioningState::Error);
        assert_eq!(h.session.snapshot().status, StatusCode::WifiTimeout);
        assert_eq!(h.session.snapshot().message, "Failed to initiate WiFi connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_resets_and_resumes_advertising() {
        let mut h = Harness::new().ready();
        h.write_credentials(br#"{"ssid":"Ho"#);
        assert!(h.session.buffered_len() > 0);

        h.session.handle(SessionEvent::Disconnected { peer: PEER });
        assert_eq!(h.session.buffered_len(), 0);
        assert!(h.session.connection().is_none());
        assert_eq!(h.session.state(), ProvisioningState::Idle);
        assert_eq!(
            h.session.snapshot().message,
            "BLE disconnected, restarting advertising"
        );
        assert_eq!(h.drain(), vec![Outbound::Advertise(true)]);

        // The cancelled transfer never expires.
        h.pump_timer().await;
        assert!(h.connector.calls().is_empty());

        // A reconnecting peer must bond again.
        h.session.handle(SessionEvent::Connected { peer: PEER });
        h.write_credentials(br#"{"ssid":"a","password":"b"}"#);
        assert_eq!(h.session.snapshot().status, StatusCode::NotBonded);
    }

    #[tokio::test]
    async fn test_disconnect_during_wifi_attempt_keeps_attempt() {
        let mut h = Harness::new().ready();
        h.write_credentials(br#"{"ssid":"HomeNet","password":"secret123"}"#);
        h.session.handle(SessionEvent::Disconnected { peer: PEER });

        assert_eq!(h.session.state(), ProvisioningState::WifiConnecting);
        assert!(h.session.is_advertising());

        h.session.handle(SessionEvent::Wifi(WifiEvent::Connected {
            ip: "192.168.1.7".into(),
        }));
        h.session
            .handle(SessionEvent::Wifi(WifiEvent::Persisted(Ok(()))));
        assert_eq!(h.session.state(), ProvisioningState::Provisioned);
    }

    #[tokio::test]
    async fn test_stored_credentials_flow() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::ConnectStored(Credentials::new(
            "Saved", "pw123456",
        )));
        assert_eq!(h.session.state(), ProvisioningState::WifiConnecting);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("Saved".into(), "pw123456".into())]
        );

        h.session.handle(SessionEvent::Wifi(WifiEvent::Connected {
            ip: "10.1.1.1".into(),
        }));
        h.session
            .handle(SessionEvent::Wifi(WifiEvent::Persisted(Ok(()))));
        assert_eq!(h.session.state(), ProvisioningState::Provisioned);
        assert_eq!(
            h.session.snapshot().message,
            "Connected using stored credentials"
        );
    }

    #[tokio::test]
    async fn test_cancel_wifi_returns_to_idle() {
        let mut h = Harness::new();
        h.session.handle(SessionEvent::ConnectStored(Credentials::new(
            "Saved", "pw123456",
        )));
        h.session.handle(SessionEvent::CancelWifi);

        assert_eq!(h.session.state(), ProvisioningState::Idle);
        assert_eq!(h.connector.calls().last(), Some(&Call::Cancel));

        // Late outcome of the abandoned attempt is ignored.
        h.session.handle(SessionEvent::Wifi(WifiEvent::Connected {
            ip: "10.1.1.1".into(),
        }));
        assert_eq!(h.session.state(), ProvisioningState::Idle);
    }

    #[tokio::test]
    async fn test_external_set_state_and_observers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut h = Harness::new();
        {
            let seen = seen.clone();
            h.session
                .register_observer(move |snapshot| seen.lock().unwrap().push(snapshot.state));
        }

        h.session.handle(SessionEvent::SetState(StateSnapshot::new(
            ProvisioningState::Error,
            StatusCode::StorageFailed,
            "external",
        )));
        h.session.handle(SessionEvent::Connected { peer: PEER });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProvisioningState::Error, ProvisioningState::BleConnected]
        );
    }

    #[tokio::test]
    async fn test_length_prefixed_framing() {
        let mut h = Harness::with_config(SessionConfig {
            framing: Box::new(LengthPrefixed),
            ..SessionConfig::default()
        })
        .ready();

        let body = br#"{"ssid":"Lab","password":"pw123456"}"#;
        let mut frame = (body.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(body);

        let (first, second) = frame.split_at(10);
        h.write_credentials(first);
        assert!(h.connector.calls().is_empty());
        h.write_credentials(second);
        assert_eq!(
            h.connector.calls(),
            vec![Call::Connect("Lab".into(), "pw123456".into())]
        );
    }

    #[tokio::test]
    async fn test_run_loop_until_shutdown() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let session = ProvisioningSession::new(
            SessionConfig::default(),
            RecordingConnector::default(),
            event_tx.clone(),
            outbound_tx,
        );
        let task = tokio::spawn(session.run(event_rx));

        event_tx.send(SessionEvent::StartAdvertising).unwrap();
        event_tx.send(SessionEvent::Shutdown).unwrap();
        task.await.unwrap();

        assert_eq!(outbound_rx.recv().await, Some(Outbound::Advertise(true)));
        assert_eq!(outbound_rx.recv().await, Some(Outbound::Advertise(false)));
    }
}

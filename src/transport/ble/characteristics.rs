//! BLE characteristic handlers

use std::collections::HashMap;
use std::sync::Arc;

use bluer::{
    Address,
    gatt::{
        WriteOp,
        local::{CharacteristicNotifier, ReqError},
    },
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::core::{
    event::{SessionEvent, WriteRequest, WriteResponse},
    types::{CharacteristicId, NotifyChannel},
};

use super::session::{BleSession, peer_id};

const CCCD_NOTIFY: [u8; 2] = [0x01, 0x00];
const CCCD_DISABLED: [u8; 2] = [0x00, 0x00];

/// Open notification sessions keyed by characteristic
#[derive(Debug, Clone, Default)]
pub struct NotifierHub {
    sinks: Arc<Mutex<HashMap<NotifyChannel, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl NotifierHub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, channel: NotifyChannel) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().await.insert(channel, tx);
        rx
    }

    async fn close(&self, channel: NotifyChannel) {
        self.sinks.lock().await.remove(&channel);
    }

    pub async fn is_open(&self, channel: NotifyChannel) -> bool {
        self.sinks.lock().await.contains_key(&channel)
    }

    /// Queue a value for the subscribed central; `false` when nobody listens
    pub async fn send(&self, channel: NotifyChannel, value: Vec<u8>) -> bool {
        let mut sinks = self.sinks.lock().await;
        match sinks.get(&channel) {
            Some(tx) if tx.send(value).is_ok() => true,
            Some(_) => {
                sinks.remove(&channel);
                false
            }
            None => false,
        }
    }
}

/// Translates GATT requests into session events
#[derive(Debug, Clone)]
pub struct CharacteristicHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
    links: Arc<Mutex<BleSession>>,
    notifiers: NotifierHub,
}

impl CharacteristicHandler {
    pub fn new(
        events: mpsc::UnboundedSender<SessionEvent>,
        links: Arc<Mutex<BleSession>>,
        notifiers: NotifierHub,
    ) -> Self {
        Self {
            events,
            links,
            notifiers,
        }
    }

    fn forward(&self, event: SessionEvent) -> Result<(), ReqError> {
        self.events.send(event).map_err(|_| {
            error!("Provisioning session is gone");
            ReqError::Failed
        })
    }

    async fn observe_mtu(&self, device: Address, mtu: u16) -> Result<(), ReqError> {
        let changed = self.links.lock().await.observe_mtu(device, mtu);
        match changed {
            Some(event) => self.forward(event),
            None => Ok(()),
        }
    }

    /// Handle a write on a writable characteristic
    pub async fn handle_write(
        &self,
        device: Address,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        op: WriteOp,
        mtu: u16,
    ) -> Result<(), ReqError> {
        self.observe_mtu(device, mtu).await?;

        let needs_response = !matches!(op, WriteOp::Command);
        debug!(
            ?characteristic,
            len = value.len(),
            needs_response,
            "Write received"
        );

        let request = WriteRequest::new(peer_id(device), characteristic, value, needs_response);
        if !needs_response {
            return self.forward(SessionEvent::Write(request));
        }

        let (tx, rx) = oneshot::channel();
        self.forward(SessionEvent::Write(request.with_reply(tx)))?;
        match rx.await {
            Ok(WriteResponse::Ack | WriteResponse::PreparedEcho { .. }) => Ok(()),
            Ok(WriteResponse::NotPermitted) => {
                warn!(?characteristic, "Write not permitted");
                Err(ReqError::NotPermitted)
            }
            Err(_) => Err(ReqError::Failed),
        }
    }

    /// Handle a read of the State or Status characteristic
    pub async fn handle_read(
        &self,
        device: Address,
        characteristic: CharacteristicId,
        mtu: u16,
    ) -> Result<Vec<u8>, ReqError> {
        self.observe_mtu(device, mtu).await?;

        let (tx, rx) = oneshot::channel();
        self.forward(SessionEvent::Read {
            characteristic,
            reply: tx,
        })?;
        let value = rx.await.map_err(|_| ReqError::Failed)?;
        debug!(?characteristic, len = value.len(), "Read served");
        Ok(value)
    }

    /// Open a notification session; equivalent to the central enabling the CCCD
    pub async fn subscribe(
        &self,
        channel: NotifyChannel,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, ReqError> {
        let values = self.notifiers.open(channel).await;
        self.forward(SessionEvent::Write(WriteRequest::cccd(
            channel,
            CCCD_NOTIFY.to_vec(),
        )))?;
        Ok(values)
    }

    /// Close a notification session
    pub async fn unsubscribe(&self, channel: NotifyChannel) {
        self.notifiers.close(channel).await;
        let _ = self.forward(SessionEvent::Write(WriteRequest::cccd(
            channel,
            CCCD_DISABLED.to_vec(),
        )));
    }

    /// Pump session notifications into a BlueZ notifier until the central stops
    pub async fn serve_notifications(
        &self,
        channel: NotifyChannel,
        mut notifier: CharacteristicNotifier,
    ) {
        let Ok(mut values) = self.subscribe(channel).await else {
            return;
        };
        debug!(?channel, "Notification session started");

        loop {
            tokio::select! {
                value = values.recv() => match value {
                    Some(value) => {
                        if let Err(e) = notifier.notify(value).await {
                            warn!(?channel, "Notification failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                _ = notifier.stopped() => break,
            }
        }

        self.unsubscribe(channel).await;
        debug!(?channel, "Notification session stopped");
    }
}

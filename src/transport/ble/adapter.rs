//! BLE adapter management

use std::sync::Arc;

use bluer::{
    Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty,
    adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType},
    agent::{Agent, AgentHandle, ReqError as AgentError, RequestAuthorization},
    gatt::local::ApplicationHandle,
};
use futures::StreamExt;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::core::{
    error::TransportResult,
    event::{Outbound, SessionEvent},
    types::PeerId,
};

use super::{
    characteristics::{CharacteristicHandler, NotifierHub},
    gatt::GattServer,
    session::{BleSession, address, peer_id},
    uuids::{ATT_MTU_TARGET, PROVISIONING_SERVICE_UUID},
};

/// BLE transport adapter
///
/// Feeds link, pairing and GATT activity into the provisioning session and
/// performs the [`Outbound`] requests it emits.
pub struct BleAdapter {
    session: bluer::Session,
    adapter: Adapter,
    device_name: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    links: Arc<Mutex<BleSession>>,
    notifiers: NotifierHub,
    agent: Option<AgentHandle>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    monitor: Option<JoinHandle<()>>,
}

impl BleAdapter {
    /// Open the default adapter
    pub async fn new(
        device_name: String,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> TransportResult<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;

        info!("Using BLE adapter: {}", adapter.name());

        Ok(Self {
            session,
            adapter,
            device_name,
            events,
            links: Arc::new(Mutex::new(BleSession::new())),
            notifiers: NotifierHub::new(),
            agent: None,
            application: None,
            advertisement: None,
            monitor: None,
        })
    }

    /// Power up, register the pairing agent and the GATT application
    pub async fn start(&mut self) -> TransportResult<()> {
        info!("Starting BLE adapter");

        self.adapter.set_powered(true).await?;
        self.adapter.set_alias(self.device_name.clone()).await?;
        self.adapter.set_pairable(true).await?;

        self.agent = Some(self.session.register_agent(self.build_agent()).await?);

        let handler = CharacteristicHandler::new(
            self.events.clone(),
            self.links.clone(),
            self.notifiers.clone(),
        );
        self.application = Some(GattServer::new(handler).register(&self.adapter).await?);

        self.monitor = Some(tokio::spawn(monitor_devices(
            self.adapter.clone(),
            self.links.clone(),
            self.events.clone(),
        )));

        info!(
            name = %self.device_name,
            mtu_target = ATT_MTU_TARGET,
            "BLE adapter started"
        );
        Ok(())
    }

    /// Just Works agent; the session's security gate answers each request
    fn build_agent(&self) -> Agent {
        let events = self.events.clone();
        Agent {
            request_default: true,
            request_authorization: Some(Box::new(move |req: RequestAuthorization| {
                let events = events.clone();
                Box::pin(async move { authorize(&events, req.device).await })
            })),
            ..Default::default()
        }
    }

    /// Perform session side effects until the session closes its channel
    pub async fn run(&mut self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        info!("BLE event loop started");

        while let Some(item) = outbound.recv().await {
            if let Err(e) = self.handle_outbound(item).await {
                error!("BLE request failed: {}", e);
            }
        }

        debug!("BLE event loop ended");
    }

    async fn handle_outbound(&mut self, item: Outbound) -> TransportResult<()> {
        match item {
            Outbound::Notify { channel, value } => {
                if !self.notifiers.send(channel, value).await {
                    debug!(?channel, "No notification session open");
                }
            }
            Outbound::Advertise(true) => self.advertise().await?,
            Outbound::Advertise(false) => {
                if self.advertisement.take().is_some() {
                    info!("BLE advertising stopped");
                }
            }
            Outbound::RequestSecurity(peer) => {
                tokio::spawn(secure_link(self.adapter.clone(), peer, self.events.clone()));
            }
        }
        Ok(())
    }

    async fn advertise(&mut self) -> TransportResult<()> {
        if self.advertisement.is_some() {
            return Ok(());
        }

        let adv = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [PROVISIONING_SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(self.device_name.clone()),
            ..Default::default()
        };
        self.advertisement = Some(self.adapter.advertise(adv).await?);

        info!(name = %self.device_name, "BLE advertising started");
        Ok(())
    }

    /// Tear down advertising, GATT, the agent and any remaining links
    pub async fn stop(&mut self) -> TransportResult<()> {
        info!("Stopping BLE adapter");

        self.advertisement = None;
        self.application = None;
        self.agent = None;
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        let linked: Vec<Address> = self.links.lock().await.linked().collect();
        for addr in linked {
            if let Err(e) = self.adapter.device(addr)?.disconnect().await {
                warn!(%addr, "Failed to disconnect: {}", e);
            }
        }

        self.adapter.set_pairable(false).await?;

        info!("BLE adapter stopped");
        Ok(())
    }
}

async fn authorize(
    events: &mpsc::UnboundedSender<SessionEvent>,
    device: Address,
) -> Result<(), AgentError> {
    let (tx, rx) = oneshot::channel();
    events
        .send(SessionEvent::SecurityRequest {
            peer: peer_id(device),
            reply: Some(tx),
        })
        .map_err(|_| AgentError::Rejected)?;

    match rx.await {
        Ok(true) => Ok(()),
        _ => Err(AgentError::Rejected),
    }
}

/// Pair with the central unless keys already exist and report the outcome
async fn secure_link(adapter: Adapter, peer: PeerId, events: mpsc::UnboundedSender<SessionEvent>) {
    let result = async {
        let device = adapter.device(address(peer))?;
        if !device.is_paired().await? {
            debug!(%peer, "Requesting pairing");
            if let Err(e) = device.pair().await {
                // The central may have started pairing itself.
                if !device.is_paired().await? {
                    return Err(e);
                }
            }
        }
        device.set_trusted(true).await?;
        Ok::<_, bluer::Error>(())
    }
    .await;

    let (success, reason) = match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };
    let _ = events.send(SessionEvent::PairingComplete {
        peer,
        success,
        reason,
    });
}

/// Follow device objects to learn about central connections
async fn monitor_devices(
    adapter: Adapter,
    links: Arc<Mutex<BleSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    if let Err(e) = run_monitor(adapter, links, events).await {
        error!("BLE device monitor failed: {}", e);
    }
}

async fn run_monitor(
    adapter: Adapter,
    links: Arc<Mutex<BleSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> TransportResult<()> {
    let mut watchers = JoinSet::new();

    let adapter_events = adapter.events().await?;
    tokio::pin!(adapter_events);

    for addr in adapter.device_addresses().await? {
        if links.lock().await.watch(addr) {
            watchers.spawn(watch_device(adapter.clone(), addr, links.clone(), events.clone()));
        }
    }

    while let Some(event) = adapter_events.next().await {
        match event {
            AdapterEvent::DeviceAdded(addr) => {
                if links.lock().await.watch(addr) {
                    watchers.spawn(watch_device(
                        adapter.clone(),
                        addr,
                        links.clone(),
                        events.clone(),
                    ));
                }
            }
            AdapterEvent::DeviceRemoved(addr) => {
                let mut links = links.lock().await;
                links.unwatch(addr);
                if let Some(event) = links.link_down(addr) {
                    let _ = events.send(event);
                }
            }
            AdapterEvent::PropertyChanged(_) => {}
        }
    }

    warn!("BLE adapter event stream ended");
    Ok(())
}

async fn watch_device(
    adapter: Adapter,
    addr: Address,
    links: Arc<Mutex<BleSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let result = async {
        let device = adapter.device(addr)?;
        let changes = device.events().await?;
        tokio::pin!(changes);

        if device.is_connected().await? {
            link_changed(&links, &events, addr, true).await;
        }

        while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
            match property {
                DeviceProperty::Connected(connected) => {
                    link_changed(&links, &events, addr, connected).await;
                }
                DeviceProperty::Paired(paired) => {
                    pairing_changed(&links, &events, addr, paired).await;
                }
                _ => {}
            }
        }
        Ok::<_, bluer::Error>(())
    }
    .await;

    if let Err(e) = result {
        debug!(%addr, "Stopped watching device: {}", e);
    }
    links.lock().await.unwatch(addr);
}

async fn link_changed(
    links: &Mutex<BleSession>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    addr: Address,
    connected: bool,
) {
    let mut links = links.lock().await;
    let event = if connected {
        links.link_up(addr)
    } else {
        links.link_down(addr)
    };
    if let Some(event) = event {
        let _ = events.send(event);
    }
}

async fn pairing_changed(
    links: &Mutex<BleSession>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    addr: Address,
    paired: bool,
) {
    if let Some(event) = links.lock().await.pairing_changed(addr, paired) {
        let _ = events.send(event);
    }
}

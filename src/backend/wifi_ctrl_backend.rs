//! wifi-ctrl backend implementation

use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use wifi_ctrl::sta::{Broadcast, BroadcastReceiver, RequestClient, WifiSetup};

use crate::{
    backend::{LinkOutcome, WifiBackend},
    core::{
        error::{WifiError, WifiResult},
        event::DisconnectReason,
    },
};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const BROADCAST_RECV_TIMEOUT: Duration = Duration::from_secs(1);
const IP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const IP_POLL_RETRIES: usize = 30; // 30 * 200ms = 6 seconds

/// IEEE 802.11 reason code 1, "unspecified"
const UNSPECIFIED_REASON: u16 = 1;

pub struct WifiCtrlBackend {
    interface: String,
    client: RequestClient,
    broadcast_receiver: BroadcastReceiver,
}

impl WifiCtrlBackend {
    pub async fn new(interface: String) -> WifiResult<Self> {
        let path = format!("/var/run/wpa_supplicant/{}", interface);
        let mut setup =
            WifiSetup::new().map_err(|e| WifiError::WpaSupplicantError(e.to_string()))?;
        setup.set_socket_path(path);

        let client = setup.get_request_client();
        let broadcast_receiver = setup.get_broadcast_receiver();
        let station = setup.complete();

        tokio::spawn(async move {
            if let Err(e) = station.run().await {
                error!("WifiStation runtime error: {}", e);
            }
        });

        Ok(Self {
            interface,
            client,
            broadcast_receiver,
        })
    }

    /// Get IP address using ip command
    async fn get_ip_address(&self) -> Option<String> {
        let output = Command::new("ip")
            .args(["-4", "addr", "show", &self.interface])
            .output()
            .await
            .ok()?;

        parse_inet_address(&String::from_utf8_lossy(&output.stdout))
    }

    async fn wait_for_ip(&self) -> Option<String> {
        for _ in 0..IP_POLL_RETRIES {
            if let Some(ip) = self.get_ip_address().await {
                return Some(ip);
            }
            tokio::time::sleep(IP_POLL_INTERVAL).await;
        }
        None
    }

    async fn add_network(&self, ssid: &str, passphrase: &str) -> WifiResult<usize> {
        let network_id =
            self.client.add_network().await.map_err(|e| {
                WifiError::WpaSupplicantError(format!("Failed to add network: {}", e))
            })?;

        // wifi-ctrl handles quoting internally via conf_escape
        self.client
            .set_network_ssid(network_id, ssid.to_string())
            .await
            .map_err(|e| WifiError::WpaSupplicantError(format!("Failed to set SSID: {}", e)))?;

        if passphrase.is_empty() {
            self.client
                .send_custom(format!("SET_NETWORK {network_id} key_mgmt NONE"))
                .await
                .map_err(|e| {
                    WifiError::WpaSupplicantError(format!("Failed to set key_mgmt: {}", e))
                })?;
        } else {
            self.client
                .set_network_psk(network_id, passphrase.to_string())
                .await
                .map_err(|e| {
                    WifiError::WpaSupplicantError(format!("Failed to set passphrase: {}", e))
                })?;
        }

        self.client.select_network(network_id).await.map_err(|e| {
            WifiError::WpaSupplicantError(format!("Failed to select network: {}", e))
        })?;

        Ok(network_id)
    }

    async fn remove_network(&self, network_id: usize) {
        if let Err(e) = self
            .client
            .send_custom(format!("REMOVE_NETWORK {network_id}"))
            .await
        {
            warn!("Failed to remove network {}: {}", network_id, e);
        }
    }
}

fn parse_inet_address(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("inet "))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|cidr| cidr.split('/').next())
        .map(str::to_string)
}

impl WifiBackend for WifiCtrlBackend {
    async fn connect(&self, ssid: &str, passphrase: &str) -> WifiResult<LinkOutcome> {
        debug!("Connecting to network: {}", ssid);

        // Subscribe before select_network
        let mut receiver = self.broadcast_receiver.resubscribe();
        let network_id = self.add_network(ssid, passphrase).await?;

        let start = Instant::now();
        let outcome = loop {
            if start.elapsed() > CONNECTION_TIMEOUT {
                break LinkOutcome::Disconnected(DisconnectReason::Other(UNSPECIFIED_REASON));
            }

            match tokio::time::timeout(BROADCAST_RECV_TIMEOUT, receiver.recv()).await {
                Ok(Ok(event)) => {
                    debug!("Received broadcast event: {:?}", event);
                    match event {
                        Broadcast::Connected => {
                            if let Err(e) = self.client.save_config().await {
                                warn!("Failed to save wpa_supplicant config: {}", e);
                            }

                            break match self.wait_for_ip().await {
                                Some(ip) => LinkOutcome::Connected { ip },
                                None => {
                                    warn!("Associated but no IPv4 address assigned");
                                    LinkOutcome::Disconnected(DisconnectReason::Other(
                                        UNSPECIFIED_REASON,
                                    ))
                                }
                            };
                        }
                        Broadcast::WrongPsk => {
                            break LinkOutcome::Disconnected(DisconnectReason::AuthFailed);
                        }
                        Broadcast::NetworkNotFound => {
                            break LinkOutcome::Disconnected(DisconnectReason::NoApFound);
                        }
                        // Also seen as the initial disconnect before associating
                        Broadcast::Disconnected => {}
                        _ => {}
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    warn!("Broadcast receiver lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    self.remove_network(network_id).await;
                    return Err(WifiError::WpaSupplicantError(
                        "Broadcast channel closed".to_string(),
                    ));
                }
                Err(_) => {}
            }
        };

        match &outcome {
            LinkOutcome::Connected { ip } => info!("Connected to {} with address {}", ssid, ip),
            LinkOutcome::Disconnected(reason) => {
                debug!("Attempt failed with reason {}", reason.code());
                self.remove_network(network_id).await;
            }
        }
        Ok(outcome)
    }

    async fn disconnect(&self) -> WifiResult<()> {
        debug!("Disconnecting");
        self.client
            .send_custom("DISCONNECT".to_string())
            .await
            .map_err(|e| WifiError::WpaSupplicantError(format!("Failed to disconnect: {}", e)))?;

        Ok(())
    }

}

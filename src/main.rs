//! BLE WiFi Provisioning Service - Main Entry Point

use std::sync::Arc;

use ble_wifi_provisioning::{
    ProvisioningService,
    backend::{FileCredentialStore, WifiCtrlBackend},
    config::{CliArgs, Settings},
    transport::ble::BleAdapter,
};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ble_wifi_provisioning=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    info!(?args, "Starting BLE WiFi provisioning service");
    let settings = Settings::from(args);

    let backend = Arc::new(WifiCtrlBackend::new(settings.interface.clone()).await?);
    info!("WiFi backend initialized for interface: {}", settings.interface);
    let store = Arc::new(FileCredentialStore::new(settings.credentials_path.clone()));

    let (service, outbound) = ProvisioningService::start_with_retry_delay(
        backend,
        store,
        settings.session_config(),
        settings.retry_delay,
    );

    if settings.clear_credentials {
        service.clear_stored_credentials().await?;
        info!(path = %settings.credentials_path.display(), "Stored credentials cleared");
        service.shutdown().await;
        return Ok(());
    }

    if !settings.force_provisioning && try_stored_credentials(&service, &settings).await {
        notify_ready();
        service.shutdown().await;
        return Ok(());
    }

    let mut adapter = BleAdapter::new(settings.device_name.clone(), service.events()).await?;
    adapter.start().await?;
    let ble_task = tokio::spawn(async move {
        adapter.run(outbound).await;
        if let Err(e) = adapter.stop().await {
            error!("BLE teardown failed: {}", e);
        }
    });

    service.start_advertising()?;
    notify_ready();
    info!("Waiting for credentials over BLE");

    tokio::select! {
        result = service.wait_provisioned() => {
            let snapshot = result?;
            info!(ip = %snapshot.message, "Provisioning complete");
            // Let the final notifications reach the central before the link goes away.
            tokio::time::sleep(settings.provisioned_grace).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        }
        _ = shutdown_signal() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
    }

    info!("Shutting down...");
    service.shutdown().await;
    let _ = ble_task.await;
    Ok(())
}

/// Connect with persisted credentials; `true` when no BLE session is needed
async fn try_stored_credentials(service: &ProvisioningService, settings: &Settings) -> bool {
    let credentials = match service.stored_credentials().await {
        Ok(Some(credentials)) => credentials,
        Ok(None) => {
            info!("No stored credentials, starting BLE provisioning");
            return false;
        }
        Err(e) => {
            warn!("Failed to load stored credentials: {}", e);
            return false;
        }
    };

    info!(ssid = %credentials.network_name(), "Trying stored credentials");
    match service
        .connect_stored(credentials, settings.stored_connect_timeout)
        .await
    {
        Ok(true) => true,
        Ok(false) => {
            info!("Stored credentials did not connect, starting BLE provisioning");
            false
        }
        Err(e) => {
            error!("Stored connection failed: {}", e);
            false
        }
    }
}

#[cfg(feature = "systemd")]
fn notify_ready() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!("Failed to notify systemd: {}", e);
    }
}

#[cfg(not(feature = "systemd"))]
fn notify_ready() {}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await
}

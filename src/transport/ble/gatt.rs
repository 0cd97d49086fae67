//! GATT server implementation

use bluer::{
    Adapter,
    gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, Service,
    },
};
use tracing::info;
use uuid::Uuid;

use crate::core::types::{CharacteristicId, NotifyChannel};

use super::{characteristics::CharacteristicHandler, uuids::*};

/// GATT server exposing the provisioning service
pub struct GattServer {
    handler: CharacteristicHandler,
}

impl GattServer {
    pub fn new(handler: CharacteristicHandler) -> Self {
        Self { handler }
    }

    /// Build the GATT application
    pub fn build_application(&self) -> Application {
        Application {
            services: vec![self.build_provisioning_service()],
            ..Default::default()
        }
    }

    fn build_provisioning_service(&self) -> Service {
        Service {
            uuid: PROVISIONING_SERVICE_UUID,
            primary: true,
            characteristics: vec![
                self.build_notify_characteristic(STATE_CHAR_UUID, NotifyChannel::State),
                self.build_credentials_characteristic(),
                self.build_notify_characteristic(STATUS_CHAR_UUID, NotifyChannel::Status),
            ],
            ..Default::default()
        }
    }

    /// Encrypted write / write-without-response sink for credential fragments
    fn build_credentials_characteristic(&self) -> Characteristic {
        let handler = self.handler.clone();
        Characteristic {
            uuid: CREDENTIALS_CHAR_UUID,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                encrypt_write: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |new_value, req| {
                    let handler = handler.clone();
                    Box::pin(async move {
                        handler
                            .handle_write(
                                req.device_address,
                                CharacteristicId::Credentials,
                                new_value,
                                req.op_type,
                                req.mtu,
                            )
                            .await
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Encrypted read + notify characteristic backed by the session snapshot
    fn build_notify_characteristic(
        &self,
        uuid: Uuid,
        channel: NotifyChannel,
    ) -> Characteristic {
        let characteristic = match channel {
            NotifyChannel::State => CharacteristicId::State,
            NotifyChannel::Status => CharacteristicId::Status,
        };

        Characteristic {
            uuid,
            read: Some(CharacteristicRead {
                read: true,
                encrypt_read: true,
                fun: {
                    let handler = self.handler.clone();
                    Box::new(move |req| {
                        let handler = handler.clone();
                        Box::pin(async move {
                            handler
                                .handle_read(req.device_address, characteristic, req.mtu)
                                .await
                        })
                    })
                },
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun({
                    let handler = self.handler.clone();
                    Box::new(move |notifier| {
                        let handler = handler.clone();
                        Box::pin(async move {
                            tokio::spawn(async move {
                                handler.serve_notifications(channel, notifier).await;
                            });
                        })
                    })
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Register GATT application with adapter
    pub async fn register(&self, adapter: &Adapter) -> Result<ApplicationHandle, bluer::Error> {
        info!("Registering GATT application");
        let handle = adapter
            .serve_gatt_application(self.build_application())
            .await?;
        info!(service = %PROVISIONING_SERVICE_UUID, "GATT application registered");
        Ok(handle)
    }
}

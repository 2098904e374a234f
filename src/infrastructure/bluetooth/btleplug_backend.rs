//! [`BlePlatform`] on top of `btleplug`, using the first system adapter.

use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::bluetooth::error::PlatformError;
use crate::infrastructure::bluetooth::platform::{
    AdvertisementStream, BlePlatform, NotificationStream, PlatformResult,
};
use crate::infrastructure::bluetooth::protocol::GattProfile;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

type PeripheralCache = Arc<Mutex<HashMap<String, Peripheral>>>;

pub struct BtleplugPlatform {
    adapter: Adapter,
    peripherals: PeripheralCache,
}

impl BtleplugPlatform {
    pub async fn new() -> PlatformResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| PlatformError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| PlatformError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::AdapterUnavailable("no Bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn peripheral(&self, device_id: &str) -> PlatformResult<Peripheral> {
        if let Some(peripheral) = lock(&self.peripherals).get(device_id) {
            return Ok(peripheral.clone());
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| map_error(e, device_id))?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| PlatformError::DeviceNotFound(device_id.to_string()))?;

        lock(&self.peripherals).insert(device_id.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    async fn data_characteristic(
        &self,
        device_id: &str,
        uuid: &Uuid,
    ) -> PlatformResult<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *uuid)
            .ok_or(PlatformError::CharacteristicNotFound(*uuid))?;
        Ok((peripheral, characteristic))
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn ensure_ready(&self) -> PlatformResult<()> {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => Ok(()),
            Ok(CentralState::PoweredOff) => Err(PlatformError::AdapterUnavailable(
                "Bluetooth is powered off".into(),
            )),
            Ok(state) => {
                debug!("Adapter state {:?}, proceeding", state);
                Ok(())
            }
            Err(e) => Err(map_error(e, "adapter")),
        }
    }

    async fn start_scan(&self) -> PlatformResult<AdvertisementStream> {
        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| map_error(e, "adapter"))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| map_error(e, "adapter"))?;

        let adapter = self.adapter.clone();
        let cache = self.peripherals.clone();
        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let cache = cache.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                let key = peripheral.id().to_string();
                lock(&cache).insert(key.clone(), peripheral);

                Some(DeviceDescriptor {
                    id: key,
                    name: properties.local_name,
                    service_uuids: properties.services.into_iter().collect(),
                    rssi: properties.rssi,
                })
            }
        });

        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| map_error(e, "adapter"))
    }

    async fn connect(&self, device_id: &str) -> PlatformResult<()> {
        let peripheral = self.peripheral(device_id).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("{} already connected", device_id);
            return Ok(());
        }
        peripheral
            .connect()
            .await
            .map_err(|e| map_error(e, device_id))
    }

    async fn discover(&self, device_id: &str, profile: &GattProfile) -> PlatformResult<()> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| map_error(e, device_id))?;

        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == profile.service_uuid)
            .ok_or(PlatformError::ServiceNotFound(profile.service_uuid))?;
        if !service
            .characteristics
            .iter()
            .any(|c| c.uuid == profile.data_char_uuid)
        {
            return Err(PlatformError::CharacteristicNotFound(profile.data_char_uuid));
        }
        debug!(
            "{} exposes {} service(s); data characteristic present",
            device_id,
            services.len()
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        profile: &GattProfile,
    ) -> PlatformResult<NotificationStream> {
        let (peripheral, characteristic) = self
            .data_characteristic(device_id, &profile.data_char_uuid)
            .await?;

        // The notification stream does not always end when the link drops;
        // adapter events do.
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| map_error(e, device_id))?;
        let peripheral_id = peripheral.id();
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Device {:?} disconnected", id);
                        break;
                    }
                }
            }
        };

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| map_error(e, device_id))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| map_error(e, device_id))?;

        let data_uuid = characteristic.uuid;
        let values = notifications
            .filter_map(move |n| async move { (n.uuid == data_uuid).then_some(n.value) })
            .take_until(disconnected);
        Ok(values.boxed())
    }

    async fn unsubscribe(&self, device_id: &str, characteristic: &Uuid) -> PlatformResult<()> {
        let (peripheral, characteristic) =
            self.data_characteristic(device_id, characteristic).await?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(|e| map_error(e, device_id))
    }

    async fn disconnect(&self, device_id: &str) -> PlatformResult<()> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| map_error(e, device_id))
    }

    async fn shutdown(&self) -> PlatformResult<()> {
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Stopping scan on shutdown failed: {}", e);
        }
        lock(&self.peripherals).clear();
        Ok(())
    }
}

fn lock(cache: &Mutex<HashMap<String, Peripheral>>) -> MutexGuard<'_, HashMap<String, Peripheral>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn map_error(error: btleplug::Error, device_id: &str) -> PlatformError {
    match error {
        btleplug::Error::PermissionDenied => PlatformError::PermissionDenied,
        btleplug::Error::DeviceNotFound => PlatformError::DeviceNotFound(device_id.to_string()),
        btleplug::Error::TimedOut(after) => PlatformError::Timeout(after),
        other => PlatformError::Backend(other.to_string()),
    }
}

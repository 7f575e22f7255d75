use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use super::identity::DeviceIdentity;
use super::protocol::CONTROL_SERVICE_UUID;
use super::transport::{
    Capabilities, Channel, DiscoveredDevice, Link, NotificationStream, Transport,
};
use crate::error::TransportError;

const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const DISCOVER_SERVICES_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// BLE transport backed by the first Bluetooth adapter of the system.
pub struct BtleTransport {
    manager: Manager,
    capabilities: Capabilities,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        Ok(Self {
            manager: Manager::new().await?,
            capabilities: Capabilities::for_current_platform(),
        })
    }

    async fn adapter(&self) -> Result<Adapter, TransportError> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)
    }
}

#[async_trait]
impl Transport for BtleTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn scan(
        &self,
        address: Option<&str>,
        scan_timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let central = self.adapter().await?;

        log::info!("Starting BLE scan for Linak desks...");
        central.start_scan(ScanFilter::default()).await?;
        sleep(scan_timeout).await;
        let peripherals = central.peripherals().await;
        central.stop_scan().await?;
        let peripherals = peripherals?;
        log::info!("Found {} BLE devices", peripherals.len());

        let mut found = Vec::new();
        for peripheral in peripherals {
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                Ok(None) => {
                    log::debug!("Peripheral has no properties");
                    continue;
                }
                Err(e) => {
                    log::debug!("Failed to get peripheral properties: {}", e);
                    continue;
                }
            };

            let p_addr = props.address.to_string();
            if let Some(addr) = address {
                if !p_addr.eq_ignore_ascii_case(addr) {
                    log::debug!("Skipping peripheral with address: {}", p_addr);
                    continue;
                }
            }

            let handle = match serde_json::to_value(peripheral.id()) {
                Ok(handle) => handle,
                Err(e) => {
                    log::debug!("Peripheral handle not serializable: {}", e);
                    serde_json::Value::Null
                }
            };
            log::info!(
                "Found device {} ({})",
                props.local_name.as_deref().unwrap_or("NONE"),
                p_addr
            );
            found.push(DiscoveredDevice {
                name: props.local_name,
                identity: DeviceIdentity::new(p_addr, handle),
            });
        }

        if address.is_some() && !found.is_empty() {
            log::info!("Waiting for BLE stack to settle after scan...");
            sleep(SCAN_SETTLE_DELAY).await;
        }
        Ok(found)
    }

    async fn connect(
        &self,
        identity: &DeviceIdentity,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let central = self.adapter().await?;
        let id: PeripheralId = serde_json::from_value(identity.handle.clone())
            .map_err(|e| TransportError::UnknownDevice(e.to_string()))?;
        let peripheral = central.peripheral(&id).await?;

        let link = BtleLink::open(&central, peripheral, identity.clone(), connect_timeout).await?;
        Ok(Arc::new(link))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Open,
    Closed,
    Lost,
}

/// A connected desk.
pub struct BtleLink {
    identity: DeviceIdentity,
    peripheral: Peripheral,
    characteristics: HashMap<Channel, Characteristic>,
    subscribers: Mutex<HashMap<Channel, usize>>,
    status: Arc<watch::Sender<LinkStatus>>,
    events: JoinHandle<()>,
}

impl BtleLink {
    async fn open(
        central: &Adapter,
        peripheral: Peripheral,
        identity: DeviceIdentity,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let is_connected = timeout(STATUS_CHECK_TIMEOUT, peripheral.is_connected())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connection status check",
                after: STATUS_CHECK_TIMEOUT,
            })??;

        if !is_connected {
            log::info!("Desk not connected, establishing connection...");
            match timeout(connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => log::info!("Bluetooth connection established successfully"),
                Ok(Err(e)) => {
                    log::error!("Bluetooth connection failed: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    log::error!(
                        "Bluetooth connection timed out after {} seconds",
                        connect_timeout.as_secs()
                    );
                    return Err(TransportError::Timeout {
                        operation: "connect",
                        after: connect_timeout,
                    });
                }
            }
        } else {
            log::info!("Desk already connected");
        }

        log::info!("Discovering desk services and characteristics...");
        timeout(DISCOVER_SERVICES_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "service discovery",
                after: DISCOVER_SERVICES_TIMEOUT,
            })??;

        let chars = peripheral.characteristics();
        log::debug!("Found {} characteristics total", chars.len());
        if !chars.iter().any(|c| c.service_uuid == CONTROL_SERVICE_UUID) {
            log::warn!("Control service {} not advertised by desk", CONTROL_SERVICE_UUID);
        }

        let uuids: Vec<Uuid> = chars.iter().map(|c| c.uuid).collect();
        if let Some(channel) = missing_channel(&uuids) {
            log::error!("Available characteristics: {:?}", uuids);
            if let Err(e) = peripheral.disconnect().await {
                log::debug!("Disconnect after failed discovery failed: {}", e);
            }
            return Err(TransportError::MissingCharacteristic(channel.uuid()));
        }
        let characteristics: HashMap<Channel, Characteristic> = CHANNELS
            .iter()
            .filter_map(|&channel| {
                chars
                    .iter()
                    .find(|c| c.uuid == channel.uuid())
                    .map(|c| (channel, c.clone()))
            })
            .collect();

        let (status, _) = watch::channel(LinkStatus::Open);
        let status = Arc::new(status);
        let events = watch_disconnects(central, peripheral.id(), Arc::clone(&status)).await?;

        log::info!("Desk link to {} ready", identity.address);
        Ok(Self {
            identity,
            peripheral,
            characteristics,
            subscribers: Mutex::new(HashMap::new()),
            status,
            events,
        })
    }

    fn characteristic(&self, channel: Channel) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&channel)
            .ok_or(TransportError::MissingCharacteristic(channel.uuid()))
    }

    fn is_open(&self) -> bool {
        *self.status.borrow() == LinkStatus::Open
    }
}

const CHANNELS: [Channel; 3] = [Channel::Position, Channel::Command, Channel::ReferenceInput];

/// First channel the desk did not expose, if any.
fn missing_channel(uuids: &[Uuid]) -> Option<Channel> {
    CHANNELS
        .into_iter()
        .find(|channel| !uuids.contains(&channel.uuid()))
}

async fn watch_disconnects(
    central: &Adapter,
    id: PeripheralId,
    status: Arc<watch::Sender<LinkStatus>>,
) -> Result<JoinHandle<()>, TransportError> {
    let mut events = central.events().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone != id {
                    continue;
                }
                status.send_if_modified(|s| {
                    if *s == LinkStatus::Open {
                        *s = LinkStatus::Lost;
                        true
                    } else {
                        false
                    }
                });
                break;
            }
        }
    }))
}

#[async_trait]
impl Link for BtleLink {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    async fn is_connected(&self) -> bool {
        self.is_open() && self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(channel)?;
        let data = self.peripheral.read(characteristic).await?;
        log::debug!("Read {} bytes from {:?}: {:02X?}", data.len(), channel, data);
        Ok(data)
    }

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        self.peripheral
            .write(characteristic, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<NotificationStream, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let characteristic = self.characteristic(channel)?;
        let uuid = characteristic.uuid;

        {
            let mut counts = self.subscribers.lock().await;
            let count = counts.entry(channel).or_insert(0);
            if *count == 0 {
                log::debug!("Subscribing to characteristic {}", uuid);
                self.peripheral.subscribe(characteristic).await?;
            }
            *count += 1;
        }

        let notifications = self.peripheral.notifications().await?;
        let mut status = self.status.subscribe();
        let ended = async move {
            while *status.borrow_and_update() == LinkStatus::Open {
                if status.changed().await.is_err() {
                    break;
                }
            }
        };

        Ok(notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| n.value)
            .take_until(ended)
            .boxed())
    }

    async fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        let mut counts = self.subscribers.lock().await;
        let Some(count) = counts.get_mut(&channel) else {
            return Ok(());
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&channel);
            if self.is_open() {
                log::debug!("Unsubscribing from characteristic {}", characteristic.uuid);
                self.peripheral.unsubscribe(characteristic).await?;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.status.send_replace(LinkStatus::Closed);
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn disconnected(&self) {
        let mut status = self.status.subscribe();
        while *status.borrow_and_update() != LinkStatus::Lost {
            if status.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.events.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desk::protocol::{
        CONTROL_CHARACTERISTIC_UUID, HEIGHT_CHARACTERISTIC_UUID, REFERENCE_INPUT_UUID,
    };

    #[test]
    fn test_all_characteristics_present() {
        let uuids = [
            CONTROL_SERVICE_UUID,
            REFERENCE_INPUT_UUID,
            HEIGHT_CHARACTERISTIC_UUID,
            CONTROL_CHARACTERISTIC_UUID,
        ];
        assert_eq!(missing_channel(&uuids), None);
    }

    #[test]
    fn test_missing_characteristic_is_reported() {
        assert_eq!(
            missing_channel(&[HEIGHT_CHARACTERISTIC_UUID, CONTROL_CHARACTERISTIC_UUID]),
            Some(Channel::ReferenceInput)
        );
        assert_eq!(missing_channel(&[]), Some(Channel::Position));
    }
}

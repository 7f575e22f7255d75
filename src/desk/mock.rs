//! In-memory transport for driving the connection and motion logic in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;

use super::identity::DeviceIdentity;
use super::protocol::TelemetrySample;
use super::transport::{
    Capabilities, Channel, DiscoveredDevice, Link, NotificationStream, Transport,
};
use crate::error::TransportError;

pub const ADDRESS: &str = "E8:5B:5B:24:22:E4";

pub struct MockTransport {
    capabilities: Capabilities,
    devices: Vec<DiscoveredDevice>,
    connect_script: Mutex<VecDeque<bool>>,
    connects: Mutex<Vec<DeviceIdentity>>,
    scans: AtomicUsize,
    links: Mutex<Vec<Arc<MockLink>>>,
    initial: Mutex<TelemetrySample>,
}

impl MockTransport {
    fn build(capabilities: Capabilities, devices: Vec<DiscoveredDevice>) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            devices,
            connect_script: Mutex::new(VecDeque::new()),
            connects: Mutex::new(Vec::new()),
            scans: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            initial: Mutex::new(TelemetrySample::from_raw(0, 0)),
        })
    }

    fn desk() -> DiscoveredDevice {
        DiscoveredDevice {
            name: Some("Desk 1234".to_string()),
            identity: DeviceIdentity::new(ADDRESS, json!("hci0/dev_E8_5B_5B_24_22_E4")),
        }
    }

    fn full_capabilities() -> Capabilities {
        Capabilities {
            rehydrate_identity: true,
            reference_input: true,
        }
    }

    pub fn with_desk() -> Arc<Self> {
        Self::build(Self::full_capabilities(), vec![Self::desk()])
    }

    pub fn with_desk_without_rehydration() -> Arc<Self> {
        Self::build(
            Capabilities {
                rehydrate_identity: false,
                reference_input: false,
            },
            vec![Self::desk()],
        )
    }

    pub fn with_devices(devices: Vec<DiscoveredDevice>) -> Arc<Self> {
        Self::build(Self::full_capabilities(), devices)
    }

    pub fn empty() -> Arc<Self> {
        Self::build(Self::full_capabilities(), Vec::new())
    }

    pub fn desk_identity(&self) -> DeviceIdentity {
        Self::desk().identity
    }

    /// Outcomes for the next connect calls; unscripted calls succeed.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.connect_script.lock().unwrap().extend(outcomes);
    }

    /// Position links report on their first read.
    pub fn set_initial_position(&self, position_raw: u16) {
        *self.initial.lock().unwrap() = TelemetrySample::from_raw(position_raw, 0);
    }

    pub fn connect_attempts(&self) -> Vec<DeviceIdentity> {
        self.connects.lock().unwrap().clone()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        self.links.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn scan(
        &self,
        address: Option<&str>,
        _timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .iter()
            .filter(|d| address.map_or(true, |a| d.address() == a))
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Arc<dyn Link>, TransportError> {
        self.connects.lock().unwrap().push(identity.clone());
        let succeed = self.connect_script.lock().unwrap().pop_front().unwrap_or(true);
        if !succeed {
            return Err(TransportError::Timeout {
                operation: "connect",
                after: timeout,
            });
        }

        let link = Arc::new(MockLink::new(identity.clone(), *self.initial.lock().unwrap()));
        self.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

pub struct MockLink {
    identity: DeviceIdentity,
    open: AtomicBool,
    lost: watch::Sender<bool>,
    position: Mutex<TelemetrySample>,
    writes: Mutex<Vec<(Channel, Vec<u8>)>>,
    subscribers: Mutex<Vec<UnboundedSender<Vec<u8>>>>,
    subscriptions: AtomicUsize,
    unsubscriptions: AtomicUsize,
    fail_writes_from: Mutex<Option<usize>>,
}

impl MockLink {
    fn new(identity: DeviceIdentity, position: TelemetrySample) -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            identity,
            open: AtomicBool::new(true),
            lost,
            position: Mutex::new(position),
            writes: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            subscriptions: AtomicUsize::new(0),
            unsubscriptions: AtomicUsize::new(0),
            fail_writes_from: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Deliver a position notification to every subscriber.
    pub fn notify(&self, position_raw: u16, speed_raw: i16) {
        let sample = TelemetrySample::from_raw(position_raw, speed_raw);
        *self.position.lock().unwrap() = sample;
        let frame = sample.encode().to_vec();
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.unbounded_send(frame.clone()).is_ok());
    }

    /// Simulate the desk going out of range.
    pub fn drop_link(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.subscribers.lock().unwrap().clear();
            self.lost.send_replace(true);
        }
    }

    /// Writes starting with the `n`th (0-based) fail.
    pub fn fail_writes_from(&self, n: usize) {
        *self.fail_writes_from.lock().unwrap() = Some(n);
    }

    pub fn writes(&self) -> Vec<(Channel, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Command-channel codes written so far.
    pub fn commands(&self) -> Vec<u16> {
        self.writes()
            .into_iter()
            .filter(|(channel, _)| *channel == Channel::Command)
            .map(|(_, data)| u16::from_le_bytes([data[0], data[1]]))
            .collect()
    }

    pub fn reference_writes(&self) -> usize {
        self.writes()
            .iter()
            .filter(|(channel, _)| *channel == Channel::ReferenceInput)
            .count()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn unsubscription_count(&self) -> usize {
        self.unsubscriptions.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Link for MockLink {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    async fn is_connected(&self) -> bool {
        self.is_open()
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, TransportError> {
        self.ensure_open()?;
        assert_eq!(channel, Channel::Position);
        Ok(self.position.lock().unwrap().encode().to_vec())
    }

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut writes = self.writes.lock().unwrap();
        if let Some(n) = *self.fail_writes_from.lock().unwrap() {
            if writes.len() >= n {
                return Err(TransportError::Closed);
            }
        }
        writes.push((channel, data.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, _channel: Channel) -> Result<NotificationStream, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx.boxed())
    }

    async fn unsubscribe(&self, _channel: Channel) -> Result<(), TransportError> {
        self.unsubscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.subscribers.lock().unwrap().clear();
        Ok(())
    }

    async fn disconnected(&self) {
        let mut lost = self.lost.subscribe();
        while !*lost.borrow_and_update() {
            if lost.changed().await.is_err() {
                return;
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionManager, ConnectionSettings, ConnectionState};
use super::identity::IdentityCache;
use super::motion::{MotionController, MotionSettings, MotionState, MoveOutcome};
use super::protocol::{self, TelemetrySample, MAX_HEIGHT_MM, MIN_HEIGHT_MM};
use super::telemetry::{DeskObserver, ObserverId, TelemetryDistributor};
use super::transport::{Channel, Transport};
use crate::error::{ConnectError, MotionError, TransportError};

/// Name fragment desks advertise.
const DESK_NAME: &str = "desk";

const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Result of waiting for a move to finish.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arrival {
    /// The desk came to rest; the sample was read after settling.
    Settled(TelemetrySample),
    /// The deadline passed and the desk was stopped.
    TimedOut,
}

/// Everything needed to drive one desk: connection, motion and telemetry.
pub struct DeskController {
    telemetry: Arc<TelemetryDistributor>,
    connection: Arc<ConnectionManager>,
    motion: MotionController,
    tolerance_mm: f64,
    settle_delay: Duration,
    monitor: std::sync::Mutex<Option<CancellationToken>>,
}

impl DeskController {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: IdentityCache,
        connection: ConnectionSettings,
        motion: MotionSettings,
    ) -> Self {
        let telemetry = Arc::new(TelemetryDistributor::new());
        let connection =
            ConnectionManager::new(transport, cache, connection, Arc::clone(&telemetry));
        let tolerance_mm = f64::from(motion.tolerance_raw) / 10.0;
        let motion = MotionController::new(Arc::clone(&connection), Arc::clone(&telemetry), motion);

        Self {
            telemetry,
            connection,
            motion,
            tolerance_mm,
            settle_delay: SETTLE_DELAY,
            monitor: std::sync::Mutex::new(None),
        }
    }

    /// Pause between a finished move and the final height read.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn register_observer(&self, observer: Arc<dyn DeskObserver>) -> ObserverId {
        self.telemetry.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.telemetry.unregister(id)
    }

    /// Scan for nearby desks, returning `(name, address)` pairs.
    pub async fn scan_desks(&self) -> Result<Vec<(String, String)>, ConnectError> {
        let devices = self.connection.scan_all().await?;
        log::info!("Found {} devices", devices.len());

        Ok(devices
            .into_iter()
            .filter_map(|device| {
                let name = device.name?;
                name.to_lowercase()
                    .contains(DESK_NAME)
                    .then(|| (name, device.identity.address))
            })
            .collect())
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await.map(|_| ())
    }

    /// Read position and speed once and publish them.
    pub async fn read_state(&self) -> Result<TelemetrySample, MotionError> {
        let link = self.connection.connect().await?;
        let data = link
            .read(Channel::Position)
            .await
            .map_err(|source| MotionError::Read { source })?;
        let sample = TelemetrySample::decode(&data)?;
        self.telemetry.publish(&sample);
        Ok(sample)
    }

    /// Keep publishing height notifications to observers, across reconnects,
    /// until [`DeskController::stop_monitoring`] or a disconnect.
    pub async fn start_monitoring(&self) -> Result<TelemetrySample, MotionError> {
        let sample = self.read_state().await?;

        let cancel = CancellationToken::new();
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        tokio::spawn(monitor(
            Arc::clone(&self.connection),
            self.motion.watch_state(),
            Arc::clone(&self.telemetry),
            cancel,
        ));
        log::info!("Monitoring desk height");
        Ok(sample)
    }

    pub fn stop_monitoring(&self) {
        let token = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub async fn move_to(&self, height_mm: f64) -> Result<MoveOutcome, MotionError> {
        self.motion.move_to(height_mm).await
    }

    pub async fn move_to_percentage(&self, percentage: f64) -> Result<MoveOutcome, MotionError> {
        self.motion
            .move_to(protocol::percentage_to_mm(percentage))
            .await
    }

    pub async fn stop_movement(&self) -> Result<(), MotionError> {
        self.motion.stop_movement().await
    }

    pub async fn force_stop(&self) -> Result<(), MotionError> {
        self.motion.force_stop().await
    }

    /// Wait for the current move to finish, stopping the desk if it has not
    /// within `deadline`.
    pub async fn wait_for_arrival(&self, deadline: Duration) -> Result<Arrival, MotionError> {
        if tokio::time::timeout(deadline, self.motion.wait_until_idle())
            .await
            .is_err()
        {
            log::warn!(
                "Desk did not arrive within {} seconds, stopping",
                deadline.as_secs()
            );
            self.motion.stop_movement().await?;
            return Ok(Arrival::TimedOut);
        }

        sleep(self.settle_delay).await;
        let sample = self.read_state().await?;
        log::info!("Desk settled at {:.1}mm", sample.position_mm);
        Ok(Arrival::Settled(sample))
    }

    /// Stop any move and close the link without reconnecting.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        log::info!("Disconnect called");
        self.stop_monitoring();
        self.connection.suppress_reconnect();
        if let Err(e) = self.motion.stop_movement().await {
            log::warn!("Could not stop desk before disconnecting: {}", e);
        }
        self.connection.disconnect().await
    }

    /// Drop the remembered desk so the next connect scans.
    pub fn forget_device(&self) {
        self.connection.cache().invalidate();
    }

    pub fn height_mm(&self) -> Option<f64> {
        self.telemetry.latest().map(|s| s.position_mm)
    }

    pub fn speed_mm_s(&self) -> Option<f64> {
        self.telemetry.latest().map(|s| s.speed_mm_s)
    }

    pub fn is_moving_up(&self) -> bool {
        self.speed_mm_s().is_some_and(|speed| speed > 0.0)
    }

    pub fn is_moving_down(&self) -> bool {
        self.speed_mm_s().is_some_and(|speed| speed < 0.0)
    }

    pub fn height_percentage(&self) -> Option<f64> {
        self.height_mm().map(protocol::mm_to_percentage)
    }

    pub fn is_on_highest(&self) -> bool {
        self.height_mm()
            .is_some_and(|h| MAX_HEIGHT_MM - h - self.tolerance_mm < 0.0)
    }

    pub fn is_on_lowest(&self) -> bool {
        self.height_mm()
            .is_some_and(|h| MIN_HEIGHT_MM - h - self.tolerance_mm < 0.0)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion.state()
    }
}

/// Wait for the next connection state change; false once cancelled.
async fn next_change(
    state: &mut watch::Receiver<ConnectionState>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        changed = state.changed() => changed.is_ok(),
    }
}

async fn monitor(
    connection: Arc<ConnectionManager>,
    motion: watch::Receiver<MotionState>,
    telemetry: Arc<TelemetryDistributor>,
    cancel: CancellationToken,
) {
    let mut state = connection.watch_state();

    loop {
        let connected = *state.borrow_and_update() == ConnectionState::Connected;
        if !connected {
            if !next_change(&mut state, &cancel).await {
                break;
            }
            continue;
        }

        let Some(link) = connection.current_link().await else {
            if !next_change(&mut state, &cancel).await {
                break;
            }
            continue;
        };
        let mut notifications = match link.subscribe(Channel::Position).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Could not subscribe to height notifications: {}", e);
                if !next_change(&mut state, &cancel).await {
                    break;
                }
                continue;
            }
        };

        let cancelled = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                frame = notifications.next() => match frame {
                    Some(frame) => {
                        // While seeking the motion loop publishes.
                        if motion.borrow().is_seeking() {
                            continue;
                        }
                        match TelemetrySample::decode(&frame) {
                            Ok(sample) => telemetry.publish(&sample),
                            Err(e) => log::warn!("Ignoring height notification: {}", e),
                        }
                    }
                    None => break false,
                },
            }
        };

        drop(notifications);
        if let Err(e) = link.unsubscribe(Channel::Position).await {
            log::debug!("Unsubscribing monitor failed: {}", e);
        }
        if cancelled {
            break;
        }
        log::info!("Height notifications ended, waiting for reconnect");
    }
    log::debug!("Monitoring stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desk::identity::DeviceIdentity;
    use crate::desk::mock::{MockTransport, ADDRESS};
    use crate::desk::transport::DiscoveredDevice;
    use serde_json::json;
    use std::sync::Mutex;

    fn desk_with_backoff(transport: &Arc<MockTransport>, backoff: Duration) -> DeskController {
        DeskController::new(
            transport.clone(),
            IdentityCache::disabled(),
            ConnectionSettings {
                address: Some(ADDRESS.to_string()),
                backoff,
                ..ConnectionSettings::default()
            },
            MotionSettings::default(),
        )
        .with_settle_delay(Duration::ZERO)
    }

    fn desk(transport: &Arc<MockTransport>) -> DeskController {
        desk_with_backoff(transport, Duration::ZERO)
    }

    #[derive(Default)]
    struct Heights(Mutex<Vec<u16>>);

    impl DeskObserver for Heights {
        fn on_telemetry(&self, sample: &TelemetrySample) {
            self.0.lock().unwrap().push(sample.position_raw);
        }
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn test_scan_desks_filters_by_name() {
        let device = |name: Option<&str>, address: &str| DiscoveredDevice {
            name: name.map(str::to_string),
            identity: DeviceIdentity::new(address, json!(null)),
        };
        let transport = MockTransport::with_devices(vec![
            device(Some("Desk 1234"), "AA"),
            device(Some("Headphones"), "BB"),
            device(None, "CC"),
            device(Some("my DESK"), "DD"),
        ]);

        let desks = desk(&transport).scan_desks().await.unwrap();

        assert_eq!(
            desks,
            vec![
                ("Desk 1234".to_string(), "AA".to_string()),
                ("my DESK".to_string(), "DD".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_state_updates_derived_properties() {
        let transport = MockTransport::with_desk();
        transport.set_initial_position(6500);
        let desk = desk(&transport);
        assert_eq!(desk.height_mm(), None);

        let sample = desk.read_state().await.unwrap();

        assert_eq!(sample.position_mm, 1270.0);
        assert_eq!(desk.height_mm(), Some(1270.0));
        assert_eq!(desk.speed_mm_s(), Some(0.0));
        assert_eq!(desk.height_percentage(), Some(100.0));
        assert!(desk.is_on_highest());
        assert!(desk.is_on_lowest());
        assert!(desk.is_connected());
    }

    #[tokio::test]
    async fn test_lowest_position_is_not_highest() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);
        desk.read_state().await.unwrap();

        assert!(!desk.is_on_highest());
        assert_eq!(desk.height_percentage(), Some(0.0));
    }

    #[tokio::test]
    async fn test_move_to_percentage_maps_and_clamps() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);

        let outcome = desk.move_to_percentage(50.0).await.unwrap();
        assert!(matches!(outcome, MoveOutcome::Started { target_raw: 3250, .. }));

        let outcome = desk.move_to_percentage(250.0).await.unwrap();
        assert!(matches!(outcome, MoveOutcome::Started { target_raw: 6500, .. }));
    }

    #[tokio::test]
    async fn test_wait_for_arrival_reads_final_height() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);
        desk.move_to(700.0).await.unwrap();
        transport.last_link().unwrap().notify(805, 0);

        let arrival = desk.wait_for_arrival(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(arrival, Arrival::Settled(s) if s.position_raw == 805));
    }

    #[tokio::test]
    async fn test_wait_for_arrival_times_out_and_stops() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);
        desk.move_to(1200.0).await.unwrap();

        let arrival = desk
            .wait_for_arrival(Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(arrival, Arrival::TimedOut);
        assert_eq!(transport.last_link().unwrap().commands(), vec![71, 255]);
        assert_eq!(desk.motion_state(), MotionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_stops_active_move() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);
        desk.move_to(1200.0).await.unwrap();
        let link = transport.last_link().unwrap();

        desk.disconnect().await.unwrap();
        desk.disconnect().await.unwrap();

        assert_eq!(link.commands(), vec![71, 255]);
        assert!(!link.is_open());
        assert_eq!(desk.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_never_moves() {
        let transport = MockTransport::with_desk();
        transport.script_connects([false, true]);
        let desk = Arc::new(desk_with_backoff(&transport, Duration::from_millis(200)));

        let pending = tokio::spawn({
            let desk = Arc::clone(&desk);
            async move { desk.move_to(1200.0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        desk.disconnect().await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), MoveOutcome::Cancelled);
        let link = transport.last_link().unwrap();
        assert!(link.writes().is_empty());
        assert!(!link.is_open());
        assert_eq!(desk.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_direction_follows_speed_sign() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);
        assert!(!desk.is_moving_up());
        assert!(!desk.is_moving_down());

        desk.start_monitoring().await.unwrap();
        let link = transport.last_link().unwrap();
        until(|| link.subscription_count() == 1).await;

        link.notify(300, 250);
        until(|| desk.is_moving_up()).await;
        assert!(!desk.is_moving_down());

        link.notify(200, -250);
        until(|| desk.is_moving_down()).await;
        assert!(!desk.is_moving_up());

        link.notify(200, 0);
        until(|| !desk.is_moving_down()).await;
        assert!(!desk.is_moving_up());
        desk.stop_monitoring();
    }

    #[tokio::test]
    async fn test_monitoring_publishes_idle_notifications() {
        let transport = MockTransport::with_desk();
        let desk = desk(&transport);
        let heights = Arc::new(Heights::default());
        desk.register_observer(heights.clone());

        desk.start_monitoring().await.unwrap();
        let link = transport.last_link().unwrap();
        until(|| link.subscription_count() == 1).await;
        link.notify(120, 0);
        until(|| heights.0.lock().unwrap().len() == 2).await;

        desk.stop_monitoring();
        until(|| link.unsubscription_count() == 1).await;
        assert_eq!(*heights.0.lock().unwrap(), vec![0, 120]);
    }
}

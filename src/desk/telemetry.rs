use std::sync::{Arc, Mutex};

use super::connection::ConnectionState;
use super::protocol::TelemetrySample;
use crate::error::MotionError;

/// Callback handler for desk updates.
///
/// Called synchronously from the event loop, so implementations should only
/// record or enqueue.
pub trait DeskObserver: Send + Sync {
    fn on_telemetry(&self, _sample: &TelemetrySample) {}

    fn on_connectivity(&self, _state: ConnectionState) {}

    /// A move was abandoned because a command could not be delivered.
    fn on_motion_aborted(&self, _error: &MotionError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn DeskObserver>)>,
    latest: Option<TelemetrySample>,
}

/// Fan-out of samples and connectivity changes to registered observers.
#[derive(Default)]
pub struct TelemetryDistributor {
    registry: Mutex<Registry>,
}

impl TelemetryDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn DeskObserver>) -> ObserverId {
        let mut registry = self.lock();
        let id = ObserverId(registry.next_id);
        registry.next_id += 1;
        registry.observers.push((id, observer));
        id
    }

    /// Returns false if the observer was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut registry = self.lock();
        let before = registry.observers.len();
        registry.observers.retain(|(existing, _)| *existing != id);
        registry.observers.len() != before
    }

    /// Most recent sample seen, if any.
    pub fn latest(&self) -> Option<TelemetrySample> {
        self.lock().latest
    }

    pub fn publish(&self, sample: &TelemetrySample) {
        log::debug!(
            "Height: {:4.0}mm Speed: {:2.0}mm/s",
            sample.position_mm,
            sample.speed_mm_s
        );
        let observers = {
            let mut registry = self.lock();
            registry.latest = Some(*sample);
            registry.snapshot()
        };
        for observer in observers {
            observer.on_telemetry(sample);
        }
    }

    pub fn publish_connectivity(&self, state: ConnectionState) {
        let observers = self.lock().snapshot();
        for observer in observers {
            observer.on_connectivity(state);
        }
    }

    pub fn publish_motion_aborted(&self, error: &MotionError) {
        let observers = self.lock().snapshot();
        for observer in observers {
            observer.on_motion_aborted(error);
        }
    }

    // Observers are invoked outside the lock so they may (un)register.
    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Registry {
    fn snapshot(&self) -> Vec<Arc<dyn DeskObserver>> {
        self.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MotionError, TelemetryError};

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<TelemetrySample>>,
        states: Mutex<Vec<ConnectionState>>,
        aborts: Mutex<usize>,
    }

    impl DeskObserver for Recorder {
        fn on_telemetry(&self, sample: &TelemetrySample) {
            self.samples.lock().unwrap().push(*sample);
        }

        fn on_connectivity(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }

        fn on_motion_aborted(&self, _error: &MotionError) {
            *self.aborts.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_publish_reaches_every_observer() {
        let distributor = TelemetryDistributor::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        distributor.register(a.clone());
        distributor.register(b.clone());

        let sample = TelemetrySample::from_raw(100, 5);
        distributor.publish(&sample);

        assert_eq!(*a.samples.lock().unwrap(), vec![sample]);
        assert_eq!(*b.samples.lock().unwrap(), vec![sample]);
        assert_eq!(distributor.latest(), Some(sample));
    }

    #[test]
    fn test_unregistered_observer_stops_receiving() {
        let distributor = TelemetryDistributor::new();
        let a = Arc::new(Recorder::default());
        let id = distributor.register(a.clone());

        assert!(distributor.unregister(id));
        assert!(!distributor.unregister(id));
        distributor.publish(&TelemetrySample::from_raw(1, 1));

        assert!(a.samples.lock().unwrap().is_empty());
    }

    #[test]
    fn test_connectivity_and_abort_events() {
        let distributor = TelemetryDistributor::new();
        let a = Arc::new(Recorder::default());
        distributor.register(a.clone());

        distributor.publish_connectivity(ConnectionState::Connected);
        distributor.publish_connectivity(ConnectionState::Disconnected);
        let error = MotionError::from(TelemetryError::ShortFrame { len: 0 });
        distributor.publish_motion_aborted(&error);

        assert_eq!(
            *a.states.lock().unwrap(),
            vec![ConnectionState::Connected, ConnectionState::Disconnected]
        );
        assert_eq!(*a.aborts.lock().unwrap(), 1);
        assert!(distributor.latest().is_none());
    }
}

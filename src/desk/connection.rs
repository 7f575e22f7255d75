use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::identity::IdentityCache;
use super::telemetry::TelemetryDistributor;
use super::transport::{DiscoveredDevice, Link, Transport};
use crate::error::{ConnectError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Address of the desk to connect to
    pub address: Option<String>,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Connect attempts against a freshly discovered desk, and reconnect
    /// rounds after an unsolicited disconnect.
    pub attempts: u32,
    pub backoff: Duration,
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            address: None,
            scan_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(20),
            attempts: 3,
            backoff: Duration::from_secs(3),
            auto_reconnect: true,
        }
    }
}

/// Owns the single link to the desk.
///
/// Connects through the identity cache first and falls back to a scan,
/// retrying a bounded number of times. When the link drops on its own a
/// supervisor task reconnects unless [`ConnectionManager::disconnect`] was
/// called.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    cache: IdentityCache,
    settings: ConnectionSettings,
    telemetry: Arc<TelemetryDistributor>,
    // Held for the whole of a connect so only one link can come up.
    link: Mutex<Option<Arc<dyn Link>>>,
    state: watch::Sender<ConnectionState>,
    intentional: AtomicBool,
    watcher: std::sync::Mutex<CancellationToken>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: IdentityCache,
        settings: ConnectionSettings,
        telemetry: Arc<TelemetryDistributor>,
    ) -> Arc<Self> {
        let cache = if transport.capabilities().rehydrate_identity {
            cache
        } else {
            log::debug!("Transport cannot rehydrate device handles, desk cache disabled");
            IdentityCache::disabled()
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|this| Self {
            transport,
            cache,
            settings,
            telemetry,
            link: Mutex::new(None),
            state,
            intentional: AtomicBool::new(false),
            watcher: std::sync::Mutex::new(CancellationToken::new()),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The live link, if connected. Waits for an in-flight connect.
    pub async fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.link.lock().await.clone()
    }

    /// Scan without an address filter, for desk setup.
    pub async fn scan_all(&self) -> Result<Vec<DiscoveredDevice>, ConnectError> {
        log::info!(
            "Scanning for desks for {} seconds...",
            self.settings.scan_timeout.as_secs()
        );
        self.transport
            .scan(None, self.settings.scan_timeout)
            .await
            .map_err(|source| ConnectError::Scan { source })
    }

    /// Return the live link, establishing one if needed.
    ///
    /// Clears a previous intentional disconnect, so reconnects resume.
    pub async fn connect(&self) -> Result<Arc<dyn Link>, ConnectError> {
        self.intentional.store(false, Ordering::SeqCst);
        self.establish().await
    }

    /// Stop automatic reconnects without touching the link yet.
    pub fn suppress_reconnect(&self) {
        self.intentional.store(true, Ordering::SeqCst);
    }

    /// Close the link. Idempotent.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.suppress_reconnect();
        self.replace_watcher();

        let link = self.link.lock().await.take();
        let Some(link) = link else {
            log::debug!("Disconnect requested but no desk link is open");
            return Ok(());
        };

        let result = if link.is_connected().await {
            link.disconnect().await
        } else {
            Ok(())
        };
        self.set_state(ConnectionState::Disconnected);
        if result.is_ok() {
            log::info!("Disconnected from desk {}", link.identity().address);
        }
        result
    }

    async fn establish(&self) -> Result<Arc<dyn Link>, ConnectError> {
        let mut slot = self.link.lock().await;

        if let Some(link) = slot.as_ref() {
            if link.is_connected().await {
                log::debug!("Using existing desk connection (no scan needed)");
                return Ok(Arc::clone(link));
            }
            log::info!("Stored desk link is no longer connected, dropping it");
            *slot = None;
        }

        let address = self
            .settings
            .address
            .clone()
            .ok_or(ConnectError::NoDeviceConfigured)?;

        self.set_state(ConnectionState::Connecting);
        match self.open(&address).await {
            Ok(link) => {
                *slot = Some(Arc::clone(&link));
                self.set_state(ConnectionState::Connected);
                self.supervise(Arc::clone(&link));
                log::info!("Desk connection established to {}", address);
                Ok(link)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn Link>, ConnectError> {
        if let Some(identity) = self.cache.load(address) {
            log::info!("Cached desk available, trying to connect to {}", address);
            match self
                .transport
                .connect(&identity, self.settings.connect_timeout)
                .await
            {
                Ok(link) => return Ok(link),
                Err(e) => {
                    log::warn!("Cached desk identity is stale ({}), rescanning", e);
                    self.cache.invalidate();
                }
            }
        }

        let found = self.discover(address).await?;
        let link = self.connect_with_retry(&found).await?;
        self.cache.store(&found.identity);
        Ok(link)
    }

    async fn discover(&self, address: &str) -> Result<DiscoveredDevice, ConnectError> {
        log::info!(
            "Scanning for desk {} for {} seconds...",
            address,
            self.settings.scan_timeout.as_secs()
        );
        let devices = self
            .transport
            .scan(Some(address), self.settings.scan_timeout)
            .await
            .map_err(|source| ConnectError::Scan { source })?;

        match devices
            .into_iter()
            .find(|d| d.address().eq_ignore_ascii_case(address))
        {
            Some(device) => {
                log::info!("Found matching desk with address: {}", address);
                Ok(device)
            }
            None => {
                log::error!("Could not find desk {}", address);
                Err(ConnectError::DeviceNotFound {
                    address: address.to_string(),
                })
            }
        }
    }

    async fn connect_with_retry(
        &self,
        device: &DiscoveredDevice,
    ) -> Result<Arc<dyn Link>, ConnectError> {
        let max_attempts = self.settings.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                log::info!("Connection retry attempt {} of {}", attempt, max_attempts);
                sleep(self.settings.backoff).await;
            }

            match self
                .transport
                .connect(&device.identity, self.settings.connect_timeout)
                .await
            {
                Ok(link) => {
                    log::info!("Successfully connected on attempt {}", attempt);
                    return Ok(link);
                }
                Err(e) => {
                    log::error!("Connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        self.cache.invalidate();
        Err(ConnectError::LinkFailure {
            attempts: max_attempts,
            source: last_error.unwrap_or(TransportError::Closed),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Connection state {:?} -> {:?}", previous, state);
            self.telemetry.publish_connectivity(state);
        }
    }

    fn replace_watcher(&self) -> CancellationToken {
        let mut watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watcher.cancel();
        *watcher = CancellationToken::new();
        watcher.clone()
    }

    /// Watch `link` for an unsolicited drop. Replaces any previous watcher.
    fn supervise(&self, link: Arc<dyn Link>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let cancel = self.replace_watcher();

        tokio::spawn(async move {
            let lost = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = link.disconnected() => true,
            };
            if lost {
                this.on_link_lost(link).await;
            }
        });
    }

    async fn on_link_lost(&self, link: Arc<dyn Link>) {
        {
            let mut slot = self.link.lock().await;
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, &link) => *slot = None,
                _ => return,
            }
        }
        log::error!("Desk did disconnect");
        self.set_state(ConnectionState::Disconnected);

        if !self.settings.auto_reconnect || self.intentional.load(Ordering::SeqCst) {
            return;
        }

        let rounds = self.settings.attempts.max(1);
        for round in 1..=rounds {
            if self.intentional.load(Ordering::SeqCst) {
                log::info!("Reconnect abandoned, disconnect was requested");
                return;
            }
            log::info!("Reconnecting to desk (round {} of {})", round, rounds);
            match self.establish().await {
                Ok(_) => return,
                Err(ConnectError::NoDeviceConfigured) => return,
                Err(e) => log::warn!("Reconnect round {} failed: {}", round, e),
            }
            if round < rounds {
                sleep(self.settings.backoff).await;
            }
        }
        log::error!("Giving up reconnecting to desk after {} rounds", rounds);
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftshare_core::protocol::SERVICE_ID;
use driftshare_core::transport::{DiscoveredDevice, ServiceDiscovery};

use crate::config::DiscoveryConfig;
use crate::events::{EventSink, ShareEvent};
use crate::registry::{PeerRecord, PeerRegistry};

/// Display name for a device that did not report one.
#[must_use]
pub fn fallback_name(address: &str) -> String {
    let compact: String = address.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("Device-{compact}")
}

/// Snapshot of the scanner's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryStatus {
    pub running: bool,
    /// Every tracked peer, visible or not.
    pub total_peers: usize,
    /// Peers inside the visibility window.
    pub visible_peers: usize,
}

struct ScannerInner<D: ServiceDiscovery> {
    discovery: Arc<D>,
    registry: Arc<PeerRegistry>,
    events: EventSink,
    config: DiscoveryConfig,
    probe_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Periodically scans for devices offering the service and keeps the
/// [`PeerRegistry`] current.
///
/// Two background loops run after [`start`](Self::start): one scan cycle
/// every `scan_interval`, and one eviction pass every `cleanup_interval`.
/// Service probes within a cycle run concurrently, at most
/// `max_concurrent_probes` at a time. A stopped scanner cannot be
/// restarted.
pub struct DiscoveryScanner<D: ServiceDiscovery> {
    inner: Arc<ScannerInner<D>>,
    started: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: ServiceDiscovery> DiscoveryScanner<D> {
    pub fn new(
        discovery: Arc<D>,
        registry: Arc<PeerRegistry>,
        events: EventSink,
        config: DiscoveryConfig,
    ) -> Self {
        let probe_slots = Arc::new(Semaphore::new(config.max_concurrent_probes.max(1)));
        Self {
            inner: Arc::new(ScannerInner {
                discovery,
                registry,
                events,
                config,
                probe_slots,
                shutdown: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the scan and cleanup loops. The first scan starts at once.
    pub fn start(&self) {
        if self.inner.shutdown.is_cancelled() {
            warn!("Discovery scanner already stopped, not restarting");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Discovery scanner already running");
            return;
        }

        let scan = tokio::spawn(Arc::clone(&self.inner).run_scan_loop());
        let cleanup = tokio::spawn(Arc::clone(&self.inner).run_cleanup_loop());
        self.loops.lock().extend([scan, cleanup]);
        info!(
            scan_interval_secs = self.inner.config.scan_interval.as_secs(),
            max_probes = self.inner.config.max_concurrent_probes,
            "Discovery scanner started"
        );
    }

    /// Runs one extra scan cycle in the background without touching the
    /// periodic schedule. The handle resolves to the number of peers
    /// confirmed. Returns `None` once the scanner is stopped.
    pub fn discover_now(&self) -> Option<JoinHandle<usize>> {
        if self.inner.shutdown.is_cancelled() {
            return None;
        }
        info!("Manual discovery requested");
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move { inner.scan_cycle().await }))
    }

    /// Evicts peers idle past the eviction timeout as of `now` and returns
    /// them. Each eviction also emits [`ShareEvent::PeerLost`].
    pub fn run_cleanup(&self, now: Instant) -> Vec<PeerRecord> {
        self.inner.cleanup(now)
    }

    /// Peers seen within the visibility window, sorted by address.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers_at(Instant::now())
    }

    #[must_use]
    pub fn peers_at(&self, now: Instant) -> Vec<PeerRecord> {
        self.inner
            .registry
            .active_peers(now, self.inner.config.visibility_window)
    }

    /// Whether `address` currently offers the service. Asks the transport
    /// directly; the registry is neither consulted nor updated.
    pub async fn is_peer_alive(&self, address: &str) -> bool {
        matches!(self.inner.probe_service(address).await, Ok(Some(_)))
    }

    /// Re-probes every tracked peer. Peers that answer are refreshed, peers
    /// that are reachable but no longer offer the service are removed.
    /// Peers whose probe fails are kept; they age out normally.
    ///
    /// Returns the number of peers removed.
    pub async fn refresh_known_peers(&self) -> usize {
        let inner = &self.inner;
        let mut removed = 0;

        for address in inner.registry.addresses() {
            if inner.shutdown.is_cancelled() {
                break;
            }
            match inner.probe_service(&address).await {
                Ok(Some(_)) => {
                    inner.registry.touch(&address, Instant::now());
                }
                Ok(None) => {
                    if let Some(record) = inner.registry.remove(&address) {
                        info!(peer = %address, "Peer no longer offers the service");
                        inner.events.emit(ShareEvent::PeerLost(record));
                        removed += 1;
                    }
                }
                Err(e) => {
                    debug!(peer = %address, error = %e, "Refresh probe failed, keeping peer");
                }
            }
        }
        removed
    }

    #[must_use]
    pub fn status(&self) -> DiscoveryStatus {
        let now = Instant::now();
        DiscoveryStatus {
            running: self.started.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled(),
            total_peers: self.inner.registry.len(),
            visible_peers: self.peers_at(now).len(),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.inner.registry
    }

    /// Cancels both loops and waits for them to exit. Probes already in
    /// flight are allowed to finish first.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Discovery loop task failed");
            }
        }
        info!("Discovery scanner stopped");
    }
}

impl<D: ServiceDiscovery> ScannerInner<D> {
    async fn run_scan_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.scan_cycle().await;
        }
        debug!("Scan loop stopped");
    }

    async fn run_cleanup_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.cleanup(Instant::now());
        }
        debug!("Cleanup loop stopped");
    }

    /// One scan plus a bounded, concurrent probe of every device found.
    async fn scan_cycle(self: &Arc<Self>) -> usize {
        debug!("Scan cycle starting");
        let devices = match self.discovery.scan(self.config.scan_duration).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device scan failed");
                self.events.log(format!("Device scan failed: {e:#}"));
                return 0;
            }
        };
        let candidates = devices.len();

        let mut probes = JoinSet::new();
        for device in devices {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&self.probe_slots).acquire_owned().await else {
                break;
            };
            let inner = Arc::clone(self);
            probes.spawn(async move {
                let _permit = permit;
                inner.probe(device).await
            });
        }

        let mut confirmed = 0;
        while let Some(result) = probes.join_next().await {
            match result {
                Ok(true) => confirmed += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }

        info!(candidates, confirmed, "Scan cycle finished");
        confirmed
    }

    /// Returns whether `device` offers the service. Devices that do not are
    /// dropped without a trace.
    async fn probe(&self, device: DiscoveredDevice) -> bool {
        match self.probe_service(&device.address).await {
            Ok(Some(port)) => {
                let name = device
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| fallback_name(&device.address));
                if self.registry.upsert(&device.address, &name, port, Instant::now()) {
                    if let Some(record) = self.registry.get(&device.address) {
                        info!(peer = %record.address, name = %record.display_name, port, "Peer found");
                        self.events.emit(ShareEvent::PeerFound(record));
                    }
                } else {
                    debug!(peer = %device.address, "Peer refreshed");
                }
                true
            }
            Ok(None) => {
                debug!(peer = %device.address, "Device does not offer the service");
                false
            }
            Err(e) => {
                debug!(peer = %device.address, error = %e, "Service probe failed");
                false
            }
        }
    }

    async fn probe_service(&self, address: &str) -> anyhow::Result<Option<u16>> {
        match time::timeout(
            self.config.probe_timeout,
            self.discovery.find_service(SERVICE_ID, address),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => anyhow::bail!("service probe timed out"),
        }
    }

    fn cleanup(&self, now: Instant) -> Vec<PeerRecord> {
        let evicted = self.registry.evict_stale(now, self.config.eviction_timeout);
        for record in &evicted {
            info!(peer = %record.address, name = %record.display_name, "Peer lost");
            self.events.emit(ShareEvent::PeerLost(record.clone()));
        }
        evicted
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use local_ip_address::local_ip;
use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use driftshare_core::transport::{DiscoveredDevice, ServiceDiscovery};

pub const SERVICE_TYPE: &str = "_driftshare._tcp.local.";

const PROP_SERVICE_ID: &str = "sid";
const PROP_NAME: &str = "n";
const PROP_INSTANCE: &str = "id";

/// How long a lookup waits for a peer that has not resolved yet.
const LOOKUP_WINDOW: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, PartialEq, Eq)]
struct ResolvedPeer {
    instance: String,
    service_id: String,
    name: Option<String>,
    port: u16,
}

/// The system host name, or `"driftshare"` when it cannot be read.
#[must_use]
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "driftshare".to_owned())
}

/// Picks the address to reach a peer by: IPv4 first, loopback last.
fn preferred_address(addresses: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    addresses
        .into_iter()
        .min_by_key(|ip| (ip.is_loopback(), !ip.is_ipv4(), *ip))
}

/// Strips the mDNS domain from a host name (`laptop.local.` → `laptop`).
fn short_host(hostname: &str) -> &str {
    hostname
        .trim_end_matches('.')
        .trim_end_matches(".local")
}

/// Turns a resolved record into a cache entry keyed by address.
fn resolved_peer(info: &ResolvedService) -> Option<(String, ResolvedPeer)> {
    let addresses = info
        .get_addresses()
        .iter()
        .filter_map(|ip| ip.to_string().parse::<IpAddr>().ok());
    let address = preferred_address(addresses)?.to_string();
    let name = info
        .get_property_val_str(PROP_NAME)
        .map(str::to_owned)
        .or_else(|| Some(short_host(info.get_hostname()).to_owned()))
        .filter(|n| !n.is_empty());
    let peer = ResolvedPeer {
        instance: info
            .get_property_val_str(PROP_INSTANCE)
            .unwrap_or_default()
            .to_owned(),
        service_id: info
            .get_property_val_str(PROP_SERVICE_ID)
            .unwrap_or_default()
            .to_owned(),
        name,
        port: info.get_port(),
    };
    Some((address, peer))
}

/// Peers currently resolved on the network, keyed by IP address.
///
/// Fed by the single long-lived browse. Waiters are woken on every
/// resolution.
#[derive(Default)]
struct PeerCache {
    peers: Mutex<HashMap<String, ResolvedPeer>>,
    changed: Notify,
}

impl PeerCache {
    fn insert(&self, address: String, peer: ResolvedPeer) {
        {
            let mut peers = self.peers.lock();
            // An instance that moved to a new address leaves the old one.
            peers.retain(|addr, p| p.instance != peer.instance || *addr == address);
            peers.insert(address, peer);
        }
        self.changed.notify_waiters();
    }

    fn remove_instance(&self, instance: &str) {
        self.peers.lock().retain(|_, peer| peer.instance != instance);
    }

    fn get(&self, address: &str) -> Option<ResolvedPeer> {
        self.peers.lock().get(address).cloned()
    }

    fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = self
            .peers
            .lock()
            .iter()
            .map(|(address, peer)| DiscoveredDevice {
                address: address.clone(),
                name: peer.name.clone(),
            })
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    /// Waits until `address` resolves or `deadline` passes.
    async fn wait_for(&self, address: &str, deadline: Instant) -> Option<ResolvedPeer> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(peer) = self.get(address) {
                return Some(peer);
            }
            if time::timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }

    fn apply(&self, own_instance: &str, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some((address, peer)) = resolved_peer(&info) else {
                    return;
                };
                if peer.instance == own_instance {
                    return;
                }
                debug!(peer = %address, port = peer.port, instance = %peer.instance, "mDNS service resolved");
                self.insert(address, peer);
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let instance = fullname.split('.').next().unwrap_or_default();
                debug!(instance = %instance, "mDNS service removed");
                self.remove_instance(instance);
            }
            _ => {}
        }
    }
}

/// [`ServiceDiscovery`] over multicast DNS on the local network.
///
/// Every instance advertises under a random instance id and ignores its own
/// record. The daemon keeps one listener per service type, so a single
/// browse runs for the life of the instance and every scan and lookup reads
/// the cache it feeds.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    instance_id: String,
    device_name: String,
    registered: Mutex<Option<String>>,
    cache: Arc<PeerCache>,
    browser: Mutex<Option<JoinHandle<()>>>,
}

impl MdnsDiscovery {
    /// Starts the mDNS daemon. `device_name` is published to peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot open its sockets.
    pub fn new(device_name: impl Into<String>) -> anyhow::Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
        Ok(Self {
            daemon,
            instance_id: Uuid::new_v4().simple().to_string(),
            device_name: device_name.into(),
            registered: Mutex::new(None),
            cache: Arc::new(PeerCache::default()),
            browser: Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Starts the shared browse on first use, or again if it ended.
    fn ensure_browsing(&self) -> anyhow::Result<()> {
        let mut browser = self.browser.lock();
        if browser.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .context("failed to browse for mDNS services")?;
        let cache = Arc::clone(&self.cache);
        let own_instance = self.instance_id.clone();
        *browser = Some(tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                cache.apply(&own_instance, event);
            }
            debug!("mDNS browse ended");
        }));
        debug!(service_type = SERVICE_TYPE, "mDNS browse started");
        Ok(())
    }
}

impl ServiceDiscovery for MdnsDiscovery {
    fn scan(
        &self,
        duration: Duration,
    ) -> impl Future<Output = anyhow::Result<Vec<DiscoveredDevice>>> + Send + '_ {
        async move {
            self.ensure_browsing()?;
            time::sleep(duration).await;
            Ok(self.cache.devices())
        }
    }

    fn find_service<'a>(
        &'a self,
        service_id: &'a str,
        address: &'a str,
    ) -> impl Future<Output = anyhow::Result<Option<u16>>> + Send + 'a {
        async move {
            self.ensure_browsing()?;
            let peer = self
                .cache
                .wait_for(address, Instant::now() + LOOKUP_WINDOW)
                .await;
            Ok(peer
                .filter(|p| p.service_id == service_id)
                .map(|p| p.port))
        }
    }

    fn advertise<'a>(
        &'a self,
        service_id: &'a str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            let ip = local_ip().context("failed to determine local IP address")?;
            let host = format!("{}.local.", self.instance_id);
            let properties = [
                (PROP_SERVICE_ID, service_id),
                (PROP_NAME, self.device_name.as_str()),
                (PROP_INSTANCE, self.instance_id.as_str()),
            ];
            let service = ServiceInfo::new(
                SERVICE_TYPE,
                &self.instance_id,
                &host,
                ip.to_string().as_str(),
                port,
                &properties[..],
            )
            .context("failed to build mDNS service record")?;
            let fullname = service.get_fullname().to_owned();

            if let Some(previous) = self.registered.lock().take() {
                let _ = self.daemon.unregister(&previous);
            }
            self.daemon
                .register(service)
                .context("failed to register mDNS service")?;
            info!(name = %fullname, ip = %ip, port, "mDNS service registered");
            *self.registered.lock() = Some(fullname);
            Ok(())
        }
    }

    fn stop_advertising(&self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            let Some(fullname) = self.registered.lock().take() else {
                return Ok(());
            };
            self.daemon
                .unregister(&fullname)
                .context("failed to unregister mDNS service")?;
            info!(name = %fullname, "mDNS service unregistered");
            Ok(())
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.browser.lock().take() {
            task.abort();
            let _ = self.daemon.stop_browse(SERVICE_TYPE);
        }
        if let Some(fullname) = self.registered.lock().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(name = %fullname, error = %e, "Failed to unregister mDNS service");
            }
        }
        let _ = self.daemon.shutdown();
    }
}

//! In-memory discovery used by the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;

use driftshare_core::protocol::SERVICE_ID;
use driftshare_core::transport::{DiscoveredDevice, ServiceDiscovery};

/// Address every test server listens on.
pub const LOCALHOST: &str = "127.0.0.1";

/// A [`ServiceDiscovery`] backed by maps the test fills in.
///
/// `advertise` registers the port under [`LOCALHOST`], so a server started
/// with this discovery is immediately resolvable by a client sharing it.
#[derive(Default)]
pub struct StaticDiscovery {
    devices: Mutex<Vec<DiscoveredDevice>>,
    services: Mutex<HashMap<String, u16>>,
    advertised: Mutex<Option<u16>>,
    probe_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    probes: AtomicUsize,
    fail_scan: AtomicBool,
    fail_advertise: AtomicBool,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `address` show up in scans.
    pub fn add_device(&self, address: &str, name: Option<&str>) {
        self.devices.lock().push(DiscoveredDevice {
            address: address.to_owned(),
            name: name.map(str::to_owned),
        });
    }

    /// Makes `address` answer service lookups with `port`.
    pub fn add_service(&self, address: &str, port: u16) {
        self.services.lock().insert(address.to_owned(), port);
    }

    pub fn remove_service(&self, address: &str) {
        self.services.lock().remove(address);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    pub fn fail_scans(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }

    pub fn fail_advertising(&self, fail: bool) {
        self.fail_advertise.store(fail, Ordering::SeqCst);
    }

    pub fn advertised_port(&self) -> Option<u16> {
        *self.advertised.lock()
    }

    /// Highest number of concurrent `find_service` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn scan(
        &self,
        _duration: Duration,
    ) -> impl Future<Output = anyhow::Result<Vec<DiscoveredDevice>>> + Send + '_ {
        async move {
            if self.fail_scan.load(Ordering::SeqCst) {
                bail!("adapter unavailable");
            }
            Ok(self.devices.lock().clone())
        }
    }

    fn find_service<'a>(
        &'a self,
        service_id: &'a str,
        address: &'a str,
    ) -> impl Future<Output = anyhow::Result<Option<u16>>> + Send + 'a {
        async move {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = *self.probe_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if service_id != SERVICE_ID {
                return Ok(None);
            }
            Ok(self.services.lock().get(address).copied())
        }
    }

    fn advertise<'a>(
        &'a self,
        _service_id: &'a str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            if self.fail_advertise.load(Ordering::SeqCst) {
                bail!("service record rejected");
            }
            *self.advertised.lock() = Some(port);
            self.add_service(LOCALHOST, port);
            Ok(())
        }
    }

    fn stop_advertising(&self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            if self.advertised.lock().take().is_some() {
                self.remove_service(LOCALHOST);
            }
            Ok(())
        }
    }
}

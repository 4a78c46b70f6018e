use std::time::Duration;

/// Default bound on a ping round trip.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on each step of a file list request.
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(15);
/// Default bound on each step of a file download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-operation timeouts used by the client when the caller does not
/// override them.
///
/// Each value bounds a single wait (service lookup, connect, one read), not
/// the lifetime of the whole request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub ping: Duration,
    pub list: Duration,
    pub fetch: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            ping: DEFAULT_PING_TIMEOUT,
            list: DEFAULT_LIST_TIMEOUT,
            fetch: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Cadence and liveness windows of the discovery scanner.
///
/// The defaults suit transports with slow inquiry (several seconds per
/// scan); faster transports can shrink every value proportionally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Pause between the start of two scheduled scan cycles.
    pub scan_interval: Duration,
    /// How long a single device scan may run.
    pub scan_duration: Duration,
    /// Pause between two eviction passes.
    pub cleanup_interval: Duration,
    /// Peers not seen for this long are hidden from queries.
    pub visibility_window: Duration,
    /// Peers not seen for longer than this are removed.
    pub eviction_timeout: Duration,
    /// Upper bound on service probes in flight during one scan.
    pub max_concurrent_probes: usize,
    /// How long a single service probe may take before the device is
    /// treated as not offering the service.
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(45),
            scan_duration: Duration::from_secs(8),
            cleanup_interval: Duration::from_secs(20),
            visibility_window: Duration::from_secs(120),
            eviction_timeout: Duration::from_secs(180),
            max_concurrent_probes: 4,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

//! Host preparation and reachability probing

use std::net::Ipv4Addr;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

/// Where the host lives and how hard to try reaching it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    /// IP address or hostname
    pub address: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection attempts per call before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Linear backoff unit between attempts, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Number of consecutive IPv4 addresses to scan, starting at `address`
    #[serde(default = "default_scan")]
    pub scan: u8,
}

fn default_port() -> u16 {
    22
}

fn default_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_scan() -> u8 {
    1
}

impl HostProfile {
    /// Profile for a single address
    pub fn new(address: impl Into<String>, port: u16, attempts: u32) -> Self {
        Self {
            address: address.into(),
            port,
            attempts: attempts.max(1),
            backoff_ms: default_backoff_ms(),
            scan: default_scan(),
        }
    }

    /// Set the backoff unit
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Scan `width` consecutive addresses
    #[must_use]
    pub fn with_scan(mut self, width: u8) -> Self {
        self.scan = width.max(1);
        self
    }

    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Candidate addresses in probe order
    ///
    /// Scanning only applies to IPv4 literals; it walks the last octet and
    /// stops at `.255`.
    #[must_use]
    pub fn candidates(&self) -> Vec<String> {
        if self.scan <= 1 {
            return vec![self.address.clone()];
        }

        let Ok(start) = self.address.parse::<Ipv4Addr>() else {
            return vec![self.address.clone()];
        };

        let [a, b, c, d] = start.octets();
        (0..self.scan)
            .filter_map(|offset| d.checked_add(offset))
            .map(|last| Ipv4Addr::new(a, b, c, last).to_string())
            .collect()
    }

    /// Whether the address designates this machine
    #[must_use]
    pub fn is_loopback(address: &str) -> bool {
        matches!(address, "localhost" | "127.0.0.1" | "::1")
    }
}

/// Probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// First candidate that accepted a TCP connection
    Reachable {
        /// Resolved address
        address: String,
    },
    Unreachable,
}

/// Holds the prepared host profile and decides reachability
#[derive(Debug)]
pub struct HostLocator {
    profile: RwLock<Option<HostProfile>>,
    probe_timeout: Duration,
}

impl HostLocator {
    /// Create a locator with no host prepared
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            profile: RwLock::new(None),
            probe_timeout,
        }
    }

    /// Prepare (or re-prepare) the host. No network access happens here.
    pub fn prepare(&self, profile: HostProfile) -> HostProfile {
        info!(
            address = %profile.address,
            port = profile.port,
            attempts = profile.attempts,
            scan = profile.scan,
            "host prepared"
        );
        *self.profile.write() = Some(profile.clone());
        profile
    }

    /// Currently prepared profile
    #[must_use]
    pub fn profile(&self) -> Option<HostProfile> {
        self.profile.read().clone()
    }

    /// Timeout applied to each candidate probe
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Find the first candidate accepting TCP connections on the SSH port
    ///
    /// Each candidate is bounded by the probe timeout, independent of any
    /// call deadline.
    #[instrument(skip(self, profile), fields(address = %profile.address, port = profile.port))]
    pub async fn probe(&self, profile: &HostProfile) -> Reachability {
        for candidate in profile.candidates() {
            if self.probe_address(&candidate, profile.port).await {
                debug!(address = %candidate, "candidate reachable");
                return Reachability::Reachable { address: candidate };
            }
            debug!(address = %candidate, "candidate unreachable");
        }
        Reachability::Unreachable
    }

    async fn probe_address(&self, address: &str, port: u16) -> bool {
        matches!(
            timeout(self.probe_timeout, TcpStream::connect((address, port))).await,
            Ok(Ok(_))
        )
    }
}

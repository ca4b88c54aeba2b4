//! Network Adaptation
//!
//! Tracks which IP families the host can reach and derives the daemon's
//! IP preference options from it.
//!
//! The daemon's own guess is unreliable on IPv6-only networks (internal
//! IPv4 addresses make it believe IPv4 works), so on those networks it is
//! told explicitly to prefer IPv6 OR-ports.

use crate::bridges::BridgeStrategy;
use crate::entry::{ConfigEntry, keys};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::debug;

/// Observed IP capability of the host network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetworkCapability {
    Ipv4Only,
    Ipv6Only,
    Dual,
    #[default]
    Unknown,
}

impl NetworkCapability {
    /// Build from reachability of each family
    pub fn from_reachability(ipv4: bool, ipv6: bool) -> Self {
        match (ipv4, ipv6) {
            (true, true) => NetworkCapability::Dual,
            (true, false) => NetworkCapability::Ipv4Only,
            (false, true) => NetworkCapability::Ipv6Only,
            (false, false) => NetworkCapability::Unknown,
        }
    }
}

/// IP preference options for the given capability and strategy
///
/// Bridged connections keep IPv4 enabled even on IPv6-only networks: the
/// bridge lines decide reachability then, and most of them are IPv4.
pub fn ip_entries(capability: NetworkCapability, strategy: &BridgeStrategy) -> Vec<ConfigEntry> {
    let mut entries = Vec::with_capacity(3);

    if capability == NetworkCapability::Ipv6Only {
        entries.push(ConfigEntry::new(keys::CLIENT_PREFER_IPV6_OR_PORT, "1"));

        let use_ipv4 = if strategy.uses_bridges() { "1" } else { "0" };
        entries.push(ConfigEntry::new(keys::CLIENT_USE_IPV4, use_ipv4));
    } else {
        entries.push(ConfigEntry::new(keys::CLIENT_PREFER_IPV6_OR_PORT, "auto"));
        entries.push(ConfigEntry::new(keys::CLIENT_USE_IPV4, "1"));
    }

    entries.push(ConfigEntry::new(keys::CLIENT_USE_IPV6, "1"));
    entries
}

/// Source of capability transitions
pub trait CapabilityProbe: Send + Sync {
    /// Receiver that is notified on every capability change
    fn subscribe(&self) -> watch::Receiver<NetworkCapability>;
}

/// Probe fed by the host application
#[derive(Debug)]
pub struct ManualProbe {
    tx: watch::Sender<NetworkCapability>,
}

impl ManualProbe {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NetworkCapability::Unknown);
        Self { tx }
    }

    /// Report the current capability; no-op if unchanged
    pub fn report(&self, capability: NetworkCapability) {
        self.tx.send_if_modified(|current| {
            if *current == capability {
                false
            } else {
                *current = capability;
                true
            }
        });
    }
}

impl Default for ManualProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityProbe for ManualProbe {
    fn subscribe(&self) -> watch::Receiver<NetworkCapability> {
        self.tx.subscribe()
    }
}

/// Probe that periodically checks for IPv4 and IPv6 routes
///
/// Connecting a UDP socket sends no packets; it only asks the kernel for
/// a route, which is enough to tell which families are usable.
pub struct RouteProbe {
    tx: watch::Sender<NetworkCapability>,
    task: tokio::task::JoinHandle<()>,
}

impl RouteProbe {
    /// Well-known public resolvers used as route targets
    const IPV4_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53);
    const IPV6_TARGET: SocketAddr =
        SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2620, 0xfe, 0, 0, 0, 0, 0, 0xfe)), 53);

    /// Start probing every `interval`
    pub fn spawn(interval: Duration) -> Self {
        let (tx, _) = watch::channel(NetworkCapability::Unknown);
        let sender = tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                let capability = Self::probe().await;
                sender.send_if_modified(|current| {
                    if *current == capability {
                        false
                    } else {
                        debug!("Network capability changed: {:?} -> {:?}", current, capability);
                        *current = capability;
                        true
                    }
                });
            }
        });

        Self { tx, task }
    }

    /// Check both families once
    pub async fn probe() -> NetworkCapability {
        let ipv4 = has_route("0.0.0.0:0", Self::IPV4_TARGET).await;
        let ipv6 = has_route("[::]:0", Self::IPV6_TARGET).await;
        NetworkCapability::from_reachability(ipv4, ipv6)
    }
}

impl CapabilityProbe for RouteProbe {
    fn subscribe(&self) -> watch::Receiver<NetworkCapability> {
        self.tx.subscribe()
    }
}

impl Drop for RouteProbe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn has_route(bind: &str, target: SocketAddr) -> bool {
    match UdpSocket::bind(bind).await {
        Ok(socket) => socket.connect(target).await.is_ok(),
        Err(_) => false,
    }
}

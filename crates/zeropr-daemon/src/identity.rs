//! Local Identity - Recognise our own advertisement on the network
//!
//! Name and port alone are not enough: a restarted peer can reuse a name
//! before our old record expires elsewhere. A record is ours only when one
//! of its addresses is also one of our interface addresses.

use anyhow::Result;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Produces the host's current interface addresses
pub type AddressSource = Arc<dyn Fn() -> Result<Vec<IpAddr>> + Send + Sync>;

/// Interface addresses from the OS
pub fn interface_addresses() -> Result<Vec<IpAddr>> {
    let interfaces = local_ip_address::list_afinet_netifas()?;
    Ok(interfaces.into_iter().map(|(_, ip)| ip).collect())
}

/// This host's advertised name, port and address set
pub struct LocalIdentity {
    name: String,
    port: u16,
    source: AddressSource,
    addresses: RwLock<HashSet<IpAddr>>,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self::with_source(name, port, Arc::new(interface_addresses))
    }

    pub fn with_source(name: impl Into<String>, port: u16, source: AddressSource) -> Self {
        Self {
            name: name.into(),
            port,
            source,
            addresses: RwLock::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Re-read interface addresses (VPN up/down, DHCP renewals).
    ///
    /// On failure the previous set is kept.
    pub async fn refresh(&self) {
        let found = match (self.source)() {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to list network interfaces: {}", e);
                return;
            }
        };

        let usable: HashSet<IpAddr> = found
            .into_iter()
            .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
            .collect();

        debug!(count = usable.len(), "Refreshed local addresses");
        *self.addresses.write().await = usable;
    }

    pub async fn addresses(&self) -> HashSet<IpAddr> {
        self.addresses.read().await.clone()
    }

    /// True when name and port match ours and an address intersects our set
    pub async fn is_self(&self, name: &str, port: u16, candidates: &[IpAddr]) -> bool {
        if name != self.name || port != self.port {
            return false;
        }

        let addresses = self.addresses.read().await;
        candidates.iter().any(|ip| addresses.contains(ip))
    }
}

//! LAN Discovery - mDNS advertisement and browsing
//!
//! Architecture:
//! - Advertise: "_zeropr._tcp" service with presence in TXT records
//! - Browse: resolved services are streamed as [`DiscoveryRecord`]s
//! - The [`DiscoveryBackend`] trait keeps the reconciler and broadcast
//!   controller independent of the mDNS implementation

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeropr_core::{Error, Presence, RepoInfo, Result};

pub const SERVICE_TYPE: &str = "_zeropr._tcp.local.";
pub const PROTOCOL_VERSION: &str = "0.1.0";

pub const KEY_VERSION: &str = "version";
pub const KEY_REPO_HASH: &str = "repoHash";
pub const KEY_BRANCH: &str = "branch";
pub const KEY_ACTIVE_FILE: &str = "activeFile";
pub const KEY_CURSOR: &str = "cursor";
pub const KEY_STATUS: &str = "status";
pub const KEY_TRUSTED: &str = "trusted";

/// What this host announces about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    pub port: u16,
    pub properties: BTreeMap<String, String>,
}

impl Advertisement {
    pub fn new(name: &str, port: u16, presence: &Presence, repo: &RepoInfo) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(KEY_VERSION.to_string(), PROTOCOL_VERSION.to_string());
        properties.insert(KEY_REPO_HASH.to_string(), repo.repo_hash.clone());
        properties.insert(KEY_BRANCH.to_string(), repo.branch.clone());
        properties.insert(KEY_STATUS.to_string(), presence.status.to_string());
        // No trust model yet: we never vouch for ourselves
        properties.insert(KEY_TRUSTED.to_string(), "false".to_string());
        if let Some(file) = &presence.active_file {
            properties.insert(KEY_ACTIVE_FILE.to_string(), file.clone());
        }
        if let Some(cursor) = &presence.cursor {
            properties.insert(KEY_CURSOR.to_string(), cursor.to_txt());
        }

        Self {
            name: name.to_string(),
            port,
            properties,
        }
    }
}

/// A resolved service seen while browsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    /// Instance name, i.e. the remote device name
    pub instance: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub properties: HashMap<String, String>,
}

/// Broadcast/browse mechanism used by the daemon
pub trait DiscoveryBackend: Send + Sync {
    /// Register or replace our advertisement
    fn register(&self, advertisement: &Advertisement) -> Result<()>;

    /// Withdraw our advertisement; no-op if none is registered
    fn unregister(&self) -> Result<()>;

    /// Start a browse; records arrive until [`stop_browse`](Self::stop_browse)
    fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryRecord>>;

    fn stop_browse(&self);
}

/// mDNS backend on top of `mdns-sd`
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    /// Fullname of the registered service, used to unregister
    registered: Mutex<Option<String>>,
}

impl MdnsBackend {
    /// Binds the multicast sockets; failure here is fatal for the daemon
    pub fn new() -> std::result::Result<Self, mdns_sd::Error> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            registered: Mutex::new(None),
        })
    }

    /// Stop the mDNS daemon thread
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!("Failed to shut down mDNS daemon: {}", e);
        }
    }

    fn take_registered(&self) -> Option<String> {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl DiscoveryBackend for MdnsBackend {
    fn register(&self, advertisement: &Advertisement) -> Result<()> {
        // The current advertisement stays up until its replacement is accepted
        let service = service_info(advertisement)?;
        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| Error::RegistrationFailed(e.to_string()))?;

        let previous = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(fullname.clone());
        if let Some(stale) = stale_registration(previous, &fullname) {
            debug!("Withdrawing replaced advertisement {}", stale);
            if let Err(e) = self.daemon.unregister(&stale) {
                warn!("Failed to withdraw {}: {}", stale, e);
            }
        }

        info!(
            "📡 mDNS: Advertising as {} on port {}",
            advertisement.name, advertisement.port
        );
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        let Some(fullname) = self.take_registered() else {
            return Ok(());
        };

        self.daemon
            .unregister(&fullname)
            .map_err(|e| Error::RegistrationFailed(e.to_string()))?;
        info!("Unregistered service: {}", fullname);
        Ok(())
    }

    fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryRecord>> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::TransientDiscovery(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();

        // mdns-sd hands out a blocking channel; it closes after stop_browse
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        if tx.send(record_from_service(&info)).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
        });

        Ok(rx)
    }

    fn stop_browse(&self) {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!("stop_browse failed: {}", e);
        }
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        if let Some(fullname) = self.take_registered() {
            info!("Unregistering service: {}", fullname);
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!("Failed to unregister {}: {}", fullname, e);
            }
        }
    }
}

fn service_info(advertisement: &Advertisement) -> Result<ServiceInfo> {
    let host_name = format!("{}.local.", advertisement.name);
    let properties: HashMap<String, String> = advertisement
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    ServiceInfo::new(
        SERVICE_TYPE,
        &advertisement.name,
        &host_name,
        "",
        advertisement.port,
        properties,
    )
    .map(ServiceInfo::enable_addr_auto)
    .map_err(|e| Error::RegistrationFailed(e.to_string()))
}

/// Registering the same fullname again updates it in place; only a renamed
/// advertisement leaves an old service behind
fn stale_registration(previous: Option<String>, current: &str) -> Option<String> {
    previous.filter(|fullname| fullname != current)
}

fn record_from_service(info: &ServiceInfo) -> DiscoveryRecord {
    let fullname = info.get_fullname();
    let instance = fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string();

    let properties = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    DiscoveryRecord {
        instance,
        port: info.get_port(),
        addresses: info.get_addresses().iter().copied().collect(),
        properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeropr_core::{CursorPosition, PresenceStatus};

    #[test]
    fn test_advertisement_properties() {
        let presence = Presence {
            status: PresenceStatus::Editing,
            active_file: Some("src/app.ts".into()),
            cursor: Some(CursorPosition { line: 10, column: 2 }),
        };
        let repo = RepoInfo {
            repo_hash: "0123456789abcdef".into(),
            branch: "main".into(),
        };

        let ad = Advertisement::new("zeropr-agent-dev", 8080, &presence, &repo);

        assert_eq!(ad.properties[KEY_STATUS], "editing");
        assert_eq!(ad.properties[KEY_ACTIVE_FILE], "src/app.ts");
        assert_eq!(ad.properties[KEY_CURSOR], "10:2");
        assert_eq!(ad.properties[KEY_REPO_HASH], "0123456789abcdef");
        assert_eq!(ad.properties[KEY_BRANCH], "main");
        assert_eq!(ad.properties[KEY_TRUSTED], "false");
    }

    #[test]
    fn test_advertisement_without_active_file() {
        let presence = Presence {
            status: PresenceStatus::Away,
            active_file: None,
            cursor: None,
        };

        let ad = Advertisement::new("zeropr-agent-dev", 8080, &presence, &RepoInfo::default());

        assert!(!ad.properties.contains_key(KEY_ACTIVE_FILE));
        assert!(!ad.properties.contains_key(KEY_CURSOR));
        assert_eq!(ad.properties[KEY_STATUS], "away");
    }

    #[test]
    fn test_service_info_from_advertisement() {
        let ad = Advertisement::new(
            "zeropr-agent-dev",
            8080,
            &Presence {
                status: PresenceStatus::Idle,
                active_file: Some("src/app.ts".into()),
                cursor: None,
            },
            &RepoInfo::default(),
        );

        let service = service_info(&ad).unwrap();
        assert_eq!(service.get_fullname(), "zeropr-agent-dev._zeropr._tcp.local.");
        assert_eq!(service.get_port(), 8080);
        assert_eq!(service.get_property_val_str(KEY_ACTIVE_FILE), Some("src/app.ts"));
    }

    #[test]
    fn test_stale_registration_only_on_rename() {
        let current = "zeropr-agent-dev._zeropr._tcp.local.";

        assert_eq!(stale_registration(None, current), None);
        assert_eq!(stale_registration(Some(current.to_string()), current), None);
        assert_eq!(
            stale_registration(Some("zeropr-agent-old._zeropr._tcp.local.".into()), current),
            Some("zeropr-agent-old._zeropr._tcp.local.".to_string())
        );
    }

    #[test]
    fn test_record_from_service() {
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            "zeropr-agent-alice",
            "zeropr-agent-alice.local.",
            "192.168.1.40",
            8080,
            &[("branch", "feat/auth"), ("status", "idle")][..],
        )
        .unwrap();

        let record = record_from_service(&service);

        assert_eq!(record.instance, "zeropr-agent-alice");
        assert_eq!(record.port, 8080);
        assert_eq!(record.addresses, vec!["192.168.1.40".parse::<IpAddr>().unwrap()]);
        assert_eq!(record.properties["branch"], "feat/auth");
    }
}

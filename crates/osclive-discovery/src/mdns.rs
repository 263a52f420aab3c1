//! mDNS service announcement

use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, Result};
use crate::MDNS_SERVICE_TYPE;

/// Build the service record for the relay
///
/// An empty address list lets the daemon announce every interface address.
pub fn service_info(name: &str, port: u16, addresses: &[IpAddr]) -> Result<ServiceInfo> {
    let host = hostname::get()?;
    let host = format!("{}.local.", host.to_string_lossy());
    let ips: Vec<String> = addresses.iter().map(IpAddr::to_string).collect();
    let ips = ips.join(",");
    let properties: &[(&str, &str)] = &[("name", name)];

    let info = ServiceInfo::new(MDNS_SERVICE_TYPE, name, &host, ips.as_str(), port, properties)
        .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
    Ok(if addresses.is_empty() {
        info.enable_addr_auto()
    } else {
        info
    })
}

/// Announces the relay while alive
pub struct ServiceAdvertiser {
    mdns: ServiceDaemon,
    fullname: Option<String>,
}

impl ServiceAdvertiser {
    pub fn new() -> Result<Self> {
        let mdns = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        Ok(Self {
            mdns,
            fullname: None,
        })
    }

    /// Register `<name>._osc._tcp.local.` on `port`
    pub fn advertise(&mut self, name: &str, port: u16, addresses: &[IpAddr]) -> Result<()> {
        if self.fullname.is_some() {
            self.stop()?;
        }
        let info = service_info(name, port, addresses)?;
        let fullname = info.get_fullname().to_string();
        self.mdns
            .register(info)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        info!("Announcing {} on port {}", fullname, port);
        self.fullname = Some(fullname);
        Ok(())
    }

    /// Full service name while announced
    pub fn fullname(&self) -> Option<&str> {
        self.fullname.as_deref()
    }

    /// Withdraw the announcement
    pub fn stop(&mut self) -> Result<()> {
        if let Some(fullname) = self.fullname.take() {
            debug!("Withdrawing {}", fullname);
            self.mdns
                .unregister(&fullname)
                .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for ServiceAdvertiser {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to withdraw mDNS announcement: {}", e);
        }
        let _ = self.mdns.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_record() {
        let addr: IpAddr = "192.168.1.20".parse().unwrap();
        let info = service_info("OSCLive", 4301, &[addr]).unwrap();
        assert_eq!(info.get_fullname(), "OSCLive._osc._tcp.local.");
        assert_eq!(info.get_port(), 4301);
        assert_eq!(info.get_property_val_str("name"), Some("OSCLive"));
        assert!(info.get_hostname().ends_with(".local."));
    }

    #[test]
    fn test_service_record_without_addresses() {
        let info = service_info("Stage Left", 9000, &[]).unwrap();
        assert_eq!(info.get_fullname(), "Stage Left._osc._tcp.local.");
        assert_eq!(info.get_port(), 9000);
    }
}

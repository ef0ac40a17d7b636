//! mDNS `_daap._tcp` service advertisement: registration, collision
//! detection, and TXT record construction.
//!
//! Grounded on `imbolc-net::discovery` (`ServiceDaemon`/`ServiceInfo`
//! registration, `Drop`-triggered unregister) generalized with the
//! collision-handling `pmoupnp::ssdp::server` performs over raw SSDP:
//! browse for the name before claiming it, and retry with a numeric
//! suffix on a clash instead of failing outright.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use pmoconfig::AuthMethod;
use tracing::{info, warn};

/// The DAAP mDNS service type, per spec.md §4.9.
pub const SERVICE_TYPE: &str = "_daap._tcp.local.";

/// How long to listen for an existing advertiser under the candidate
/// name before assuming the name is free.
const COLLISION_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound on numeric-suffix retries before giving up.
const MAX_COLLISION_RETRIES: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum AdvertiserError {
    #[error("failed to start mDNS daemon: {0}")]
    DaemonStart(String),
    #[error("failed to build service record: {0}")]
    ServiceInfo(String),
    #[error("failed to register service: {0}")]
    Register(String),
    #[error("exhausted {0} attempts to find a non-colliding service name")]
    NameExhausted(u32),
}

/// A live mDNS advertisement. Dropping it unregisters the service.
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
    /// The name actually advertised, after any collision-driven suffix.
    advertised_name: String,
}

impl ServiceAdvertiser {
    /// Registers `name` on `port`, probing for an existing advertiser
    /// under that name first and retrying with `" (2)"`, `" (3)"`, ...
    /// suffixes on a collision, per spec.md §4.9 ("surface name
    /// collisions... owner may choose a new name and re-register").
    pub fn start(
        name: &str,
        port: u16,
        auth: AuthMethod,
        machine_id: &str,
    ) -> Result<Self, AdvertiserError> {
        let daemon = ServiceDaemon::new().map_err(|e| AdvertiserError::DaemonStart(e.to_string()))?;

        let mut candidate = name.to_string();
        let mut attempt = 0u32;
        loop {
            if !Self::name_in_use(&daemon, &candidate) {
                break;
            }
            attempt += 1;
            if attempt > MAX_COLLISION_RETRIES {
                return Err(AdvertiserError::NameExhausted(MAX_COLLISION_RETRIES));
            }
            candidate = format!("{name} ({})", attempt + 1);
            warn!(candidate = %candidate, "DAAP service name collision, retrying with suffix");
        }

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let properties = Self::txt_properties(auth, machine_id);

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &candidate,
            &format!("{hostname}.local."),
            (),
            port,
            properties,
        )
        .map_err(|e| AdvertiserError::ServiceInfo(e.to_string()))?;

        let fullname = service.get_fullname().to_string();
        daemon.register(service).map_err(|e| AdvertiserError::Register(e.to_string()))?;

        info!(name = %candidate, port, "advertised DAAP service over mDNS");

        Ok(Self {
            daemon,
            fullname,
            advertised_name: candidate,
        })
    }

    pub fn advertised_name(&self) -> &str {
        &self.advertised_name
    }

    /// Browses briefly for `SERVICE_TYPE` instances already using
    /// `candidate`'s instance name. A real collision check would compare
    /// resolved addresses against our own; this server has no addresses
    /// to exclude yet at advertisement time, so any resolved match under
    /// the same instance name is treated as in-use.
    fn name_in_use(daemon: &ServiceDaemon, candidate: &str) -> bool {
        let receiver = match daemon.browse(SERVICE_TYPE) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "mDNS browse for collision check failed; assuming name is free");
                return false;
            }
        };
        let deadline = std::time::Instant::now() + COLLISION_PROBE_TIMEOUT;
        while std::time::Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if info.get_fullname().starts_with(&format!("{candidate}.")) {
                        return true;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        false
    }

    fn txt_properties(auth: AuthMethod, machine_id: &str) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        properties.insert("txtvers".to_string(), "1".to_string());
        properties.insert("Password".to_string(), (auth != AuthMethod::None).to_string());
        properties.insert("Machine Name".to_string(), gethostname::gethostname().to_string_lossy().to_string());
        properties.insert("Machine ID".to_string(), machine_id.to_string());
        properties
    }
}

impl Drop for ServiceAdvertiser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(error = %e, "failed to unregister mDNS service; swallowing per shutdown policy");
        }
    }
}

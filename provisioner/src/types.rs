use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

// ============================================================================
// Host identity
// ============================================================================

/// Identity of one fleet member, fixed before its worker starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// 0-based position in the fleet
    pub index: usize,
    /// Short hostname produced by the name template
    pub hostname: String,
    /// `hostname.domain`; also the VM name
    pub fqdn: String,
    pub ip: Ipv4Addr,
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.fqdn, self.ip)
    }
}

// ============================================================================
// Installer service
// ============================================================================

/// Registration record for the kickstart installer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickstartRequest {
    pub macaddress: String,
    pub password: String,
    pub hostname: String,
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub nameserver: String,
    pub vlanid: u16,
    pub keyboard: String,
    pub isofilename: String,
    pub cli: Vec<String>,
    pub notvmpgcreate: bool,
}

impl KickstartRequest {
    /// Path segment the installer keys registrations by
    pub fn mac_path_segment(&self) -> String {
        self.macaddress.replace(':', "-")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsxiVersionsResponse {
    pub uploaded_esxi_list: HashMap<String, String>,
}

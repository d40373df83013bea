use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::addressing::AddressPlan;
use crate::backend::BootFirmware;
use crate::error::{ProvisionError, Result};
use crate::naming::NameTemplate;
use crate::types::HostIdentity;

/// Fleet description, compatible with the installer tooling's `template.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub environment: Environment,
    #[serde(rename = "esxiInfo", alias = "esxi_info")]
    pub host: HostTemplate,
    #[serde(rename = "vmparameter", alias = "vm_parameter")]
    pub vm: VmShape,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub vcenter: VcenterConfig,
    /// Installer service base URL
    #[serde(rename = "kickstartserver", alias = "kickstart_server")]
    pub kickstart_server: String,
    /// Network used only while the host installs
    #[serde(rename = "bootportgroup", alias = "boot_port_group")]
    pub boot_port_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcenterConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub datacenter: String,
    #[serde(rename = "resourcepool", alias = "resource_pool")]
    pub resource_pool: String,
    #[serde(default)]
    pub folder: String,
    /// Skip TLS certificate verification
    #[serde(default = "default_insecure")]
    pub insecure: bool,
    /// Release segment of the VI/JSON endpoints (`/sdk/vim25/{release}`)
    #[serde(default = "default_api_release", rename = "apirelease", alias = "api_release")]
    pub api_release: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostTemplate {
    pub replica: usize,
    pub start_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub name_prefix: String,
    pub domain: String,
    pub password: String,
    pub nameserver: String,
    #[serde(default)]
    pub vlanid: u16,
    #[serde(default = "default_keyboard")]
    pub keyboard: String,
    pub isofilename: String,
    #[serde(default)]
    pub cli: Vec<String>,
    /// Ask the installer not to create the default VM port group
    #[serde(default, rename = "notvmpgcreate", alias = "not_vm_pg_create")]
    pub not_vm_pg_create: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmShape {
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub networks: Vec<String>,
    pub storages: Vec<StorageConfig>,
    #[serde(default, rename = "bootoption", alias = "boot_option")]
    pub boot_option: BootOption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuConfig {
    pub core: u32,
    #[serde(rename = "coreperscket", alias = "corepersocket", alias = "cores_per_socket")]
    pub cores_per_socket: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(rename = "memoryGB", alias = "memory_gb")]
    pub memory_gb: u64,
}

impl MemoryConfig {
    /// None when the size does not fit the API's integer
    pub fn memory_mb(&self) -> Option<u64> {
        self.memory_gb.checked_mul(1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub datastore: String,
    #[serde(rename = "capacityGB", alias = "capacity_gb")]
    pub capacity_gb: i64,
}

impl StorageConfig {
    pub fn capacity_kb(&self) -> Option<i64> {
        self.capacity_gb.checked_mul(1024 * 1024)
    }

    /// Disk size as the REST API takes it; None on overflow
    pub fn capacity_bytes(&self) -> Option<i64> {
        self.capacity_kb()?.checked_mul(1024)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirmwareKind {
    #[default]
    Bios,
    Efi,
    HttpEfi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootOption {
    #[serde(default)]
    pub firmware: FirmwareKind,
    #[serde(default, rename = "secureboot", alias = "secure_boot")]
    pub secure_boot: bool,
}

impl BootOption {
    pub fn firmware(&self) -> BootFirmware {
        match self.firmware {
            FirmwareKind::Bios => BootFirmware::Bios,
            FirmwareKind::Efi => BootFirmware::Efi {
                secure_boot: self.secure_boot,
            },
            FirmwareKind::HttpEfi => BootFirmware::HttpEfi {
                secure_boot: self.secure_boot,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_guest_ip_interval")]
    pub guest_ip_interval_secs: u64,
    #[serde(default = "default_power_state_interval")]
    pub power_state_interval_secs: u64,
    /// How long a cancelled run waits for workers before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            guest_ip_interval_secs: default_guest_ip_interval(),
            power_state_interval_secs: default_power_state_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl PollingConfig {
    pub fn guest_ip_interval(&self) -> Duration {
        Duration::from_secs(self.guest_ip_interval_secs)
    }

    pub fn power_state_interval(&self) -> Duration {
        Duration::from_secs(self.power_state_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_insecure() -> bool {
    true
}

fn default_api_release() -> String {
    "8.0.1.0".to_string()
}

fn default_keyboard() -> String {
    "US Default".to_string()
}

fn default_guest_ip_interval() -> u64 {
    60
}

fn default_power_state_interval() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    30
}

impl FleetConfig {
    /// Load YAML, or TOML when the file ends in `.toml`
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ProvisionError::config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            Self::from_toml(&text)
        } else {
            Self::from_yaml(&text)
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| ProvisionError::config(format!("invalid YAML config: {}", e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ProvisionError::config(format!("invalid TOML config: {}", e)))
    }

    /// Check everything that can be checked without talking to vCenter
    pub fn validate(&self) -> Result<()> {
        if self.environment.vcenter.api_release.trim().is_empty() {
            return Err(ProvisionError::config("vcenter.apirelease must not be empty"));
        }
        if self.environment.kickstart_server.trim().is_empty() {
            return Err(ProvisionError::config("kickstartserver must be set"));
        }
        if self.environment.boot_port_group.trim().is_empty() {
            return Err(ProvisionError::config("bootportgroup must be set"));
        }
        if self.vm.networks.is_empty() {
            return Err(ProvisionError::config("vmparameter.networks needs at least one network"));
        }
        if self.vm.storages.is_empty() {
            return Err(ProvisionError::config("vmparameter.storages needs at least one datastore"));
        }
        if let Some(storage) = self.vm.storages.iter().find(|s| s.capacity_gb <= 0) {
            return Err(ProvisionError::config(format!(
                "storage on {} must have a positive capacityGB",
                storage.datastore
            )));
        }
        if let Some(storage) = self.vm.storages.iter().find(|s| s.capacity_bytes().is_none()) {
            return Err(ProvisionError::config(format!(
                "storage on {} has an out-of-range capacityGB {}",
                storage.datastore, storage.capacity_gb
            )));
        }
        let cpu = &self.vm.cpu;
        if cpu.core == 0 || cpu.cores_per_socket == 0 || cpu.core % cpu.cores_per_socket != 0 {
            return Err(ProvisionError::config(format!(
                "cpu.core ({}) must be a positive multiple of coreperscket ({})",
                cpu.core, cpu.cores_per_socket
            )));
        }
        if self.vm.memory.memory_gb == 0 {
            return Err(ProvisionError::config("memory.memoryGB must be positive"));
        }
        if self.vm.memory.memory_mb().is_none() {
            return Err(ProvisionError::config(format!(
                "memory.memoryGB {} is out of range",
                self.vm.memory.memory_gb
            )));
        }
        if self.polling.guest_ip_interval_secs == 0 || self.polling.power_state_interval_secs == 0 {
            return Err(ProvisionError::config("polling intervals must be at least one second"));
        }

        self.plan_hosts().map(|_| ())
    }

    /// Identity of every fleet member, in index order
    pub fn plan_hosts(&self) -> Result<Vec<HostIdentity>> {
        let host = &self.host;
        let names = NameTemplate::parse(&host.name_prefix)?;
        names.check_range(host.replica)?;
        let addresses = AddressPlan::new(host.start_ip, host.netmask, host.gateway, host.replica)?;

        Ok(names
            .sequence(host.replica)
            .into_iter()
            .zip(addresses.addresses())
            .enumerate()
            .map(|(index, (hostname, ip))| {
                let fqdn = if host.domain.is_empty() {
                    hostname.clone()
                } else {
                    format!("{}.{}", hostname, host.domain)
                };
                HostIdentity {
                    index,
                    hostname,
                    fqdn,
                    ip,
                }
            })
            .collect())
    }
}

//! Virtualization backend abstraction
//!
//! The provisioning worker only talks to the management plane through
//! [`VirtualizationBackend`]. Each worker opens its own session through a
//! [`BackendConnector`], so sessions are never shared between hosts.

#[cfg(any(test, feature = "dev-stubs"))]
pub mod stub;
pub mod vsphere;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

// ============================================================================
// Managed object references
// ============================================================================

macro_rules! managed_ref {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

managed_ref!(DatacenterId);
managed_ref!(FolderId);
managed_ref!(ResourcePoolId);
managed_ref!(NetworkId);
managed_ref!(VmId);

/// Where a new VM is placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub datacenter: DatacenterId,
    pub folder: FolderId,
    pub resource_pool: ResourcePoolId,
}

// ============================================================================
// Devices
// ============================================================================

/// Backing of a network adapter, as resolved from a network name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkBacking {
    StandardPortgroup { network: NetworkId, name: String },
    DistributedPortgroup { network: NetworkId, name: String },
    OpaqueNetwork { network: NetworkId, name: String },
}

impl NetworkBacking {
    pub fn network(&self) -> &NetworkId {
        match self {
            Self::StandardPortgroup { network, .. }
            | Self::DistributedPortgroup { network, .. }
            | Self::OpaqueNetwork { network, .. } => network,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::StandardPortgroup { name, .. }
            | Self::DistributedPortgroup { name, .. }
            | Self::OpaqueNetwork { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiSharing {
    NoSharing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiController {
    pub key: i32,
    pub bus_number: i32,
    pub sharing: ScsiSharing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDisk {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: i32,
    pub capacity_kb: i64,
    pub datastore: String,
    /// `[datastore] dir/file.vmdk`
    pub file_name: String,
    pub thin_provisioned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAdapter {
    pub key: i32,
    /// Label assigned by the platform, e.g. `Network adapter 1`
    pub label: Option<String>,
    /// Empty when the platform should generate one
    pub mac_address: String,
    pub backing: NetworkBacking,
}

/// Closed set of virtual hardware the provisioner creates or edits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualDevice {
    ScsiController(ScsiController),
    Disk(VirtualDisk),
    NetworkAdapter(NetworkAdapter),
}

impl VirtualDevice {
    pub fn key(&self) -> i32 {
        match self {
            Self::ScsiController(c) => c.key,
            Self::Disk(d) => d.key,
            Self::NetworkAdapter(n) => n.key,
        }
    }
}

/// One entry of a device reconfiguration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    Add(VirtualDevice),
    Remove(VirtualDevice),
    Edit(VirtualDevice),
}

/// Allocates device keys that are unique within one device list
pub trait KeyAllocator: Send {
    fn next_key(&mut self) -> i32;
}

/// Temporary negative keys, counting down from -200; the platform replaces
/// them with real keys on creation.
#[derive(Debug)]
pub struct NegativeKeys {
    next: i32,
}

impl Default for NegativeKeys {
    fn default() -> Self {
        Self { next: -200 }
    }
}

impl KeyAllocator for NegativeKeys {
    fn next_key(&mut self) -> i32 {
        let key = self.next;
        self.next -= 1;
        key
    }
}

// ============================================================================
// VM configuration
// ============================================================================

/// Guest-OS identifiers for nested ESXi
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestOsId {
    Vmkernel6,
    Vmkernel65,
    Vmkernel7,
}

impl GuestOsId {
    /// Map an ESXi version reported by the installer; unknown versions are
    /// treated as the newest generation.
    pub fn from_esxi_version(version: &str) -> Self {
        match version {
            "6.0.0" => Self::Vmkernel6,
            "6.5.0" | "6.7.0" => Self::Vmkernel65,
            _ => Self::Vmkernel7,
        }
    }

    /// vSphere API guest id
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vmkernel6 => "vmkernel6Guest",
            Self::Vmkernel65 => "vmkernel65Guest",
            Self::Vmkernel7 => "vmkernel7Guest",
        }
    }
}

impl fmt::Display for GuestOsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootFirmware {
    Bios,
    Efi { secure_boot: bool },
    /// EFI with `networkBootProtocol = httpv4`
    HttpEfi { secure_boot: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfigSpec {
    pub name: String,
    pub guest_id: GuestOsId,
    pub num_cpus: u32,
    pub cores_per_socket: u32,
    pub memory_mb: u64,
    pub nested_hv: bool,
    pub firmware: BootFirmware,
    /// Datastore holding the VM files
    pub datastore: String,
    /// `[datastore]`
    pub vm_path_name: String,
    pub devices: Vec<VirtualDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

// ============================================================================
// Traits
// ============================================================================

/// Management-plane operations the provisioner depends on
///
/// Long-running operations (create, power, reconfigure) resolve only once the
/// platform reports the underlying task finished.
#[async_trait]
pub trait VirtualizationBackend: Send + Sync {
    async fn find_datacenter(&self, name: &str) -> Result<DatacenterId>;

    /// Resolve a VM folder path relative to the datacenter's VM folder
    async fn find_folder(&self, datacenter: &DatacenterId, path: &str) -> Result<FolderId>;

    async fn find_resource_pool(&self, datacenter: &DatacenterId, name: &str) -> Result<ResourcePoolId>;

    async fn network_backing(&self, datacenter: &DatacenterId, name: &str) -> Result<NetworkBacking>;

    /// `Ok(None)` means the VM does not exist; any other failure is an error
    async fn find_vm(&self, datacenter: &DatacenterId, name: &str) -> Result<Option<VmId>>;

    async fn create_vm(&self, placement: &Placement, spec: &VmConfigSpec) -> Result<VmId>;

    async fn power_on(&self, vm: &VmId) -> Result<()>;

    async fn shutdown_guest(&self, vm: &VmId) -> Result<()>;

    async fn power_state(&self, vm: &VmId) -> Result<PowerState>;

    async fn reconfigure(&self, vm: &VmId, changes: &[DeviceChange]) -> Result<()>;

    async fn hardware_devices(&self, vm: &VmId) -> Result<Vec<VirtualDevice>>;

    /// Primary guest IP as reported by the guest tools, if any
    async fn guest_ip(&self, vm: &VmId) -> Result<Option<String>>;

    fn key_allocator(&self) -> Box<dyn KeyAllocator> {
        Box::new(NegativeKeys::default())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens independent backend sessions, one per worker
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn VirtualizationBackend>>;
}

//! Virtual hardware for a new nested ESXi VM.

use crate::backend::{
    GuestOsId, KeyAllocator, NetworkAdapter, NetworkBacking, ScsiController, ScsiSharing,
    VirtualDevice, VirtualDisk, VmConfigSpec,
};
use crate::config::{StorageConfig, VmShape};

/// Unit number the SCSI controller itself occupies on its bus
const SCSI_CONTROLLER_UNIT: i32 = 7;

/// Builds the device list for one VM
pub struct DeviceSpecBuilder<'a> {
    vm_name: &'a str,
    keys: Box<dyn KeyAllocator>,
    devices: Vec<VirtualDevice>,
    controller_key: Option<i32>,
}

impl<'a> DeviceSpecBuilder<'a> {
    pub fn new(vm_name: &'a str, keys: Box<dyn KeyAllocator>) -> Self {
        Self {
            vm_name,
            keys,
            devices: Vec::new(),
            controller_key: None,
        }
    }

    /// Paravirtual SCSI controller on bus 0, no bus sharing
    pub fn scsi_controller(&mut self) -> i32 {
        if let Some(key) = self.controller_key {
            return key;
        }
        let key = self.keys.next_key();
        self.devices.push(VirtualDevice::ScsiController(ScsiController {
            key,
            bus_number: 0,
            sharing: ScsiSharing::NoSharing,
        }));
        self.controller_key = Some(key);
        key
    }

    /// One thin disk per storage entry, in order
    pub fn disks(&mut self, storages: &[StorageConfig]) -> &mut Self {
        let controller_key = self.scsi_controller();
        for (index, storage) in storages.iter().enumerate() {
            let key = self.keys.next_key();
            self.devices.push(VirtualDevice::Disk(VirtualDisk {
                key,
                controller_key,
                unit_number: disk_unit_number(index),
                capacity_kb: storage.capacity_kb().unwrap_or(i64::MAX),
                datastore: storage.datastore.clone(),
                file_name: disk_file_name(&storage.datastore, self.vm_name, index),
                thin_provisioned: true,
            }));
        }
        self
    }

    /// One adapter per configured network; the first is always bound to the
    /// boot network no matter what `configured[0]` says.
    pub fn network_adapters(&mut self, boot: &NetworkBacking, configured: &[NetworkBacking]) -> &mut Self {
        for (index, backing) in configured.iter().enumerate() {
            let backing = if index == 0 { boot } else { backing };
            let key = self.keys.next_key();
            self.devices.push(VirtualDevice::NetworkAdapter(NetworkAdapter {
                key,
                label: None,
                mac_address: String::new(),
                backing: backing.clone(),
            }));
        }
        self
    }

    pub fn build(self) -> Vec<VirtualDevice> {
        self.devices
    }
}

/// Full creation spec for a nested ESXi VM
///
/// VM files live on the first storage entry's datastore. `configured` holds
/// the resolved backings of `shape.networks`, in order.
pub fn vm_config_spec(
    name: &str,
    shape: &VmShape,
    guest_id: GuestOsId,
    boot: &NetworkBacking,
    configured: &[NetworkBacking],
    keys: Box<dyn KeyAllocator>,
) -> VmConfigSpec {
    let datastore = shape
        .storages
        .first()
        .map(|s| s.datastore.clone())
        .unwrap_or_default();

    let mut builder = DeviceSpecBuilder::new(name, keys);
    builder.disks(&shape.storages).network_adapters(boot, configured);

    VmConfigSpec {
        name: name.to_string(),
        guest_id,
        num_cpus: shape.cpu.core,
        cores_per_socket: shape.cpu.cores_per_socket,
        memory_mb: shape.memory.memory_mb().unwrap_or(u64::MAX),
        nested_hv: true,
        firmware: shape.boot_option.firmware(),
        vm_path_name: format!("[{}]", datastore),
        datastore,
        devices: builder.build(),
    }
}

/// Disk index -> SCSI unit number, skipping the controller's unit
pub fn disk_unit_number(index: usize) -> i32 {
    let unit = index as i32;
    if unit >= SCSI_CONTROLLER_UNIT {
        unit + 1
    } else {
        unit
    }
}

pub fn disk_file_name(datastore: &str, vm_name: &str, index: usize) -> String {
    if index == 0 {
        format!("[{}] {}/{}.vmdk", datastore, vm_name, vm_name)
    } else {
        format!("[{}] {}/{}_{}.vmdk", datastore, vm_name, vm_name, index)
    }
}

//! In-memory vCenter for tests and local development
//!
//! Sessions handed out by [`StubBackend::connect`] share one inventory, so a
//! test can seed objects, run workers, and inspect the recorded calls.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    BackendConnector, DatacenterId, DeviceChange, FolderId, NetworkAdapter, NetworkBacking,
    NetworkId, Placement, PowerState, ResourcePoolId, VirtualDevice, VirtualizationBackend,
    VmConfigSpec, VmId,
};
use crate::error::{ProvisionError, Result};

/// Operations recorded by the stub, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Connect,
    FindVm(String),
    CreateVm(String),
    PowerOn(String),
    ShutdownGuest(String),
    Reconfigure(String, Vec<DeviceChange>),
    Disconnect,
}

#[derive(Debug)]
struct StubVm {
    name: String,
    spec: Option<VmConfigSpec>,
    power: PowerState,
    devices: Vec<VirtualDevice>,
    guest_ip_reads: usize,
    reads_since_power_on: usize,
    power_reads_since_shutdown: Option<usize>,
}

#[derive(Debug, Default)]
struct StubState {
    datacenters: HashSet<String>,
    folders: HashSet<String>,
    resource_pools: HashSet<String>,
    networks: HashMap<String, NetworkBacking>,
    vms: HashMap<String, StubVm>,
    /// vm name -> (ip, reads after power on before the ip shows up)
    guest_ips: HashMap<String, (String, usize)>,
    shutdown_delay: usize,
    task_latency: Duration,
    failures: HashSet<(String, &'static str)>,
    calls: Vec<BackendCall>,
    next_vm: u32,
    next_mac: u32,
}

#[derive(Clone, Default)]
pub struct StubBackend {
    state: Arc<Mutex<StubState>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().expect("stub backend state poisoned")
    }

    pub fn with_datacenter(self, name: &str) -> Self {
        self.lock().datacenters.insert(name.to_string());
        self
    }

    /// Folder path relative to the datacenter's VM folder
    pub fn with_folder(self, path: &str) -> Self {
        self.lock().folders.insert(path.trim_matches('/').to_string());
        self
    }

    pub fn with_resource_pool(self, name: &str) -> Self {
        self.lock().resource_pools.insert(name.to_string());
        self
    }

    pub fn with_network(self, name: &str) -> Self {
        let backing = NetworkBacking::StandardPortgroup {
            network: NetworkId(format!("network-{}", name)),
            name: name.to_string(),
        };
        self.lock().networks.insert(name.to_string(), backing);
        self
    }

    /// Guest tools report `ip` on the `after`-th read following a power on
    pub fn set_guest_ip_after(&self, vm_name: &str, ip: &str, after: usize) {
        self.lock()
            .guest_ips
            .insert(vm_name.to_string(), (ip.to_string(), after));
    }

    /// Power state reads that still report powered on after a guest shutdown
    pub fn set_shutdown_delay(&self, reads: usize) {
        self.lock().shutdown_delay = reads;
    }

    /// Simulated duration of create, power and reconfigure tasks
    pub fn set_task_latency(&self, latency: Duration) {
        self.lock().task_latency = latency;
    }

    /// Make `operation` fail for the named VM
    pub fn fail_operation(&self, vm_name: &str, operation: &'static str) {
        self.lock().failures.insert((vm_name.to_string(), operation));
    }

    /// Seed an existing, powered-off VM
    pub fn insert_vm(&self, name: &str) -> VmId {
        let mut state = self.lock();
        state.next_vm += 1;
        let id = VmId(format!("vm-{}", state.next_vm));
        state.vms.insert(
            id.0.clone(),
            StubVm {
                name: name.to_string(),
                spec: None,
                power: PowerState::PoweredOff,
                devices: Vec::new(),
                guest_ip_reads: 0,
                reads_since_power_on: 0,
                power_reads_since_shutdown: None,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn vm_id(&self, name: &str) -> Option<VmId> {
        self.lock()
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(id, _)| VmId(id.clone()))
    }

    pub fn vm_spec(&self, vm: &VmId) -> Option<VmConfigSpec> {
        self.lock().vms.get(&vm.0).and_then(|v| v.spec.clone())
    }

    pub fn vm_devices(&self, vm: &VmId) -> Vec<VirtualDevice> {
        self.lock()
            .vms
            .get(&vm.0)
            .map(|v| v.devices.clone())
            .unwrap_or_default()
    }

    pub fn guest_ip_reads(&self, vm: &VmId) -> usize {
        self.lock().vms.get(&vm.0).map(|v| v.guest_ip_reads).unwrap_or(0)
    }
}

#[async_trait]
impl BackendConnector for StubBackend {
    async fn connect(&self) -> Result<Box<dyn VirtualizationBackend>> {
        self.lock().calls.push(BackendCall::Connect);
        Ok(Box::new(self.clone()))
    }
}

impl StubBackend {
    fn check_failure(state: &StubState, vm_name: &str, operation: &'static str) -> Result<()> {
        if state.failures.contains(&(vm_name.to_string(), operation)) {
            return Err(ProvisionError::backend(operation, "injected failure"));
        }
        Ok(())
    }

    fn vm_name(state: &StubState, vm: &VmId) -> Result<String> {
        state
            .vms
            .get(&vm.0)
            .map(|v| v.name.clone())
            .ok_or_else(|| ProvisionError::backend("lookup", format!("unknown VM {}", vm)))
    }

    async fn task_latency(&self) {
        let latency = self.lock().task_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_mac(state: &mut StubState) -> String {
        state.next_mac += 1;
        let n = state.next_mac;
        format!("00:50:56:{:02x}:{:02x}:{:02x}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
    }

    /// Lowest adapter number whose label is free, as vCenter assigns them
    fn free_adapter_ordinal(devices: &[VirtualDevice]) -> usize {
        let used: HashSet<&str> = devices
            .iter()
            .filter_map(|d| match d {
                VirtualDevice::NetworkAdapter(n) => n.label.as_deref(),
                _ => None,
            })
            .collect();
        (1..)
            .find(|n| !used.contains(format!("Network adapter {}", n).as_str()))
            .unwrap_or(1)
    }

    /// Assign platform keys, labels and MACs to an added adapter
    fn materialize_adapter(state: &mut StubState, devices: &[VirtualDevice], adapter: &NetworkAdapter) -> VirtualDevice {
        let ordinal = Self::free_adapter_ordinal(devices);
        let key = devices
            .iter()
            .map(|d| d.key())
            .filter(|k| *k >= 4000)
            .max()
            .map(|k| k + 1)
            .unwrap_or(4000);
        let mac_address = if adapter.mac_address.is_empty() {
            Self::next_mac(state)
        } else {
            adapter.mac_address.clone()
        };
        VirtualDevice::NetworkAdapter(NetworkAdapter {
            key,
            label: Some(format!("Network adapter {}", ordinal)),
            mac_address,
            backing: adapter.backing.clone(),
        })
    }
}

#[async_trait]
impl VirtualizationBackend for StubBackend {
    async fn find_datacenter(&self, name: &str) -> Result<DatacenterId> {
        if self.lock().datacenters.contains(name) {
            Ok(DatacenterId(format!("datacenter-{}", name)))
        } else {
            Err(ProvisionError::not_found("datacenter", name))
        }
    }

    async fn find_folder(&self, _datacenter: &DatacenterId, path: &str) -> Result<FolderId> {
        let path = path.trim_matches('/');
        if path.is_empty() || self.lock().folders.contains(path) {
            Ok(FolderId(format!("group-{}", path)))
        } else {
            Err(ProvisionError::not_found("folder", path))
        }
    }

    async fn find_resource_pool(&self, _datacenter: &DatacenterId, name: &str) -> Result<ResourcePoolId> {
        if self.lock().resource_pools.contains(name) {
            Ok(ResourcePoolId(format!("resgroup-{}", name)))
        } else {
            Err(ProvisionError::not_found("resource pool", name))
        }
    }

    async fn network_backing(&self, _datacenter: &DatacenterId, name: &str) -> Result<NetworkBacking> {
        self.lock()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| ProvisionError::not_found("network", name))
    }

    async fn find_vm(&self, _datacenter: &DatacenterId, name: &str) -> Result<Option<VmId>> {
        let mut state = self.lock();
        state.calls.push(BackendCall::FindVm(name.to_string()));
        Self::check_failure(&state, name, "find_vm")?;
        Ok(state
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(id, _)| VmId(id.clone())))
    }

    async fn create_vm(&self, placement: &Placement, spec: &VmConfigSpec) -> Result<VmId> {
        {
            let mut state = self.lock();
            state.calls.push(BackendCall::CreateVm(spec.name.clone()));
            Self::check_failure(&state, &spec.name, "create_vm")?;
            if !placement.resource_pool.0.starts_with("resgroup-") {
                return Err(ProvisionError::backend("create_vm", "invalid resource pool"));
            }
        }
        self.task_latency().await;

        let mut state = self.lock();
        let mut devices: Vec<VirtualDevice> = Vec::new();
        let mut controller_key = 1000;
        for device in &spec.devices {
            let materialized = match device {
                VirtualDevice::ScsiController(c) => {
                    let mut c = c.clone();
                    c.key = 1000 + c.bus_number;
                    controller_key = c.key;
                    VirtualDevice::ScsiController(c)
                }
                VirtualDevice::Disk(d) => {
                    let mut d = d.clone();
                    d.key = 2000 + d.unit_number;
                    d.controller_key = controller_key;
                    VirtualDevice::Disk(d)
                }
                VirtualDevice::NetworkAdapter(n) => Self::materialize_adapter(&mut state, &devices, n),
            };
            devices.push(materialized);
        }

        state.next_vm += 1;
        let id = VmId(format!("vm-{}", state.next_vm));
        state.vms.insert(
            id.0.clone(),
            StubVm {
                name: spec.name.clone(),
                spec: Some(spec.clone()),
                power: PowerState::PoweredOff,
                devices,
                guest_ip_reads: 0,
                reads_since_power_on: 0,
                power_reads_since_shutdown: None,
            },
        );
        Ok(id)
    }

    async fn power_on(&self, vm: &VmId) -> Result<()> {
        {
            let mut state = self.lock();
            let name = Self::vm_name(&state, vm)?;
            state.calls.push(BackendCall::PowerOn(name.clone()));
            Self::check_failure(&state, &name, "power_on")?;
        }
        self.task_latency().await;

        let mut state = self.lock();
        if let Some(v) = state.vms.get_mut(&vm.0) {
            v.power = PowerState::PoweredOn;
            v.reads_since_power_on = 0;
            v.power_reads_since_shutdown = None;
        }
        Ok(())
    }

    async fn shutdown_guest(&self, vm: &VmId) -> Result<()> {
        let mut state = self.lock();
        let name = Self::vm_name(&state, vm)?;
        state.calls.push(BackendCall::ShutdownGuest(name.clone()));
        Self::check_failure(&state, &name, "shutdown_guest")?;
        if let Some(v) = state.vms.get_mut(&vm.0) {
            v.power_reads_since_shutdown = Some(0);
        }
        Ok(())
    }

    async fn power_state(&self, vm: &VmId) -> Result<PowerState> {
        let mut state = self.lock();
        let delay = state.shutdown_delay;
        let v = state
            .vms
            .get_mut(&vm.0)
            .ok_or_else(|| ProvisionError::backend("power_state", format!("unknown VM {}", vm)))?;
        if let Some(reads) = v.power_reads_since_shutdown {
            if reads >= delay {
                v.power = PowerState::PoweredOff;
                v.power_reads_since_shutdown = None;
            } else {
                v.power_reads_since_shutdown = Some(reads + 1);
            }
        }
        Ok(v.power)
    }

    async fn reconfigure(&self, vm: &VmId, changes: &[DeviceChange]) -> Result<()> {
        {
            let mut state = self.lock();
            let name = Self::vm_name(&state, vm)?;
            state
                .calls
                .push(BackendCall::Reconfigure(name.clone(), changes.to_vec()));
            Self::check_failure(&state, &name, "reconfigure")?;
        }
        self.task_latency().await;

        let mut state = self.lock();
        let mut devices = state
            .vms
            .get(&vm.0)
            .map(|v| v.devices.clone())
            .unwrap_or_default();

        for change in changes {
            match change {
                DeviceChange::Remove(device) => {
                    let before = devices.len();
                    devices.retain(|d| d.key() != device.key());
                    if devices.len() == before {
                        return Err(ProvisionError::backend(
                            "reconfigure",
                            format!("no device with key {}", device.key()),
                        ));
                    }
                }
                DeviceChange::Edit(device) => {
                    let slot = devices
                        .iter_mut()
                        .find(|d| d.key() == device.key())
                        .ok_or_else(|| {
                            ProvisionError::backend("reconfigure", format!("no device with key {}", device.key()))
                        })?;
                    *slot = device.clone();
                }
                DeviceChange::Add(VirtualDevice::NetworkAdapter(adapter)) => {
                    let added = Self::materialize_adapter(&mut state, &devices, adapter);
                    devices.push(added);
                }
                DeviceChange::Add(device) => devices.push(device.clone()),
            }
        }

        if let Some(v) = state.vms.get_mut(&vm.0) {
            v.devices = devices;
        }
        Ok(())
    }

    async fn hardware_devices(&self, vm: &VmId) -> Result<Vec<VirtualDevice>> {
        let state = self.lock();
        state
            .vms
            .get(&vm.0)
            .map(|v| v.devices.clone())
            .ok_or_else(|| ProvisionError::backend("hardware_devices", format!("unknown VM {}", vm)))
    }

    async fn guest_ip(&self, vm: &VmId) -> Result<Option<String>> {
        let mut state = self.lock();
        let name = Self::vm_name(&state, vm)?;
        Self::check_failure(&state, &name, "guest_ip")?;
        let configured = state.guest_ips.get(&name).cloned();

        let v = state
            .vms
            .get_mut(&vm.0)
            .ok_or_else(|| ProvisionError::backend("guest_ip", format!("unknown VM {}", vm)))?;
        v.guest_ip_reads += 1;
        if v.power != PowerState::PoweredOn {
            return Ok(None);
        }
        v.reads_since_power_on += 1;

        Ok(match configured {
            Some((ip, after)) if v.reads_since_power_on > after => Some(ip),
            _ => None,
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.lock().calls.push(BackendCall::Disconnect);
        Ok(())
    }
}

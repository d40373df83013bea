//! vCenter adapter over the vSphere Automation REST API (`/api`).
//!
//! Create, power and reconfigure calls are synchronous in this API: the HTTP
//! response arrives once vCenter has finished the underlying task.
//!
//! Settings the REST create spec has no field for (nested hardware
//! virtualization, secure boot, HTTP network boot, disks on a datastore other
//! than the VM's) go through one `ReconfigVM_Task` on the VI/JSON API
//! (`/sdk/vim25/{release}`), which accepts the same session token.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    BackendConnector, BootFirmware, DatacenterId, DeviceChange, FolderId, GuestOsId, NetworkAdapter,
    NetworkBacking, NetworkId, Placement, PowerState, ResourcePoolId, VirtualDevice,
    VirtualDisk, VirtualizationBackend, VmConfigSpec, VmId,
};
use crate::config::VcenterConfig;
use crate::error::{ProvisionError, Result};

const SESSION_HEADER: &str = "vmware-api-session-id";

const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Opens one REST session (and one HTTP connection pool) per worker
pub struct VsphereConnector {
    base_url: String,
    username: String,
    password: String,
    insecure: bool,
    api_release: String,
}

impl VsphereConnector {
    pub fn new(cfg: &VcenterConfig) -> Self {
        let base_url = if cfg.hostname.starts_with("http://") || cfg.hostname.starts_with("https://") {
            cfg.hostname.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", cfg.hostname.trim_end_matches('/'))
        };

        Self {
            base_url,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            insecure: cfg.insecure,
            api_release: cfg.api_release.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BackendConnector for VsphereConnector {
    async fn connect(&self) -> Result<Box<dyn VirtualizationBackend>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .map_err(|e| ProvisionError::backend("connect", format!("failed to create HTTP client: {}", e)))?;

        let url = format!("{}/api/session", self.base_url);
        debug!("Opening vCenter session at {}", url);

        let resp = client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ProvisionError::backend("connect", e))?;
        let resp = check_status(resp, "connect").await?;
        let token = resp
            .json::<String>()
            .await
            .map_err(|e| ProvisionError::backend("connect", format!("invalid session token: {}", e)))?;

        Ok(Box::new(VsphereSession {
            base_url: self.base_url.clone(),
            api_release: self.api_release.clone(),
            client,
            token,
        }))
    }
}

async fn check_status(resp: Response, operation: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProvisionError::backend(operation, format!("HTTP {}: {}", status.as_u16(), body)))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
}

#[derive(Debug, Deserialize)]
struct DatacenterInfo {
    vm_folder: String,
}

#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
}

#[derive(Debug, Deserialize)]
struct ResourcePoolSummary {
    resource_pool: String,
}

#[derive(Debug, Deserialize)]
struct NetworkSummary {
    network: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DatastoreSummary {
    datastore: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NicSummary {
    nic: String,
}

#[derive(Debug, Deserialize)]
struct ScsiAdapterSummary {
    adapter: String,
}

#[derive(Debug, Deserialize)]
struct NicInfo {
    label: Option<String>,
    mac_address: Option<String>,
    backing: BackingInfo,
}

#[derive(Debug, Deserialize)]
struct BackingInfo {
    #[serde(rename = "type")]
    kind: String,
    network: Option<String>,
    network_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct BackingSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    network: String,
}

#[derive(Debug, Serialize)]
struct NicCreateSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    start_connected: bool,
    mac_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mac_address: Option<String>,
    backing: BackingSpec,
}

#[derive(Debug, Serialize)]
struct NicUpdateSpec {
    backing: BackingSpec,
}

#[derive(Debug, Serialize)]
struct VmCreateSpec {
    name: String,
    #[serde(rename = "guest_OS")]
    guest_os: &'static str,
    placement: PlacementSpec,
    boot: BootSpec,
    cpu: CpuSpec,
    memory: MemorySpec,
    scsi_adapters: Vec<ScsiAdapterSpec>,
    disks: Vec<DiskSpec>,
    nics: Vec<NicCreateSpec>,
}

#[derive(Debug, Serialize)]
struct PlacementSpec {
    folder: String,
    resource_pool: String,
    datastore: String,
}

#[derive(Debug, Serialize)]
struct BootSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    network_protocol: &'static str,
}

#[derive(Debug, Serialize)]
struct CpuSpec {
    count: u32,
    cores_per_socket: u32,
}

#[derive(Debug, Serialize)]
struct MemorySpec {
    #[serde(rename = "size_MiB")]
    size_mib: u64,
}

#[derive(Debug, Serialize)]
struct ScsiAdapterSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    bus: i32,
    sharing: &'static str,
}

#[derive(Debug, Serialize)]
struct DiskSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    scsi: ScsiAddress,
    new_vmdk: NewVmdk,
}

#[derive(Debug, Serialize)]
struct ScsiAddress {
    bus: i32,
    unit: i32,
}

#[derive(Debug, Serialize)]
struct NewVmdk {
    name: String,
    capacity: i64,
}

// VI/JSON types carry their vSphere type in `_typeName`

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManagedObjectReference {
    #[serde(rename = "_typeName", default = "moref_type_name")]
    type_name: String,
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

fn moref_type_name() -> String {
    "ManagedObjectReference".to_string()
}

impl ManagedObjectReference {
    fn new(kind: &str, value: &str) -> Self {
        Self {
            type_name: moref_type_name(),
            kind: kind.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReconfigRequest {
    spec: VimConfigSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VimConfigSpec {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    #[serde(rename = "nestedHVEnabled")]
    nested_hv_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    boot_options: Option<VimBootOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_config: Vec<VimOptionValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    device_change: Vec<VimDeviceConfigSpec>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VimBootOptions {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    efi_secure_boot_enabled: bool,
}

#[derive(Debug, Serialize)]
struct VimOptionValue {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    key: &'static str,
    value: VimString,
}

#[derive(Debug, Serialize)]
struct VimString {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    #[serde(rename = "_value")]
    value: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VimDeviceConfigSpec {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    operation: &'static str,
    file_operation: &'static str,
    device: VimDisk,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VimDisk {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    key: i32,
    controller_key: i32,
    unit_number: i32,
    #[serde(rename = "capacityInKB")]
    capacity_in_kb: i64,
    backing: VimDiskBacking,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VimDiskBacking {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    file_name: String,
    disk_mode: &'static str,
    thin_provisioned: bool,
    datastore: ManagedObjectReference,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    state: String,
    #[serde(default)]
    error: Option<MethodFault>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodFault {
    #[serde(default)]
    localized_message: Option<String>,
}

fn guest_os_name(id: GuestOsId) -> &'static str {
    match id {
        GuestOsId::Vmkernel6 => "VMKERNEL6",
        GuestOsId::Vmkernel65 => "VMKERNEL65",
        GuestOsId::Vmkernel7 => "VMKERNEL7",
    }
}

fn backing_spec(backing: &NetworkBacking) -> BackingSpec {
    let kind = match backing {
        NetworkBacking::StandardPortgroup { .. } => "STANDARD_PORTGROUP",
        NetworkBacking::DistributedPortgroup { .. } => "DISTRIBUTED_PORTGROUP",
        NetworkBacking::OpaqueNetwork { .. } => "OPAQUE_NETWORK",
    };
    BackingSpec {
        kind,
        network: backing.network().0.clone(),
    }
}

fn parse_backing(kind: &str, network: String, name: String) -> Result<NetworkBacking> {
    let network = NetworkId(network);
    match kind {
        "STANDARD_PORTGROUP" => Ok(NetworkBacking::StandardPortgroup { network, name }),
        "DISTRIBUTED_PORTGROUP" => Ok(NetworkBacking::DistributedPortgroup { network, name }),
        "OPAQUE_NETWORK" => Ok(NetworkBacking::OpaqueNetwork { network, name }),
        other => Err(ProvisionError::backend(
            "network backing",
            format!("unsupported network type {}", other),
        )),
    }
}

/// `[ds] dir/name_1.vmdk` -> `name_1`
fn vmdk_stem(file_name: &str) -> String {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    let base = base.rsplit(' ').next().unwrap_or(base);
    base.trim_end_matches(".vmdk").to_string()
}

/// Settings applied after the REST create. `extra_disks` are already bound
/// to their datastore and the VM's SCSI controller.
fn vim_config_spec(spec: &VmConfigSpec, extra_disks: Vec<VimDeviceConfigSpec>) -> VimConfigSpec {
    let secure_boot = match spec.firmware {
        BootFirmware::Bios => false,
        BootFirmware::Efi { secure_boot } | BootFirmware::HttpEfi { secure_boot } => secure_boot,
    };
    let extra_config = match spec.firmware {
        BootFirmware::HttpEfi { .. } => vec![VimOptionValue {
            type_name: "OptionValue",
            key: "networkBootProtocol",
            value: VimString {
                type_name: "string",
                value: "httpv4",
            },
        }],
        _ => Vec::new(),
    };

    VimConfigSpec {
        type_name: "VirtualMachineConfigSpec",
        nested_hv_enabled: spec.nested_hv,
        boot_options: secure_boot.then_some(VimBootOptions {
            type_name: "VirtualMachineBootOptions",
            efi_secure_boot_enabled: true,
        }),
        extra_config,
        device_change: extra_disks,
    }
}

fn vim_disk_add(disk: &VirtualDisk, controller_key: i32, datastore: ManagedObjectReference) -> VimDeviceConfigSpec {
    VimDeviceConfigSpec {
        type_name: "VirtualDeviceConfigSpec",
        operation: "add",
        file_operation: "create",
        device: VimDisk {
            type_name: "VirtualDisk",
            key: disk.key,
            controller_key,
            unit_number: disk.unit_number,
            capacity_in_kb: disk.capacity_kb,
            backing: VimDiskBacking {
                type_name: "VirtualDiskFlatVer2BackingInfo",
                file_name: disk.file_name.clone(),
                disk_mode: "persistent",
                thin_provisioned: disk.thin_provisioned,
                datastore,
            },
        },
    }
}

fn nic_create_spec(adapter: &NetworkAdapter) -> NicCreateSpec {
    let manual = !adapter.mac_address.is_empty();
    NicCreateSpec {
        kind: "VMXNET3",
        start_connected: true,
        mac_type: if manual { "MANUAL" } else { "GENERATED" },
        mac_address: manual.then(|| adapter.mac_address.clone()),
        backing: backing_spec(&adapter.backing),
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct VsphereSession {
    base_url: String,
    api_release: String,
    client: Client,
    token: String,
}

impl VsphereSession {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api{}", self.base_url, path);
        debug!("vCenter {} {}", method, url);
        self.client
            .request(method, url)
            .header(SESSION_HEADER, &self.token)
    }

    fn vim_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/sdk/vim25/{}{}", self.base_url, self.api_release, path);
        debug!("vCenter {} {}", method, url);
        self.client
            .request(method, url)
            .header(SESSION_HEADER, &self.token)
    }

    async fn send(&self, req: RequestBuilder, operation: &str) -> Result<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| ProvisionError::backend(operation, e))?;
        check_status(resp, operation).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)], operation: &str) -> Result<T> {
        let resp = self
            .send(self.request(Method::GET, path).query(query), operation)
            .await?;
        resp.json::<T>()
            .await
            .map_err(|e| ProvisionError::backend(operation, format!("invalid response: {}", e)))
    }

    async fn datastore_id(&self, datacenter: Option<&DatacenterId>, name: &str) -> Result<String> {
        let mut query = vec![("names", name)];
        if let Some(dc) = datacenter {
            query.push(("datacenters", dc.0.as_str()));
        }
        let found: Vec<DatastoreSummary> = self
            .get_json("/vcenter/datastore", &query, "find datastore")
            .await?;
        found
            .into_iter()
            .next()
            .map(|d| d.datastore)
            .ok_or_else(|| ProvisionError::not_found("datastore", name))
    }

    async fn nic(&self, vm: &VmId, nic: &str) -> Result<NetworkAdapter> {
        let path = format!("/vcenter/vm/{}/hardware/ethernet/{}", vm, nic);
        let info: NicInfo = self.get_json(&path, &[], "read network adapter").await?;
        let key = nic
            .parse::<i32>()
            .map_err(|_| ProvisionError::backend("read network adapter", format!("unexpected nic id {}", nic)))?;
        let backing = parse_backing(
            &info.backing.kind,
            info.backing.network.unwrap_or_default(),
            info.backing.network_name.unwrap_or_default(),
        )?;
        Ok(NetworkAdapter {
            key,
            label: info.label,
            mac_address: info.mac_address.unwrap_or_default(),
            backing,
        })
    }

    async fn scsi_controller_key(&self, vm: &VmId) -> Result<i32> {
        let adapters: Vec<ScsiAdapterSummary> = self
            .get_json(
                &format!("/vcenter/vm/{}/hardware/adapter/scsi", vm),
                &[],
                "list SCSI adapters",
            )
            .await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::not_found("SCSI adapter", vm.0.as_str()))?;
        adapter.adapter.parse::<i32>().map_err(|_| {
            ProvisionError::backend("list SCSI adapters", format!("unexpected adapter id {}", adapter.adapter))
        })
    }

    async fn wait_for_task(&self, task: &ManagedObjectReference, operation: &str) -> Result<()> {
        let path = format!("/Task/{}/info", task.value);
        loop {
            let resp = self
                .send(self.vim_request(Method::GET, &path), operation)
                .await?;
            let info = resp
                .json::<TaskInfo>()
                .await
                .map_err(|e| ProvisionError::backend(operation, format!("invalid task info: {}", e)))?;
            match info.state.as_str() {
                "success" => return Ok(()),
                "error" => {
                    let reason = info
                        .error
                        .and_then(|fault| fault.localized_message)
                        .unwrap_or_else(|| format!("task {} failed", task.value));
                    return Err(ProvisionError::backend(operation, reason));
                }
                _ => tokio::time::sleep(TASK_POLL_INTERVAL).await,
            }
        }
    }

    /// Nested HV, boot options and disks on other datastores
    async fn apply_vim_settings(
        &self,
        vm: &VmId,
        datacenter: &DatacenterId,
        spec: &VmConfigSpec,
        extra_disks: &[&VirtualDisk],
    ) -> Result<()> {
        let mut device_change = Vec::with_capacity(extra_disks.len());
        if !extra_disks.is_empty() {
            let controller_key = self.scsi_controller_key(vm).await?;
            for disk in extra_disks {
                let datastore = self.datastore_id(Some(datacenter), &disk.datastore).await?;
                device_change.push(vim_disk_add(
                    disk,
                    controller_key,
                    ManagedObjectReference::new("Datastore", &datastore),
                ));
            }
        }

        let body = ReconfigRequest {
            spec: vim_config_spec(spec, device_change),
        };
        let path = format!("/VirtualMachine/{}/ReconfigVM_Task", vm);
        let resp = self
            .send(self.vim_request(Method::POST, &path).json(&body), "reconfigure VM")
            .await?;
        let task = resp
            .json::<ManagedObjectReference>()
            .await
            .map_err(|e| ProvisionError::backend("reconfigure VM", format!("invalid task reference: {}", e)))?;
        self.wait_for_task(&task, "reconfigure VM").await
    }
}

#[async_trait]
impl VirtualizationBackend for VsphereSession {
    async fn find_datacenter(&self, name: &str) -> Result<DatacenterId> {
        let found: Vec<DatacenterSummary> = self
            .get_json("/vcenter/datacenter", &[("names", name)], "find datacenter")
            .await?;
        found
            .into_iter()
            .next()
            .map(|d| DatacenterId(d.datacenter))
            .ok_or_else(|| ProvisionError::not_found("datacenter", name))
    }

    async fn find_folder(&self, datacenter: &DatacenterId, path: &str) -> Result<FolderId> {
        let leaf = path.split('/').filter(|s| !s.is_empty()).last();
        let Some(leaf) = leaf else {
            let info: DatacenterInfo = self
                .get_json(&format!("/vcenter/datacenter/{}", datacenter), &[], "read datacenter")
                .await?;
            return Ok(FolderId(info.vm_folder));
        };

        let found: Vec<FolderSummary> = self
            .get_json(
                "/vcenter/folder",
                &[
                    ("names", leaf),
                    ("type", "VIRTUAL_MACHINE"),
                    ("datacenters", datacenter.0.as_str()),
                ],
                "find folder",
            )
            .await?;
        if found.len() > 1 {
            warn!("Folder name {} is ambiguous in {}; using the first match", leaf, datacenter);
        }
        found
            .into_iter()
            .next()
            .map(|f| FolderId(f.folder))
            .ok_or_else(|| ProvisionError::not_found("folder", path))
    }

    async fn find_resource_pool(&self, datacenter: &DatacenterId, name: &str) -> Result<ResourcePoolId> {
        let found: Vec<ResourcePoolSummary> = self
            .get_json(
                "/vcenter/resource-pool",
                &[("names", name), ("datacenters", datacenter.0.as_str())],
                "find resource pool",
            )
            .await?;
        found
            .into_iter()
            .next()
            .map(|r| ResourcePoolId(r.resource_pool))
            .ok_or_else(|| ProvisionError::not_found("resource pool", name))
    }

    async fn network_backing(&self, datacenter: &DatacenterId, name: &str) -> Result<NetworkBacking> {
        let found: Vec<NetworkSummary> = self
            .get_json(
                "/vcenter/network",
                &[("names", name), ("datacenters", datacenter.0.as_str())],
                "find network",
            )
            .await?;
        let network = found
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::not_found("network", name))?;
        parse_backing(&network.kind, network.network, network.name)
    }

    async fn find_vm(&self, datacenter: &DatacenterId, name: &str) -> Result<Option<VmId>> {
        let found: Vec<VmSummary> = self
            .get_json(
                "/vcenter/vm",
                &[("names", name), ("datacenters", datacenter.0.as_str())],
                "find VM",
            )
            .await?;
        Ok(found.into_iter().next().map(|v| VmId(v.vm)))
    }

    async fn create_vm(&self, placement: &Placement, spec: &VmConfigSpec) -> Result<VmId> {
        let datastore = self
            .datastore_id(Some(&placement.datacenter), &spec.datastore)
            .await?;

        let mut scsi_adapters = Vec::new();
        let mut disks = Vec::new();
        let mut extra_disks = Vec::new();
        let mut nics = Vec::new();
        for device in &spec.devices {
            match device {
                VirtualDevice::ScsiController(c) => scsi_adapters.push(ScsiAdapterSpec {
                    kind: "PVSCSI",
                    bus: c.bus_number,
                    sharing: "NONE",
                }),
                VirtualDevice::Disk(d) if d.datastore != spec.datastore => extra_disks.push(d),
                VirtualDevice::Disk(d) => {
                    disks.push(DiskSpec {
                        kind: "SCSI",
                        scsi: ScsiAddress {
                            bus: 0,
                            unit: d.unit_number,
                        },
                        new_vmdk: NewVmdk {
                            name: vmdk_stem(&d.file_name),
                            capacity: d.capacity_kb.saturating_mul(1024),
                        },
                    });
                }
                VirtualDevice::NetworkAdapter(n) => nics.push(nic_create_spec(n)),
            }
        }

        let boot_kind = match spec.firmware {
            BootFirmware::Bios => "BIOS",
            BootFirmware::Efi { .. } | BootFirmware::HttpEfi { .. } => "EFI",
        };

        let body = VmCreateSpec {
            name: spec.name.clone(),
            guest_os: guest_os_name(spec.guest_id),
            placement: PlacementSpec {
                folder: placement.folder.0.clone(),
                resource_pool: placement.resource_pool.0.clone(),
                datastore,
            },
            boot: BootSpec {
                kind: boot_kind,
                network_protocol: "IPV4",
            },
            cpu: CpuSpec {
                count: spec.num_cpus,
                cores_per_socket: spec.cores_per_socket,
            },
            memory: MemorySpec {
                size_mib: spec.memory_mb,
            },
            scsi_adapters,
            disks,
            nics,
        };

        let resp = self
            .send(self.request(Method::POST, "/vcenter/vm").json(&body), "create VM")
            .await?;
        let vm = resp
            .json::<String>()
            .await
            .map(VmId)
            .map_err(|e| ProvisionError::backend("create VM", format!("invalid response: {}", e)))?;

        // A VM without nested HV must not survive to be skipped by a rerun
        if let Err(e) = self
            .apply_vim_settings(&vm, &placement.datacenter, spec, &extra_disks)
            .await
        {
            warn!("{}: reconfigure after create failed, deleting {}", spec.name, vm);
            let path = format!("/vcenter/vm/{}", vm);
            if let Err(cleanup) = self.send(self.request(Method::DELETE, &path), "delete VM").await {
                warn!("{}: could not delete {}: {}", spec.name, vm, cleanup);
            }
            return Err(e);
        }
        Ok(vm)
    }

    async fn power_on(&self, vm: &VmId) -> Result<()> {
        let path = format!("/vcenter/vm/{}/power", vm);
        self.send(
            self.request(Method::POST, &path).query(&[("action", "start")]),
            "power on",
        )
        .await?;
        Ok(())
    }

    async fn shutdown_guest(&self, vm: &VmId) -> Result<()> {
        let path = format!("/vcenter/vm/{}/guest/power", vm);
        self.send(
            self.request(Method::POST, &path).query(&[("action", "shutdown")]),
            "guest shutdown",
        )
        .await?;
        Ok(())
    }

    async fn power_state(&self, vm: &VmId) -> Result<PowerState> {
        let info: PowerInfo = self
            .get_json(&format!("/vcenter/vm/{}/power", vm), &[], "read power state")
            .await?;
        match info.state.as_str() {
            "POWERED_ON" => Ok(PowerState::PoweredOn),
            "POWERED_OFF" => Ok(PowerState::PoweredOff),
            "SUSPENDED" => Ok(PowerState::Suspended),
            other => Err(ProvisionError::backend(
                "read power state",
                format!("unknown power state {}", other),
            )),
        }
    }

    async fn reconfigure(&self, vm: &VmId, changes: &[DeviceChange]) -> Result<()> {
        for change in changes {
            match change {
                DeviceChange::Add(VirtualDevice::NetworkAdapter(adapter)) => {
                    let path = format!("/vcenter/vm/{}/hardware/ethernet", vm);
                    self.send(
                        self.request(Method::POST, &path).json(&nic_create_spec(adapter)),
                        "add network adapter",
                    )
                    .await?;
                }
                DeviceChange::Remove(VirtualDevice::NetworkAdapter(adapter)) => {
                    let path = format!("/vcenter/vm/{}/hardware/ethernet/{}", vm, adapter.key);
                    self.send(self.request(Method::DELETE, &path), "remove network adapter")
                        .await?;
                }
                DeviceChange::Edit(VirtualDevice::NetworkAdapter(adapter)) => {
                    let path = format!("/vcenter/vm/{}/hardware/ethernet/{}", vm, adapter.key);
                    let body = NicUpdateSpec {
                        backing: backing_spec(&adapter.backing),
                    };
                    self.send(
                        self.request(Method::PATCH, &path).json(&body),
                        "edit network adapter",
                    )
                    .await?;
                }
                DeviceChange::Add(other) | DeviceChange::Remove(other) | DeviceChange::Edit(other) => {
                    return Err(ProvisionError::backend(
                        "reconfigure",
                        format!("device change not supported for {:?}", other),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Network adapters only; disks and controllers are not read back
    async fn hardware_devices(&self, vm: &VmId) -> Result<Vec<VirtualDevice>> {
        let nics: Vec<NicSummary> = self
            .get_json(
                &format!("/vcenter/vm/{}/hardware/ethernet", vm),
                &[],
                "list network adapters",
            )
            .await?;

        let mut devices = Vec::with_capacity(nics.len());
        for summary in nics {
            devices.push(VirtualDevice::NetworkAdapter(self.nic(vm, &summary.nic).await?));
        }
        Ok(devices)
    }

    async fn guest_ip(&self, vm: &VmId) -> Result<Option<String>> {
        let path = format!("/vcenter/vm/{}/guest/identity", vm);
        let resp = self
            .request(Method::GET, &path)
            .send()
            .await
            .map_err(|e| ProvisionError::backend("read guest identity", e))?;

        // Guest tools not running yet
        if resp.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(None);
        }
        let resp = check_status(resp, "read guest identity").await?;
        let identity = resp
            .json::<GuestIdentity>()
            .await
            .map_err(|e| ProvisionError::backend("read guest identity", format!("invalid response: {}", e)))?;
        Ok(identity.ip_address.filter(|ip| !ip.is_empty()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.send(self.request(Method::DELETE, "/session"), "disconnect")
            .await?;
        Ok(())
    }
}

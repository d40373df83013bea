//! Per-host provisioning state machine.
//!
//! One worker drives one fleet member from "does the VM exist" to "installer
//! registration removed", over its own backend session. Every await point is
//! raced against the worker's cancellation token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendConnector, DeviceChange, NetworkAdapter, NetworkBacking, Placement, VirtualDevice,
    VirtualizationBackend, VmId,
};
use crate::config::FleetConfig;
use crate::devices::vm_config_spec;
use crate::error::{ProvisionError, Result};
use crate::installer::InstallerService;
use crate::poll;
use crate::types::{HostIdentity, KickstartRequest};

/// Label the platform gives the first network adapter of a VM
pub const BOOT_ADAPTER_LABEL: &str = "Network adapter 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Init,
    Skipped,
    Creating,
    Created,
    RequestingGuestInstall,
    PoweringOn,
    AwaitingGuestIp,
    NetworkReconfiguring,
    ShuttingDown,
    RemovingBootAdapter,
    AddingFinalAdapter,
    PoweringOnAgain,
    AwaitingGuestIpAgain,
    ReconfiguringAdapterInPlace,
    NotifyInstallComplete,
    Done,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Done)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Skipped => "skipped",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::RequestingGuestInstall => "requesting-guest-install",
            Self::PoweringOn => "powering-on",
            Self::AwaitingGuestIp => "awaiting-guest-ip",
            Self::NetworkReconfiguring => "network-reconfiguring",
            Self::ShuttingDown => "shutting-down",
            Self::RemovingBootAdapter => "removing-boot-adapter",
            Self::AddingFinalAdapter => "adding-final-adapter",
            Self::PoweringOnAgain => "powering-on-again",
            Self::AwaitingGuestIpAgain => "awaiting-guest-ip-again",
            Self::ReconfiguringAdapterInPlace => "reconfiguring-adapter-in-place",
            Self::NotifyInstallComplete => "notify-install-complete",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Installed,
    /// A VM with the host's name already existed; nothing was touched
    Skipped,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Replace the boot adapter with a fresh one instead of editing it
    pub mac_separation: bool,
    pub guest_ip_interval: Duration,
    pub power_state_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            mac_separation: false,
            guest_ip_interval: Duration::from_secs(60),
            power_state_interval: Duration::from_secs(5),
        }
    }
}

/// Final word from one worker
#[derive(Debug)]
pub struct HostReport {
    pub identity: HostIdentity,
    /// `None` when the worker was aborted before it could report
    pub last_state: Option<HostState>,
    pub result: Result<HostOutcome>,
}

impl HostReport {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_cancelled())
    }
}

impl fmt::Display for HostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.result, self.last_state) {
            (Ok(HostOutcome::Installed), _) => write!(f, "{}: installed", self.identity),
            (Ok(HostOutcome::Skipped), _) => write!(f, "{}: skipped (VM already exists)", self.identity),
            (Err(e), Some(state)) => write!(f, "{}: failed in {}: {}", self.identity, state, e),
            (Err(e), None) => write!(f, "{}: {}", self.identity, e),
        }
    }
}

/// Race `fut` against `cancel`
async fn cancellable<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled(what.to_string())),
        res = fut => res,
    }
}

/// The adapter the host network-boots from
pub fn find_boot_adapter(devices: &[VirtualDevice]) -> Option<&NetworkAdapter> {
    devices.iter().find_map(|d| match d {
        VirtualDevice::NetworkAdapter(n)
            if n.label.as_deref() == Some(BOOT_ADAPTER_LABEL) && !n.mac_address.is_empty() =>
        {
            Some(n)
        }
        _ => None,
    })
}

pub struct HostProvisioningWorker {
    identity: HostIdentity,
    config: Arc<FleetConfig>,
    connector: Arc<dyn BackendConnector>,
    installer: Arc<dyn InstallerService>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    state: HostState,
}

impl HostProvisioningWorker {
    pub fn new(
        identity: HostIdentity,
        config: Arc<FleetConfig>,
        connector: Arc<dyn BackendConnector>,
        installer: Arc<dyn InstallerService>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            config,
            connector,
            installer,
            settings,
            cancel,
            state: HostState::Init,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    /// Provision the host and report, never panicking on backend failures
    pub async fn run(mut self) -> HostReport {
        let result = self.provision().await;
        match &result {
            Ok(outcome) => debug!("{} finished: {:?}", self.identity.fqdn, outcome),
            Err(e) if e.is_cancelled() => {
                warn!("Provisioning of {} cancelled in {}: {}", self.identity.fqdn, self.state, e)
            }
            Err(e) => error!("Provisioning of {} failed in {}: {}", self.identity.fqdn, self.state, e),
        }

        HostReport {
            identity: self.identity,
            last_state: Some(self.state),
            result,
        }
    }

    fn transition(&mut self, next: HostState) {
        info!("{}: {} -> {}", self.identity.fqdn, self.state, next);
        self.state = next;
    }

    async fn provision(&mut self) -> Result<HostOutcome> {
        let cancel = self.cancel.clone();
        let connector = Arc::clone(&self.connector);
        let backend = cancellable(&cancel, "connecting to vCenter", connector.connect()).await?;

        let result = self.drive(backend.as_ref()).await;

        // Session teardown must not mask the provisioning result
        if let Err(e) = backend.disconnect().await {
            warn!("Failed to close vCenter session for {}: {}", self.identity.fqdn, e);
        }
        result
    }

    async fn drive(&mut self, backend: &dyn VirtualizationBackend) -> Result<HostOutcome> {
        let config = Arc::clone(&self.config);
        let installer = Arc::clone(&self.installer);
        let cancel = self.cancel.clone();
        let vc = &config.environment.vcenter;
        let vm_name = self.identity.fqdn.clone();

        let datacenter = cancellable(
            &cancel,
            "resolving datacenter",
            backend.find_datacenter(&vc.datacenter),
        )
        .await?;

        let existing = cancellable(&cancel, "looking up VM", backend.find_vm(&datacenter, &vm_name)).await?;
        if existing.is_some() {
            info!("{} is existing. The create tasks will be skipped.", vm_name);
            self.transition(HostState::Skipped);
            return Ok(HostOutcome::Skipped);
        }
        info!("{} is not existing. The create tasks will be started.", vm_name);

        self.transition(HostState::Creating);
        let placement = Placement {
            folder: cancellable(&cancel, "resolving folder", backend.find_folder(&datacenter, &vc.folder)).await?,
            resource_pool: cancellable(
                &cancel,
                "resolving resource pool",
                backend.find_resource_pool(&datacenter, &vc.resource_pool),
            )
            .await?,
            datacenter: datacenter.clone(),
        };

        let boot = cancellable(
            &cancel,
            "resolving boot network",
            backend.network_backing(&datacenter, &config.environment.boot_port_group),
        )
        .await?;

        // Index 0 is replaced by the boot network at creation, so it is
        // resolved later, when the adapter is switched over.
        let mut configured = Vec::with_capacity(config.vm.networks.len());
        configured.push(boot.clone());
        for name in config.vm.networks.iter().skip(1) {
            configured.push(cancellable(&cancel, "resolving network", backend.network_backing(&datacenter, name)).await?);
        }

        let guest_id = cancellable(
            &cancel,
            "resolving guest OS",
            installer.guest_os_for_iso(&config.host.isofilename),
        )
        .await?;

        let spec = vm_config_spec(
            &vm_name,
            &config.vm,
            guest_id,
            &boot,
            &configured,
            backend.key_allocator(),
        );
        let vm = cancellable(&cancel, "creating VM", backend.create_vm(&placement, &spec)).await?;
        info!("VM {} Created.", vm_name);
        self.transition(HostState::Created);

        let devices = cancellable(&cancel, "reading VM devices", backend.hardware_devices(&vm)).await?;
        let boot_adapter = find_boot_adapter(&devices).cloned().ok_or_else(|| {
            ProvisionError::backend(
                "read boot adapter",
                format!("{} has no MAC address on {}", vm_name, BOOT_ADAPTER_LABEL),
            )
        })?;
        debug!("Boot adapter of {} has MAC {}", vm_name, boot_adapter.mac_address);

        // The same record is used for deregistration, so the installer is
        // always told about the MAC it registered.
        let request = self.kickstart_request(boot_adapter.mac_address.clone());

        self.transition(HostState::RequestingGuestInstall);
        cancellable(&cancel, "registering with the installer", installer.register_host(&request)).await?;

        self.transition(HostState::PoweringOn);
        cancellable(&cancel, "powering on", backend.power_on(&vm)).await?;
        info!("VM {} powered on.", vm_name);

        self.transition(HostState::AwaitingGuestIp);
        let target = self.identity.ip.to_string();
        poll::wait_for_guest_ip(
            backend,
            &vm,
            &target,
            &vm_name,
            self.settings.guest_ip_interval,
            &cancel,
        )
        .await?;

        self.transition(HostState::NetworkReconfiguring);
        let final_network = config
            .vm
            .networks
            .first()
            .ok_or_else(|| ProvisionError::config("vmparameter.networks needs at least one network"))?;
        let final_backing = cancellable(
            &cancel,
            "resolving network",
            backend.network_backing(&datacenter, final_network),
        )
        .await?;

        if self.settings.mac_separation {
            self.separate_mac(backend, &vm, &boot_adapter, final_backing, &target)
                .await?;
        } else {
            self.transition(HostState::ReconfiguringAdapterInPlace);
            let mut edited = boot_adapter.clone();
            edited.backing = final_backing;
            cancellable(
                &cancel,
                "switching the boot adapter network",
                backend.reconfigure(&vm, &[DeviceChange::Edit(VirtualDevice::NetworkAdapter(edited))]),
            )
            .await?;
            info!("The network adapter port group for {} has been changed successfully.", vm_name);
        }

        self.transition(HostState::NotifyInstallComplete);
        cancellable(&cancel, "deregistering from the installer", installer.deregister_host(&request)).await?;

        self.transition(HostState::Done);
        info!("Installation for {} has been completed.", vm_name);
        Ok(HostOutcome::Installed)
    }

    /// Swap the boot adapter for a new one so the installed host gets a MAC
    /// different from the one the installer saw.
    async fn separate_mac(
        &mut self,
        backend: &dyn VirtualizationBackend,
        vm: &VmId,
        boot_adapter: &NetworkAdapter,
        final_backing: NetworkBacking,
        target: &str,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        let vm_name = self.identity.fqdn.clone();
        info!("Change mac task for {} is started.", vm_name);

        self.transition(HostState::ShuttingDown);
        cancellable(&cancel, "shutting down the guest", backend.shutdown_guest(vm)).await?;
        poll::wait_for_power_off(backend, vm, &vm_name, self.settings.power_state_interval, &cancel).await?;

        self.transition(HostState::RemovingBootAdapter);
        cancellable(
            &cancel,
            "removing the boot adapter",
            backend.reconfigure(
                vm,
                &[DeviceChange::Remove(VirtualDevice::NetworkAdapter(boot_adapter.clone()))],
            ),
        )
        .await?;

        self.transition(HostState::AddingFinalAdapter);
        let fresh = NetworkAdapter {
            key: backend.key_allocator().next_key(),
            label: None,
            mac_address: String::new(),
            backing: final_backing,
        };
        cancellable(
            &cancel,
            "adding the final adapter",
            backend.reconfigure(vm, &[DeviceChange::Add(VirtualDevice::NetworkAdapter(fresh))]),
        )
        .await?;

        self.transition(HostState::PoweringOnAgain);
        cancellable(&cancel, "powering on", backend.power_on(vm)).await?;
        info!("VM {} powered on.", vm_name);

        self.transition(HostState::AwaitingGuestIpAgain);
        poll::wait_for_guest_ip(backend, vm, target, &vm_name, self.settings.guest_ip_interval, &cancel).await?;

        info!("Change mac task for {} has been completed.", vm_name);
        Ok(())
    }

    fn kickstart_request(&self, macaddress: String) -> KickstartRequest {
        let host = &self.config.host;
        KickstartRequest {
            macaddress,
            password: host.password.clone(),
            hostname: self.identity.fqdn.clone(),
            ip: self.identity.ip.to_string(),
            netmask: host.netmask.to_string(),
            gateway: host.gateway.to_string(),
            nameserver: host.nameserver.clone(),
            vlanid: host.vlanid,
            keyboard: host.keyboard.clone(),
            isofilename: host.isofilename.clone(),
            cli: host.cli.clone(),
            notvmpgcreate: host.not_vm_pg_create,
        }
    }
}

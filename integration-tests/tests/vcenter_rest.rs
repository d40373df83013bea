use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use esxi_fleet::backend::vsphere::VsphereConnector;
use esxi_fleet::config::{FirmwareKind, StorageConfig};
use esxi_fleet::installer::InstallerClient;
use esxi_fleet::{ErrorKind, FleetConfig, FleetController, FleetReport, RunOptions};

use crate::common::{fast_options, fleet_config, FakeInstaller, FakeNic, FakeVcenter};

async fn run(config: FleetConfig, installer: &FakeInstaller, options: RunOptions) -> FleetReport {
    let connector = VsphereConnector::new(&config.environment.vcenter);
    let client = InstallerClient::new(&installer.url).unwrap();
    FleetController::new(config, Arc::new(connector), Arc::new(client), options)
        .run(CancellationToken::new())
        .await
        .unwrap()
}

fn nic_by_label<'a>(nics: impl IntoIterator<Item = &'a FakeNic>, label: &str) -> Option<&'a FakeNic> {
    nics.into_iter().find(|n| n.label == label)
}

#[tokio::test]
async fn test_install_over_rest_api() {
    let vcenter = FakeVcenter::start().await;
    let installer = FakeInstaller::start().await;
    vcenter.set_guest_ip("esxi01.lab.local", "10.0.0.50");
    vcenter.set_guest_ip("esxi02.lab.local", "10.0.0.51");

    let dir = tempfile::tempdir().unwrap();
    let config = fleet_config(&dir, &vcenter.url, &installer.url, 2);
    let report = run(config, &installer, fast_options()).await;
    assert_eq!(report.installed(), 2, "{}", report);

    let vm = vcenter.vm("esxi01.lab.local").unwrap();
    let spec = vm.create_spec.as_ref().unwrap();
    assert_eq!(spec["guest_OS"], "VMKERNEL7");
    assert_eq!(spec["boot"]["type"], "EFI");
    assert_eq!(spec["cpu"]["count"], 4);
    assert_eq!(spec["cpu"]["cores_per_socket"], 2);
    assert_eq!(spec["memory"]["size_MiB"], 8192);
    assert_eq!(spec["placement"]["datastore"], "datastore-11");
    assert_eq!(spec["disks"][0]["new_vmdk"]["capacity"], 32i64 * 1024 * 1024 * 1024);
    assert_eq!(spec["nics"].as_array().unwrap().len(), 2);

    // Settings outside the REST create spec follow as one VI/JSON reconfigure
    assert_eq!(vm.reconfig_specs.len(), 1);
    let reconfig = &vm.reconfig_specs[0];
    assert_eq!(reconfig["_typeName"], "VirtualMachineConfigSpec");
    assert_eq!(reconfig["nestedHVEnabled"], true);
    assert!(reconfig.get("bootOptions").is_none());
    assert!(reconfig.get("extraConfig").is_none());
    assert!(reconfig.get("deviceChange").is_none());

    // Boot adapter now sits on the first configured network
    let boot = nic_by_label(vm.nics.values(), "Network adapter 1").unwrap();
    assert_eq!(vcenter.network_name(&boot.network).as_deref(), Some("pg-esxi-mgmt"));
    let second = nic_by_label(vm.nics.values(), "Network adapter 2").unwrap();
    assert_eq!(vcenter.network_name(&second.network).as_deref(), Some("pg-esxi-vmotion"));
    assert!(installer.registered_macs().contains(&boot.mac_address));

    assert_eq!(vcenter.sessions(), (2, 2));
}

#[tokio::test]
async fn test_mac_separation_over_rest_api() {
    let vcenter = FakeVcenter::start().await;
    let installer = FakeInstaller::start().await;
    vcenter.set_guest_ip("esxi01.lab.local", "10.0.0.50");

    let dir = tempfile::tempdir().unwrap();
    let config = fleet_config(&dir, &vcenter.url, &installer.url, 1);
    let mut options = fast_options();
    options.mac_separation = true;
    let report = run(config, &installer, options).await;
    assert_eq!(report.installed(), 1, "{}", report);

    let registered = installer.registered_macs().remove(0);
    let vm = vcenter.vm("esxi01.lab.local").unwrap();
    assert!(vm.powered_on);
    assert_eq!(vm.nics.len(), 2);
    assert!(vm.nics.values().all(|n| n.mac_address != registered));
    let boot = nic_by_label(vm.nics.values(), "Network adapter 1").unwrap();
    assert_eq!(vcenter.network_name(&boot.network).as_deref(), Some("pg-esxi-mgmt"));

    let events = installer.events();
    assert_eq!(events.last().unwrap().path, format!("/ks/{}", registered.replace(':', "-")));
}

#[tokio::test]
async fn test_existing_vm_untouched() {
    let vcenter = FakeVcenter::start().await;
    let installer = FakeInstaller::start().await;
    vcenter.insert_vm("esxi01.lab.local");

    let dir = tempfile::tempdir().unwrap();
    let config = fleet_config(&dir, &vcenter.url, &installer.url, 1);
    let report = run(config, &installer, fast_options()).await;

    assert_eq!(report.skipped(), 1);
    assert!(installer.events().is_empty());
    assert!(vcenter.vm("esxi01.lab.local").unwrap().create_spec.is_none());
}

#[tokio::test]
async fn test_missing_datacenter_reported() {
    let vcenter = FakeVcenter::start().await;
    let installer = FakeInstaller::start().await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = fleet_config(&dir, &vcenter.url, &installer.url, 1);
    config.environment.vcenter.datacenter = "dc-missing".to_string();
    let report = run(config, &installer, fast_options()).await;

    assert_eq!(report.failed(), 1);
    let err = report.hosts[0].result.as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(vcenter.sessions(), (1, 1));
}

#[tokio::test]
async fn test_vm_shape_settings_reach_vcenter() {
    let vcenter = FakeVcenter::start().await;
    let installer = FakeInstaller::start().await;
    vcenter.set_guest_ip("esxi01.lab.local", "10.0.0.50");

    let dir = tempfile::tempdir().unwrap();
    let mut config = fleet_config(&dir, &vcenter.url, &installer.url, 1);
    config.vm.boot_option.firmware = FirmwareKind::HttpEfi;
    config.vm.boot_option.secure_boot = true;
    config.vm.storages.push(StorageConfig {
        datastore: "ds-hdd-02".to_string(),
        capacity_gb: 100,
    });
    let report = run(config, &installer, fast_options()).await;
    assert_eq!(report.installed(), 1, "{}", report);

    let vm = vcenter.vm("esxi01.lab.local").unwrap();
    let create = vm.create_spec.as_ref().unwrap();
    assert_eq!(create["boot"]["type"], "EFI");
    assert_eq!(create["disks"].as_array().unwrap().len(), 1);

    let reconfig = &vm.reconfig_specs[0];
    assert_eq!(reconfig["nestedHVEnabled"], true);
    assert_eq!(reconfig["bootOptions"]["efiSecureBootEnabled"], true);
    assert_eq!(reconfig["extraConfig"][0]["key"], "networkBootProtocol");
    assert_eq!(reconfig["extraConfig"][0]["value"]["_value"], "httpv4");

    let disks = reconfig["deviceChange"].as_array().unwrap();
    assert_eq!(disks.len(), 1);
    let disk = &disks[0]["device"];
    assert_eq!(disk["controllerKey"], 1000);
    assert_eq!(disk["unitNumber"], 1);
    assert_eq!(disk["capacityInKB"], 100i64 * 1024 * 1024);
    assert_eq!(
        disk["backing"]["fileName"],
        "[ds-hdd-02] esxi01.lab.local/esxi01.lab.local_1.vmdk"
    );
    assert_eq!(disk["backing"]["datastore"]["value"], "datastore-12");
}

#[tokio::test]
async fn test_failed_reconfigure_removes_vm() {
    let vcenter = FakeVcenter::start().await;
    let installer = FakeInstaller::start().await;
    vcenter.fail_reconfigure();

    let dir = tempfile::tempdir().unwrap();
    let config = fleet_config(&dir, &vcenter.url, &installer.url, 1);
    let report = run(config, &installer, fast_options()).await;

    assert_eq!(report.failed(), 1);
    let err = report.hosts[0].result.as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert!(err.to_string().contains("Invalid configuration"), "{}", err);
    // A rerun must not skip a half-configured VM
    assert!(vcenter.vm("esxi01.lab.local").is_none());
    assert!(installer.events().is_empty());
    assert_eq!(vcenter.sessions(), (1, 1));
}

//! In-process fakes for the kickstart installer and the vCenter REST API.

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use esxi_fleet::{FleetConfig, RunOptions};

pub const ISO: &str = "VMware-VMvisor-Installer-8.0U2-22380479.x86_64.iso";

/// Serve `app` on an ephemeral loopback port
async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to port 0");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Write a fleet config pointing at the given services and load it back the
/// way the CLI does.
pub fn fleet_config(dir: &TempDir, vcenter_url: &str, installer_url: &str, replica: usize) -> FleetConfig {
    let yaml = format!(
        r#"
environment:
  vcenter:
    hostname: {vcenter_url}
    username: administrator@vsphere.local
    password: "VMware1!"
    datacenter: dc-lab
    resourcepool: Resources
    folder: nested-esxi
  kickstartserver: {installer_url}
  bootportgroup: pg-esxi-boot
esxiInfo:
  replica: {replica}
  start_ip: 10.0.0.50
  netmask: 255.255.255.0
  gateway: 10.0.0.1
  name_prefix: "esxi{{1,fixed=2}}"
  domain: lab.local
  password: "VMware1!"
  nameserver: 10.0.0.2
  isofilename: {ISO}
  cli:
    - vim-cmd hostsvc/enable_ssh
vmparameter:
  cpu:
    core: 4
    coreperscket: 2
  memory:
    memoryGB: 8
  networks:
    - pg-esxi-mgmt
    - pg-esxi-vmotion
  storages:
    - datastore: ds-ssd-01
      capacityGB: 32
  bootoption:
    firmware: efi
"#
    );

    let path = dir.path().join("template.yaml");
    std::fs::write(&path, yaml).unwrap();
    let config = FleetConfig::load(&path).unwrap();
    config.validate().unwrap();
    config
}

/// Polls in milliseconds instead of seconds
pub fn fast_options() -> RunOptions {
    RunOptions {
        mac_separation: false,
        fail_fast: false,
        guest_ip_interval: Duration::from_millis(10),
        power_state_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_millis(500),
    }
}

// ============================================================================
// Kickstart installer
// ============================================================================

#[derive(Debug, Clone)]
pub struct InstallerEvent {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Default)]
struct InstallerState {
    versions: HashMap<String, String>,
    events: Vec<InstallerEvent>,
    fail_registration: bool,
}

#[derive(Clone)]
pub struct FakeInstaller {
    pub url: String,
    state: Arc<Mutex<InstallerState>>,
}

impl FakeInstaller {
    /// Installer with the test ISO uploaded as ESXi 8.0
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(InstallerState {
            versions: HashMap::from([(ISO.to_string(), "8.0.2".to_string())]),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/esxi-versions", get(esxi_versions))
            .route("/ks", post(register))
            .route("/ks/:mac", delete(deregister))
            .with_state(state.clone());

        let addr = serve(app).await;
        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn fail_registration(&self) {
        self.state.lock().unwrap().fail_registration = true;
    }

    pub fn events(&self) -> Vec<InstallerEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Registered MACs, in request order
    pub fn registered_macs(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter(|e| e.method == "POST")
            .filter_map(|e| e.body.as_ref()?["macaddress"].as_str().map(str::to_string))
            .collect()
    }
}

type InstallerShared = Arc<Mutex<InstallerState>>;

async fn esxi_versions(State(state): State<InstallerShared>) -> Json<Value> {
    let state = state.lock().unwrap();
    Json(json!({ "uploaded_esxi_list": state.versions }))
}

async fn register(State(state): State<InstallerShared>, Json(body): Json<Value>) -> StatusCode {
    let mut state = state.lock().unwrap();
    state.events.push(InstallerEvent {
        method: "POST".to_string(),
        path: "/ks".to_string(),
        body: Some(body),
    });
    if state.fail_registration {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn deregister(State(state): State<InstallerShared>, Path(mac): Path<String>) -> StatusCode {
    state.lock().unwrap().events.push(InstallerEvent {
        method: "DELETE".to_string(),
        path: format!("/ks/{}", mac),
        body: None,
    });
    StatusCode::OK
}

// ============================================================================
// vCenter REST API
// ============================================================================

const SESSION_TOKEN: &str = "session-0001";

#[derive(Debug, Clone)]
pub struct FakeNic {
    pub label: String,
    pub mac_address: String,
    pub network: String,
}

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub name: String,
    pub powered_on: bool,
    pub nics: BTreeMap<u32, FakeNic>,
    pub create_spec: Option<Value>,
    /// `spec` of every VI/JSON `ReconfigVM_Task`
    pub reconfig_specs: Vec<Value>,
}

#[derive(Default)]
struct VcenterState {
    /// network id -> name
    networks: BTreeMap<String, String>,
    vms: BTreeMap<String, FakeVm>,
    guest_ips: HashMap<String, String>,
    /// task id -> succeeded
    tasks: HashMap<String, bool>,
    fail_reconfigure: bool,
    next_vm: u32,
    next_mac: u32,
    next_task: u32,
    sessions_opened: usize,
    sessions_closed: usize,
}

impl VcenterState {
    fn next_mac(&mut self) -> String {
        self.next_mac += 1;
        format!("00:50:56:9a:00:{:02x}", self.next_mac)
    }

    fn add_nic(&mut self, vm: &str, network: String) -> Option<u32> {
        let mac_address = self.next_mac();
        let nics = &mut self.vms.get_mut(vm)?.nics;
        let key = nics.keys().max().map(|k| k + 1).unwrap_or(4000);
        let ordinal = (1..)
            .find(|n| !nics.values().any(|nic| nic.label == format!("Network adapter {}", n)))
            .unwrap_or(1);
        nics.insert(
            key,
            FakeNic {
                label: format!("Network adapter {}", ordinal),
                mac_address,
                network,
            },
        );
        Some(key)
    }
}

#[derive(Clone)]
pub struct FakeVcenter {
    pub url: String,
    state: Arc<Mutex<VcenterState>>,
}

type VcenterShared = Arc<Mutex<VcenterState>>;
type Params = Query<HashMap<String, String>>;

impl FakeVcenter {
    pub async fn start() -> Self {
        let mut initial = VcenterState::default();
        for (i, name) in ["pg-esxi-boot", "pg-esxi-mgmt", "pg-esxi-vmotion"].iter().enumerate() {
            initial.networks.insert(format!("network-{}", i + 1), name.to_string());
        }
        let state = Arc::new(Mutex::new(initial));

        let app = Router::new()
            .route("/api/session", post(open_session).delete(close_session))
            .route("/api/vcenter/datacenter", get(list_datacenters))
            .route("/api/vcenter/folder", get(list_folders))
            .route("/api/vcenter/resource-pool", get(list_resource_pools))
            .route("/api/vcenter/network", get(list_networks))
            .route("/api/vcenter/datastore", get(list_datastores))
            .route("/api/vcenter/vm", get(list_vms).post(create_vm))
            .route("/api/vcenter/vm/:vm", delete(delete_vm))
            .route("/api/vcenter/vm/:vm/hardware/adapter/scsi", get(list_scsi_adapters))
            .route("/api/vcenter/vm/:vm/power", get(power_state).post(power_action))
            .route("/api/vcenter/vm/:vm/guest/power", post(guest_power))
            .route("/api/vcenter/vm/:vm/guest/identity", get(guest_identity))
            .route("/api/vcenter/vm/:vm/hardware/ethernet", get(list_nics).post(add_nic))
            .route(
                "/api/vcenter/vm/:vm/hardware/ethernet/:nic",
                get(get_nic).patch(update_nic).delete(remove_nic),
            )
            .route(
                "/sdk/vim25/:release/VirtualMachine/:vm/ReconfigVM_Task",
                post(reconfigure_vm),
            )
            .route("/sdk/vim25/:release/Task/:task/info", get(task_info))
            .layer(middleware::from_fn(require_session))
            .with_state(state.clone());

        let addr = serve(app).await;
        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    /// Guest tools of `vm_name` report `ip` while the VM is powered on
    pub fn set_guest_ip(&self, vm_name: &str, ip: &str) {
        self.state
            .lock()
            .unwrap()
            .guest_ips
            .insert(vm_name.to_string(), ip.to_string());
    }

    pub fn insert_vm(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_vm += 1;
        let id = format!("vm-{}", state.next_vm);
        state.vms.insert(
            id,
            FakeVm {
                name: name.to_string(),
                powered_on: false,
                nics: BTreeMap::new(),
                create_spec: None,
                reconfig_specs: Vec::new(),
            },
        );
    }

    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.state
            .lock()
            .unwrap()
            .vms
            .values()
            .find(|vm| vm.name == name)
            .cloned()
    }

    pub fn network_name(&self, id: &str) -> Option<String> {
        self.state.lock().unwrap().networks.get(id).cloned()
    }

    /// Every `ReconfigVM_Task` from now on ends in a task error
    pub fn fail_reconfigure(&self) {
        self.state.lock().unwrap().fail_reconfigure = true;
    }

    /// (opened, closed)
    pub fn sessions(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.sessions_opened, state.sessions_closed)
    }
}

/// Everything but session creation needs the session header
async fn require_session(req: Request, next: Next) -> Response {
    if req.method() == Method::POST && req.uri().path() == "/api/session" {
        return next.run(req).await;
    }
    let authorized = req
        .headers()
        .get("vmware-api-session-id")
        .and_then(|v| v.to_str().ok())
        == Some(SESSION_TOKEN);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

async fn open_session(State(state): State<VcenterShared>, headers: HeaderMap) -> Response {
    if !headers.contains_key("authorization") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.lock().unwrap().sessions_opened += 1;
    (StatusCode::CREATED, Json(SESSION_TOKEN)).into_response()
}

async fn close_session(State(state): State<VcenterShared>) -> StatusCode {
    state.lock().unwrap().sessions_closed += 1;
    StatusCode::NO_CONTENT
}

fn name_filter(params: &HashMap<String, String>, known: &str) -> bool {
    params.get("names").map(|n| n == known).unwrap_or(false)
}

async fn list_datacenters(Query(params): Params) -> Json<Value> {
    if name_filter(&params, "dc-lab") {
        Json(json!([{ "datacenter": "datacenter-3", "name": "dc-lab" }]))
    } else {
        Json(json!([]))
    }
}

async fn list_folders(Query(params): Params) -> Json<Value> {
    if name_filter(&params, "nested-esxi") && params.get("type").map(String::as_str) == Some("VIRTUAL_MACHINE") {
        Json(json!([{ "folder": "group-v21", "name": "nested-esxi", "type": "VIRTUAL_MACHINE" }]))
    } else {
        Json(json!([]))
    }
}

async fn list_resource_pools(Query(params): Params) -> Json<Value> {
    if name_filter(&params, "Resources") {
        Json(json!([{ "resource_pool": "resgroup-8", "name": "Resources" }]))
    } else {
        Json(json!([]))
    }
}

async fn list_datastores(Query(params): Params) -> Json<Value> {
    if name_filter(&params, "ds-ssd-01") {
        Json(json!([{ "datastore": "datastore-11", "name": "ds-ssd-01", "type": "VMFS" }]))
    } else if name_filter(&params, "ds-hdd-02") {
        Json(json!([{ "datastore": "datastore-12", "name": "ds-hdd-02", "type": "VMFS" }]))
    } else {
        Json(json!([]))
    }
}

async fn list_networks(State(state): State<VcenterShared>, Query(params): Params) -> Json<Value> {
    let state = state.lock().unwrap();
    let found: Vec<Value> = state
        .networks
        .iter()
        .filter(|(_, name)| params.get("names") == Some(*name))
        .map(|(id, name)| json!({ "network": id, "name": name, "type": "STANDARD_PORTGROUP" }))
        .collect();
    Json(Value::Array(found))
}

async fn list_vms(State(state): State<VcenterShared>, Query(params): Params) -> Json<Value> {
    let state = state.lock().unwrap();
    let found: Vec<Value> = state
        .vms
        .iter()
        .filter(|(_, vm)| params.get("names") == Some(&vm.name))
        .map(|(id, vm)| json!({ "vm": id, "name": vm.name }))
        .collect();
    Json(Value::Array(found))
}

async fn create_vm(State(state): State<VcenterShared>, Json(spec): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    let Some(name) = spec["name"].as_str().map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "missing name").into_response();
    };
    if spec["placement"]["resource_pool"] != "resgroup-8" || spec["placement"]["folder"] != "group-v21" {
        return (StatusCode::BAD_REQUEST, "bad placement").into_response();
    }

    state.next_vm += 1;
    let id = format!("vm-{}", state.next_vm);
    state.vms.insert(
        id.clone(),
        FakeVm {
            name,
            powered_on: false,
            nics: BTreeMap::new(),
            create_spec: Some(spec.clone()),
            reconfig_specs: Vec::new(),
        },
    );

    let networks: Vec<String> = spec["nics"]
        .as_array()
        .map(|nics| {
            nics.iter()
                .filter_map(|n| n["backing"]["network"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    for network in networks {
        state.add_nic(&id, network);
    }

    (StatusCode::CREATED, Json(id)).into_response()
}

async fn delete_vm(State(state): State<VcenterShared>, Path(vm): Path<String>) -> StatusCode {
    match state.lock().unwrap().vms.remove(&vm) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn list_scsi_adapters(State(state): State<VcenterShared>, Path(vm): Path<String>) -> Response {
    let state = state.lock().unwrap();
    match state.vms.get(&vm).and_then(|v| v.create_spec.as_ref()) {
        Some(spec) if spec["scsi_adapters"].as_array().map(|a| !a.is_empty()).unwrap_or(false) => {
            Json(json!([{ "adapter": "1000" }])).into_response()
        }
        Some(_) => Json(json!([])).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn reconfigure_vm(
    State(state): State<VcenterShared>,
    Path((_release, vm)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    let succeeded = !state.fail_reconfigure;
    let Some(v) = state.vms.get_mut(&vm) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    v.reconfig_specs.push(body["spec"].clone());

    state.next_task += 1;
    let task = format!("task-{}", state.next_task);
    state.tasks.insert(task.clone(), succeeded);
    Json(json!({ "_typeName": "ManagedObjectReference", "type": "Task", "value": task })).into_response()
}

async fn task_info(State(state): State<VcenterShared>, Path((_release, task)): Path<(String, String)>) -> Response {
    match state.lock().unwrap().tasks.get(&task) {
        Some(true) => Json(json!({ "_typeName": "TaskInfo", "key": task, "state": "success" })).into_response(),
        Some(false) => Json(json!({
            "_typeName": "TaskInfo",
            "key": task,
            "state": "error",
            "error": { "_typeName": "LocalizedMethodFault", "localizedMessage": "Invalid configuration for device '0'." },
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn power_state(State(state): State<VcenterShared>, Path(vm): Path<String>) -> Response {
    match state.lock().unwrap().vms.get(&vm) {
        Some(v) => {
            let power = if v.powered_on { "POWERED_ON" } else { "POWERED_OFF" };
            Json(json!({ "state": power })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn power_action(State(state): State<VcenterShared>, Path(vm): Path<String>, Query(params): Params) -> StatusCode {
    let mut state = state.lock().unwrap();
    let Some(v) = state.vms.get_mut(&vm) else {
        return StatusCode::NOT_FOUND;
    };
    match params.get("action").map(String::as_str) {
        Some("start") => v.powered_on = true,
        Some("stop") => v.powered_on = false,
        _ => return StatusCode::BAD_REQUEST,
    }
    StatusCode::NO_CONTENT
}

async fn guest_power(State(state): State<VcenterShared>, Path(vm): Path<String>, Query(params): Params) -> StatusCode {
    let mut state = state.lock().unwrap();
    let Some(v) = state.vms.get_mut(&vm) else {
        return StatusCode::NOT_FOUND;
    };
    if params.get("action").map(String::as_str) != Some("shutdown") {
        return StatusCode::BAD_REQUEST;
    }
    v.powered_on = false;
    StatusCode::NO_CONTENT
}

async fn guest_identity(State(state): State<VcenterShared>, Path(vm): Path<String>) -> Response {
    let state = state.lock().unwrap();
    let Some(v) = state.vms.get(&vm) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !v.powered_on {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match state.guest_ips.get(&v.name) {
        Some(ip) => Json(json!({ "name": v.name, "ip_address": ip })).into_response(),
        None => Json(json!({ "name": v.name })).into_response(),
    }
}

async fn list_nics(State(state): State<VcenterShared>, Path(vm): Path<String>) -> Response {
    match state.lock().unwrap().vms.get(&vm) {
        Some(v) => {
            let nics: Vec<Value> = v.nics.keys().map(|k| json!({ "nic": k.to_string() })).collect();
            Json(Value::Array(nics)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_nic(State(state): State<VcenterShared>, Path((vm, nic)): Path<(String, u32)>) -> Response {
    let state = state.lock().unwrap();
    let Some(n) = state.vms.get(&vm).and_then(|v| v.nics.get(&nic)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    Json(json!({
        "label": n.label,
        "type": "VMXNET3",
        "mac_address": n.mac_address,
        "mac_type": "ASSIGNED",
        "backing": {
            "type": "STANDARD_PORTGROUP",
            "network": n.network,
            "network_name": state.networks.get(&n.network),
        },
    }))
    .into_response()
}

async fn add_nic(State(state): State<VcenterShared>, Path(vm): Path<String>, Json(spec): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    let Some(network) = spec["backing"]["network"].as_str().map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "missing backing").into_response();
    };
    match state.add_nic(&vm, network) {
        Some(key) => (StatusCode::CREATED, Json(key.to_string())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn update_nic(
    State(state): State<VcenterShared>,
    Path((vm, nic)): Path<(String, u32)>,
    Json(spec): Json<Value>,
) -> StatusCode {
    let mut state = state.lock().unwrap();
    let Some(n) = state.vms.get_mut(&vm).and_then(|v| v.nics.get_mut(&nic)) else {
        return StatusCode::NOT_FOUND;
    };
    match spec["backing"]["network"].as_str() {
        Some(network) => {
            n.network = network.to_string();
            StatusCode::NO_CONTENT
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn remove_nic(State(state): State<VcenterShared>, Path((vm, nic)): Path<(String, u32)>) -> StatusCode {
    let mut state = state.lock().unwrap();
    match state.vms.get_mut(&vm).and_then(|v| v.nics.remove(&nic)) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

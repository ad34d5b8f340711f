//! Mock provider backend for testing and development.
//!
//! This provider simulates a hypervisor in memory without requiring an
//! actual virtualization stack. Useful for:
//! - Unit and integration testing of the control plane
//! - Development without a hypervisor installed
//! - Demo environments
//!
//! Disk export/import is real file I/O against a configurable mount root
//! (standing in for `/mnt/migration-storage`) and storage pool, so the
//! migration path can be exercised end to end.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

use virtrigaud_proto::provider::*;

const GIB: u64 = 1024 * 1024 * 1024;

/// Tuning knobs for the mock provider.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Return empty task refs (synchronous completion) instead of tasks
    pub synchronous: bool,
    /// How long simulated tasks stay pending
    pub task_latency: Duration,
    /// Root under which `pvc://` URLs resolve, one directory per PVC
    pub mount_root: PathBuf,
    /// Provider-native storage pool for imported disks
    pub pool_root: PathBuf,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            synchronous: false,
            task_latency: Duration::ZERO,
            mount_root: std::env::temp_dir().join("virtrigaud-mock-mounts"),
            pool_root: std::env::temp_dir().join("virtrigaud-mock-pool"),
        }
    }
}

struct MockVm {
    id: String,
    name: String,
    running: bool,
    cpu: u32,
    memory_mib: u64,
    disks: Vec<MockDisk>,
    networks: Vec<String>,
    tags: Vec<String>,
    hostname: String,
    ips: Vec<String>,
    /// Path of the imported disk used in place, when the VM was created
    /// from one
    imported_disk_path: Option<String>,
    /// Guest payload carried by an imported disk
    guest_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct MockDisk {
    name: String,
    size_gib: u64,
    format: String,
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    id: String,
    name_hint: String,
    include_memory: bool,
    /// Power state captured at snapshot time; revert restores it
    running: bool,
    created_at: chrono::DateTime<chrono::Utc>,
}

struct MockTask {
    done_at: Instant,
    error: Option<String>,
    transferred_bytes: u64,
}

// Lenient wire shapes: only the fields the mock interprets; everything else
// in the JSON blobs rides through untouched.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ClassShape {
    cpu: u32,
    memory_mib: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DiskShape {
    name: String,
    size_gib: u64,
    format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ImportedDiskShape {
    disk_id: String,
    path: String,
    format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ResourceShape {
    cpu: Option<u32>,
    memory_mib: Option<u64>,
}

/// Disk payload staged by export and consumed by import.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskPayload {
    disk_name: String,
    format: String,
    virtual_size_bytes: u64,
    hostname: String,
    data: serde_json::Value,
}

/// Mock provider implementing the full RPC contract in memory.
pub struct MockProvider {
    options: MockOptions,
    capabilities: GetCapabilitiesResponse,
    vms: RwLock<HashMap<String, MockVm>>,
    /// name -> id, for idempotent create
    names: RwLock<HashMap<String, String>>,
    snapshots: RwLock<HashMap<String, Vec<MockSnapshot>>>,
    tasks: RwLock<HashMap<String, MockTask>>,
    /// Count of state-changing RPCs, for idempotence assertions in tests
    mutations: AtomicU64,
}

impl MockProvider {
    /// Create a mock provider with default options.
    pub fn new() -> Self {
        Self::with_options(MockOptions::default())
    }

    pub fn with_options(options: MockOptions) -> Self {
        info!(
            mount_root = %options.mount_root.display(),
            pool_root = %options.pool_root.display(),
            "Creating mock provider"
        );
        Self {
            options,
            capabilities: GetCapabilitiesResponse {
                supports_reconfigure_online: false,
                supports_disk_expansion_online: true,
                supports_snapshots: true,
                supports_memory_snapshots: true,
                supports_linked_clones: true,
                supports_image_import: true,
                supported_disk_types: vec!["qcow2".to_string(), "raw".to_string()],
                supported_network_types: vec!["bridge".to_string(), "nat".to_string()],
            },
            vms: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            mutations: AtomicU64::new(0),
        }
    }

    /// Override the advertised capability matrix.
    pub fn with_capabilities(mut self, capabilities: GetCapabilitiesResponse) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Number of state-changing RPCs handled so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of VMs currently defined.
    pub fn vm_count(&self) -> usize {
        self.vms
            .read()
            .map(|vms| vms.len())
            .unwrap_or(0)
    }

    fn count_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a task, or return no task ref in synchronous mode.
    fn start_task(&self, transferred_bytes: u64) -> Result<String, Status> {
        if self.options.synchronous {
            return Ok(String::new());
        }
        let task_ref = format!("task-{}", uuid::Uuid::new_v4());
        let mut tasks = self.tasks.write().map_err(lock_poisoned)?;
        tasks.insert(
            task_ref.clone(),
            MockTask {
                done_at: Instant::now() + self.options.task_latency,
                error: None,
                transferred_bytes,
            },
        );
        Ok(task_ref)
    }

    /// Deterministic fake guest addresses, derived from the VM id.
    fn fabricate_ips(id: &str) -> Vec<String> {
        let digest = Sha256::digest(id.as_bytes());
        vec![format!("10.{}.{}.{}", digest[0], digest[1], digest[2].max(2))]
    }

    /// Resolve a storage URL to a local path under the mock's roots.
    fn resolve_url(&self, url: &str) -> Result<PathBuf, Status> {
        resolve_storage_url(url, &self.options.mount_root)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_poisoned<T>(_: T) -> Status {
    Status::internal("lock poisoned")
}

/// Resolve `pvc://<pvc>/<path>` (and plain `file://` paths) the way a
/// provider pod would: PVCs are directories under the migration mount root.
pub fn resolve_storage_url(url: &str, mount_root: &Path) -> Result<PathBuf, Status> {
    if let Some(rest) = url.strip_prefix("pvc://") {
        let (pvc, path) = rest
            .split_once('/')
            .ok_or_else(|| Status::invalid_argument(format!("malformed pvc url: {}", url)))?;
        if pvc.is_empty() || path.is_empty() {
            return Err(Status::invalid_argument(format!("malformed pvc url: {}", url)));
        }
        return Ok(mount_root.join(pvc).join(path));
    }
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }
    Err(Status::unimplemented(format!(
        "mock provider cannot stage url scheme of {}",
        url
    )))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Write a file through a temp stage in the system temp dir, cleaning the
/// stage on failure.
fn stage_and_persist(target: &Path, contents: &[u8]) -> Result<(), Status> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Status::internal(format!("create {}: {}", parent.display(), e)))?;
    }
    let mut stage = tempfile::NamedTempFile::new()
        .map_err(|e| Status::internal(format!("stage file: {}", e)))?;
    stage
        .write_all(contents)
        .map_err(|e| Status::internal(format!("stage write: {}", e)))?;
    stage
        .persist(target)
        .map_err(|e| Status::internal(format!("persist {}: {}", target.display(), e)))?;
    Ok(())
}

#[tonic::async_trait]
impl Provider for MockProvider {
    async fn validate(
        &self,
        _request: Request<ValidateRequest>,
    ) -> Result<Response<ValidateResponse>, Status> {
        Ok(Response::new(ValidateResponse {
            ok: true,
            message: "mock provider healthy".to_string(),
        }))
    }

    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<GetCapabilitiesResponse>, Status> {
        Ok(Response::new(self.capabilities.clone()))
    }

    #[instrument(skip(self, request))]
    async fn create(
        &self,
        request: Request<CreateRequest>,
    ) -> Result<Response<CreateResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }

        // Idempotent on name: an existing VM just reports its id.
        {
            let names = self.names.read().map_err(lock_poisoned)?;
            if let Some(id) = names.get(&req.name) {
                debug!(name = %req.name, id = %id, "Create is a no-op, VM exists");
                return Ok(Response::new(CreateResponse {
                    id: id.clone(),
                    task_ref: String::new(),
                }));
            }
        }

        let class: ClassShape = serde_json::from_str(&req.class_json).unwrap_or_default();
        let disks: Vec<DiskShape> = serde_json::from_str(&req.disks_json).unwrap_or_default();
        // Attachments arrive either as plain names or as {name, spec} objects.
        let networks: Vec<String> = serde_json::from_str::<serde_json::Value>(&req.networks_json)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|n| {
                        n.as_str()
                            .map(str::to_string)
                            .or_else(|| n.get("name").and_then(|x| x.as_str()).map(str::to_string))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut disks: Vec<MockDisk> = disks
            .into_iter()
            .map(|d| MockDisk {
                name: d.name,
                size_gib: d.size_gib,
                format: d.format.unwrap_or_else(|| "qcow2".to_string()),
            })
            .collect();

        let mut hostname = req.name.clone();
        let mut guest_data = None;
        let mut imported_disk_path = None;

        if !req.imported_disk_json.is_empty() {
            // The disk already lives in the pool: define the VM over it in
            // place. Copying or re-templating it here would produce a fresh
            // guest instead of the migrated one.
            let imported: ImportedDiskShape = serde_json::from_str(&req.imported_disk_json)
                .map_err(|e| Status::invalid_argument(format!("importedDisk json: {}", e)))?;
            debug!(
                disk_id = %imported.disk_id,
                path = %imported.path,
                format = ?imported.format,
                "Defining VM over imported disk in place"
            );
            let raw = std::fs::read(&imported.path).map_err(|_| {
                Status::failed_precondition(format!(
                    "imported disk {} not present in pool",
                    imported.path
                ))
            })?;
            let payload: DiskPayload = serde_json::from_slice(&raw)
                .map_err(|e| Status::invalid_argument(format!("imported disk payload: {}", e)))?;
            hostname = payload.hostname;
            guest_data = Some(payload.data);
            disks = vec![MockDisk {
                name: payload.disk_name,
                size_gib: payload.virtual_size_bytes / GIB,
                format: payload.format,
            }];
            imported_disk_path = Some(imported.path);
        } else if req.image_json.is_empty() {
            return Err(Status::invalid_argument(
                "one of image or imported disk is required",
            ));
        }

        if disks.is_empty() {
            disks.push(MockDisk {
                name: "disk0".to_string(),
                size_gib: 20,
                format: "qcow2".to_string(),
            });
        }

        let id = format!("mock-{}", uuid::Uuid::new_v4());
        let vm = MockVm {
            id: id.clone(),
            name: req.name.clone(),
            running: false,
            cpu: class.cpu.max(1),
            memory_mib: class.memory_mib.max(64),
            disks,
            networks,
            tags: req.tags,
            hostname,
            ips: Vec::new(),
            imported_disk_path,
            guest_data,
        };

        self.vms.write().map_err(lock_poisoned)?.insert(id.clone(), vm);
        self.names
            .write()
            .map_err(lock_poisoned)?
            .insert(req.name.clone(), id.clone());

        let task_ref = self.start_task(0)?;
        info!(name = %req.name, id = %id, "Mock VM created");
        Ok(Response::new(CreateResponse { id, task_ref }))
    }

    #[instrument(skip(self, request))]
    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();

        let removed = {
            let mut vms = self.vms.write().map_err(lock_poisoned)?;
            vms.remove(&req.id)
        };

        match removed {
            Some(vm) => {
                self.names.write().map_err(lock_poisoned)?.remove(&vm.name);
                self.snapshots.write().map_err(lock_poisoned)?.remove(&req.id);
                info!(id = %req.id, name = %vm.name, "Mock VM deleted");
                let task_ref = self.start_task(0)?;
                Ok(Response::new(TaskResponse { task_ref }))
            }
            // Idempotent: deleting an absent VM is success upstream.
            None => Err(Status::not_found(format!("vm {} not found", req.id))),
        }
    }

    #[instrument(skip(self, request))]
    async fn power(
        &self,
        request: Request<PowerRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();
        let op = PowerOp::try_from(req.op)
            .map_err(|_| Status::invalid_argument(format!("unknown power op {}", req.op)))?;

        let mut vms = self.vms.write().map_err(lock_poisoned)?;
        let vm = vms
            .get_mut(&req.id)
            .ok_or_else(|| Status::not_found(format!("vm {} not found", req.id)))?;

        match op {
            PowerOp::On => {
                vm.running = true;
                vm.ips = Self::fabricate_ips(&vm.id);
            }
            PowerOp::Off => {
                vm.running = false;
                vm.ips.clear();
            }
            PowerOp::ShutdownGraceful => {
                // The mock guest always honors ACPI shutdown.
                vm.running = false;
                vm.ips.clear();
            }
            PowerOp::Reboot => {
                if !vm.running {
                    return Err(Status::failed_precondition("vm is not running"));
                }
            }
            PowerOp::Unspecified => {
                return Err(Status::invalid_argument("power op unspecified"));
            }
        }
        drop(vms);

        info!(id = %req.id, op = ?op, "Mock VM power op applied");
        let task_ref = self.start_task(0)?;
        Ok(Response::new(TaskResponse { task_ref }))
    }

    #[instrument(skip(self, request))]
    async fn reconfigure(
        &self,
        request: Request<ReconfigureRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();
        let desired: ResourceShape = serde_json::from_str(&req.desired_json)
            .map_err(|e| Status::invalid_argument(format!("desired json: {}", e)))?;
        let desired_disks: Vec<DiskShape> = serde_json::from_str(&req.desired_json)
            .ok()
            .and_then(|v: serde_json::Value| {
                v.get("disks")
                    .cloned()
                    .and_then(|d| serde_json::from_value(d).ok())
            })
            .unwrap_or_default();

        let mut vms = self.vms.write().map_err(lock_poisoned)?;
        let vm = vms
            .get_mut(&req.id)
            .ok_or_else(|| Status::not_found(format!("vm {} not found", req.id)))?;

        if vm.running && !self.capabilities.supports_reconfigure_online {
            return Err(Status::failed_precondition(
                "online reconfigure not supported; power the vm off first",
            ));
        }

        if let Some(cpu) = desired.cpu {
            vm.cpu = cpu;
        }
        if let Some(memory_mib) = desired.memory_mib {
            vm.memory_mib = memory_mib;
        }
        for d in desired_disks {
            if let Some(disk) = vm.disks.iter_mut().find(|x| x.name == d.name) {
                if d.size_gib < disk.size_gib {
                    return Err(Status::invalid_argument(format!(
                        "disk {} may not shrink",
                        d.name
                    )));
                }
                disk.size_gib = d.size_gib;
            }
        }
        drop(vms);

        info!(id = %req.id, "Mock VM reconfigured");
        let task_ref = self.start_task(0)?;
        Ok(Response::new(TaskResponse { task_ref }))
    }

    async fn describe(
        &self,
        request: Request<DescribeRequest>,
    ) -> Result<Response<DescribeResponse>, Status> {
        let req = request.into_inner();
        let vms = self.vms.read().map_err(lock_poisoned)?;

        let Some(vm) = vms.get(&req.id) else {
            return Ok(Response::new(DescribeResponse {
                exists: false,
                power_state: PowerState::Unspecified as i32,
                ips: Vec::new(),
                console_url: String::new(),
                provider_raw_json: String::new(),
            }));
        };

        let raw = serde_json::json!({
            "cpu": vm.cpu,
            "memoryMiB": vm.memory_mib,
            "disks": vm.disks.iter().map(|d| serde_json::json!({
                "name": d.name,
                "sizeGiB": d.size_gib,
                "format": d.format,
            })).collect::<Vec<_>>(),
            "networks": vm.networks,
            "hostname": vm.hostname,
            "importedDiskPath": vm.imported_disk_path,
            "guestData": vm.guest_data,
        });

        Ok(Response::new(DescribeResponse {
            exists: true,
            power_state: if vm.running {
                PowerState::On as i32
            } else {
                PowerState::Off as i32
            },
            ips: vm.ips.clone(),
            console_url: format!("vnc://mock-host/{}", vm.id),
            provider_raw_json: raw.to_string(),
        }))
    }

    async fn task_status(
        &self,
        request: Request<TaskStatusRequest>,
    ) -> Result<Response<TaskStatusResponse>, Status> {
        let req = request.into_inner();
        let tasks = self.tasks.read().map_err(lock_poisoned)?;
        let task = tasks
            .get(&req.task_ref)
            .ok_or_else(|| Status::not_found(format!("task {} not found", req.task_ref)))?;

        let done = Instant::now() >= task.done_at;
        Ok(Response::new(TaskStatusResponse {
            done,
            error: task.error.clone().unwrap_or_default(),
            progress_percent: if done { 100 } else { 50 },
            transferred_bytes: if done { task.transferred_bytes } else { 0 },
        }))
    }

    #[instrument(skip(self, request))]
    async fn snapshot_create(
        &self,
        request: Request<SnapshotCreateRequest>,
    ) -> Result<Response<SnapshotCreateResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();

        let running = {
            let vms = self.vms.read().map_err(lock_poisoned)?;
            let vm = vms
                .get(&req.vm_id)
                .ok_or_else(|| Status::not_found(format!("vm {} not found", req.vm_id)))?;
            vm.running
        };

        if req.include_memory && !self.capabilities.supports_memory_snapshots {
            return Err(Status::unimplemented("memory snapshots not supported"));
        }

        let snapshot = MockSnapshot {
            id: format!("snap-{}", uuid::Uuid::new_v4()),
            name_hint: req.name_hint.clone(),
            include_memory: req.include_memory,
            running,
            created_at: chrono::Utc::now(),
        };
        let snapshot_id = snapshot.id.clone();

        self.snapshots
            .write()
            .map_err(lock_poisoned)?
            .entry(req.vm_id.clone())
            .or_default()
            .push(snapshot);

        info!(vm_id = %req.vm_id, snapshot_id = %snapshot_id, name_hint = %req.name_hint, "Snapshot created");
        let task_ref = self.start_task(0)?;
        Ok(Response::new(SnapshotCreateResponse {
            snapshot_id,
            task_ref,
        }))
    }

    async fn snapshot_delete(
        &self,
        request: Request<SnapshotDeleteRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();
        let mut snapshots = self.snapshots.write().map_err(lock_poisoned)?;
        let list = snapshots
            .get_mut(&req.vm_id)
            .ok_or_else(|| Status::not_found(format!("vm {} has no snapshots", req.vm_id)))?;

        let idx = list
            .iter()
            .position(|s| s.id == req.snapshot_id)
            .ok_or_else(|| Status::not_found(format!("snapshot {} not found", req.snapshot_id)))?;
        list.remove(idx);
        drop(snapshots);

        info!(vm_id = %req.vm_id, snapshot_id = %req.snapshot_id, "Snapshot deleted");
        let task_ref = self.start_task(0)?;
        Ok(Response::new(TaskResponse { task_ref }))
    }

    async fn snapshot_revert(
        &self,
        request: Request<SnapshotRevertRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();

        // Restore the power state captured at snapshot time; memoryless
        // snapshots leave the guest off, matching libvirt behavior.
        let (target_running, name_hint, created_at) = {
            let snapshots = self.snapshots.read().map_err(lock_poisoned)?;
            let snapshot = snapshots
                .get(&req.vm_id)
                .and_then(|list| list.iter().find(|s| s.id == req.snapshot_id))
                .ok_or_else(|| {
                    Status::not_found(format!("snapshot {} not found", req.snapshot_id))
                })?;
            (
                snapshot.include_memory && snapshot.running,
                snapshot.name_hint.clone(),
                snapshot.created_at,
            )
        };

        let mut vms = self.vms.write().map_err(lock_poisoned)?;
        let vm = vms
            .get_mut(&req.vm_id)
            .ok_or_else(|| Status::not_found(format!("vm {} not found", req.vm_id)))?;
        vm.running = target_running;
        if target_running {
            vm.ips = Self::fabricate_ips(&vm.id);
        } else {
            vm.ips.clear();
        }
        drop(vms);

        info!(
            vm_id = %req.vm_id,
            snapshot_id = %req.snapshot_id,
            name_hint = %name_hint,
            taken_at = %created_at,
            "Reverted to snapshot"
        );
        let task_ref = self.start_task(0)?;
        Ok(Response::new(TaskResponse { task_ref }))
    }

    #[instrument(skip(self, request))]
    async fn clone(
        &self,
        request: Request<CloneRequest>,
    ) -> Result<Response<CloneResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();

        // Idempotent on target name.
        {
            let names = self.names.read().map_err(lock_poisoned)?;
            if let Some(id) = names.get(&req.target_name) {
                return Ok(Response::new(CloneResponse {
                    target_vm_id: id.clone(),
                    task_ref: String::new(),
                }));
            }
        }

        let mut vms = self.vms.write().map_err(lock_poisoned)?;
        let source = vms
            .get(&req.vm_id)
            .ok_or_else(|| Status::not_found(format!("vm {} not found", req.vm_id)))?;

        let id = format!("mock-{}", uuid::Uuid::new_v4());
        let clone_vm = MockVm {
            id: id.clone(),
            name: req.target_name.clone(),
            running: false,
            cpu: source.cpu,
            memory_mib: source.memory_mib,
            disks: source.disks.clone(),
            networks: source.networks.clone(),
            tags: source.tags.clone(),
            hostname: source.hostname.clone(),
            ips: Vec::new(),
            imported_disk_path: None,
            guest_data: source.guest_data.clone(),
        };
        vms.insert(id.clone(), clone_vm);
        drop(vms);

        self.names
            .write()
            .map_err(lock_poisoned)?
            .insert(req.target_name.clone(), id.clone());

        info!(source = %req.vm_id, target = %req.target_name, linked = req.linked, "Mock VM cloned");
        let task_ref = self.start_task(0)?;
        Ok(Response::new(CloneResponse {
            target_vm_id: id,
            task_ref,
        }))
    }

    async fn image_prepare(
        &self,
        request: Request<ImagePrepareRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();
        debug!(target_storage = %req.target_storage, "Image prepare is a no-op for the mock pool");
        let task_ref = self.start_task(0)?;
        Ok(Response::new(TaskResponse { task_ref }))
    }

    #[instrument(skip(self, request))]
    async fn export_disk(
        &self,
        request: Request<ExportDiskRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();

        let payload = {
            let vms = self.vms.read().map_err(lock_poisoned)?;
            let vm = vms
                .get(&req.vm_id)
                .ok_or_else(|| Status::not_found(format!("vm {} not found", req.vm_id)))?;
            let boot = vm.disks.first().ok_or_else(|| {
                Status::failed_precondition(format!("vm {} has no disks", req.vm_id))
            })?;
            DiskPayload {
                disk_name: boot.name.clone(),
                format: if req.format.is_empty() {
                    boot.format.clone()
                } else {
                    req.format.clone()
                },
                virtual_size_bytes: boot.size_gib * GIB,
                hostname: vm.hostname.clone(),
                data: vm
                    .guest_data
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "seed": vm.id })),
            }
        };

        let target = self.resolve_url(&req.destination_url)?;
        let contents = serde_json::to_vec(&payload)
            .map_err(|e| Status::internal(format!("encode payload: {}", e)))?;
        stage_and_persist(&target, &contents)?;

        if req.verify_checksum {
            // Sidecar digest so the importing side can verify end to end.
            let digest = sha256_hex(&contents);
            let sidecar = target.with_extension("sha256");
            stage_and_persist(&sidecar, digest.as_bytes())?;
        }

        info!(
            vm_id = %req.vm_id,
            url = %req.destination_url,
            bytes = contents.len(),
            "Disk exported"
        );
        let task_ref = self.start_task(contents.len() as u64)?;
        Ok(Response::new(TaskResponse { task_ref }))
    }

    #[instrument(skip(self, request))]
    async fn import_disk(
        &self,
        request: Request<ImportDiskRequest>,
    ) -> Result<Response<ImportDiskResponse>, Status> {
        self.count_mutation();
        let req = request.into_inner();
        let source = self.resolve_url(&req.source_url)?;

        let contents = std::fs::read(&source)
            .map_err(|_| Status::not_found(format!("source payload {} missing", source.display())))?;
        let checksum = sha256_hex(&contents);

        if req.verify_checksum {
            let expected = if !req.expected_checksum.is_empty() {
                Some(req.expected_checksum.clone())
            } else {
                std::fs::read_to_string(source.with_extension("sha256"))
                    .ok()
                    .map(|s| s.trim().to_string())
            };
            match expected {
                Some(expected) if expected != checksum => {
                    return Err(Status::failed_precondition(format!(
                        "checksum mismatch: expected {}, got {}",
                        expected, checksum
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(Status::failed_precondition(
                        "checksum verification requested but no digest available",
                    ));
                }
            }
        }

        let payload: DiskPayload = serde_json::from_slice(&contents)
            .map_err(|e| Status::invalid_argument(format!("disk payload: {}", e)))?;

        let format = if req.format.is_empty() {
            payload.format.clone()
        } else {
            req.format.clone()
        };
        let target = self
            .options
            .pool_root
            .join(format!("{}.{}", req.target_name, format));

        // Idempotent on target name: an existing pool file is reused.
        if !target.exists() {
            stage_and_persist(&target, &contents)?;
        }

        info!(
            target = %target.display(),
            bytes = contents.len(),
            checksum = %checksum,
            "Disk imported into pool"
        );
        Ok(Response::new(ImportDiskResponse {
            disk_id: format!("disk-{}", req.target_name),
            path: target.to_string_lossy().to_string(),
            actual_size_bytes: payload.virtual_size_bytes,
            checksum,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> MockProvider {
        let dir = tempfile::tempdir().unwrap();
        MockProvider::with_options(MockOptions {
            synchronous: true,
            task_latency: Duration::ZERO,
            mount_root: dir.path().join("mounts"),
            pool_root: dir.path().join("pool"),
        })
    }

    fn create_request(name: &str) -> CreateRequest {
        CreateRequest {
            name: name.to_string(),
            class_json: r#"{"cpu":2,"memoryMiB":4096}"#.to_string(),
            image_json: r#"{"libvirt":{"path":"/images/ubuntu.qcow2"}}"#.to_string(),
            networks_json: r#"["default"]"#.to_string(),
            disks_json: r#"[{"name":"disk0","sizeGiB":20}]"#.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_name() {
        let provider = provider();

        let first = provider
            .create(Request::new(create_request("web-1")))
            .await
            .unwrap()
            .into_inner();
        let second = provider
            .create(Request::new(create_request("web-1")))
            .await
            .unwrap()
            .into_inner();

        assert!(!first.id.is_empty());
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_power_cycle_and_describe() {
        let provider = provider();
        let id = provider
            .create(Request::new(create_request("web-1")))
            .await
            .unwrap()
            .into_inner()
            .id;

        provider
            .power(Request::new(PowerRequest {
                id: id.clone(),
                op: PowerOp::On as i32,
                graceful_timeout_seconds: 0,
            }))
            .await
            .unwrap();

        let desc = provider
            .describe(Request::new(DescribeRequest { id: id.clone() }))
            .await
            .unwrap()
            .into_inner();
        assert!(desc.exists);
        assert_eq!(desc.power_state, PowerState::On as i32);
        assert!(!desc.ips.is_empty());

        provider
            .power(Request::new(PowerRequest {
                id: id.clone(),
                op: PowerOp::ShutdownGraceful as i32,
                graceful_timeout_seconds: 10,
            }))
            .await
            .unwrap();
        let desc = provider
            .describe(Request::new(DescribeRequest { id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(desc.power_state, PowerState::Off as i32);
        assert!(desc.ips.is_empty());
    }

    #[tokio::test]
    async fn test_online_reconfigure_rejected_by_capabilities() {
        let provider = provider();
        let id = provider
            .create(Request::new(create_request("web-1")))
            .await
            .unwrap()
            .into_inner()
            .id;
        provider
            .power(Request::new(PowerRequest {
                id: id.clone(),
                op: PowerOp::On as i32,
                graceful_timeout_seconds: 0,
            }))
            .await
            .unwrap();

        let err = provider
            .reconfigure(Request::new(ReconfigureRequest {
                id: id.clone(),
                desired_json: r#"{"cpu":4}"#.to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        // Powered off it succeeds.
        provider
            .power(Request::new(PowerRequest {
                id: id.clone(),
                op: PowerOp::Off as i32,
                graceful_timeout_seconds: 0,
            }))
            .await
            .unwrap();
        provider
            .reconfigure(Request::new(ReconfigureRequest {
                id: id.clone(),
                desired_json: r#"{"cpu":4}"#.to_string(),
            }))
            .await
            .unwrap();

        let desc = provider
            .describe(Request::new(DescribeRequest { id }))
            .await
            .unwrap()
            .into_inner();
        let raw: serde_json::Value = serde_json::from_str(&desc.provider_raw_json).unwrap();
        assert_eq!(raw["cpu"], 4);
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_and_revert_power_state() {
        let provider = provider();
        let id = provider
            .create(Request::new(create_request("web-1")))
            .await
            .unwrap()
            .into_inner()
            .id;
        provider
            .power(Request::new(PowerRequest {
                id: id.clone(),
                op: PowerOp::On as i32,
                graceful_timeout_seconds: 0,
            }))
            .await
            .unwrap();

        let snap = provider
            .snapshot_create(Request::new(SnapshotCreateRequest {
                vm_id: id.clone(),
                name_hint: "pre-upgrade".to_string(),
                description: "before upgrade".to_string(),
                include_memory: true,
                quiesce: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!snap.snapshot_id.is_empty());

        // Power off, then revert to the memory snapshot: the captured
        // running state comes back.
        provider
            .power(Request::new(PowerRequest {
                id: id.clone(),
                op: PowerOp::Off as i32,
                graceful_timeout_seconds: 0,
            }))
            .await
            .unwrap();
        provider
            .snapshot_revert(Request::new(SnapshotRevertRequest {
                vm_id: id.clone(),
                snapshot_id: snap.snapshot_id.clone(),
            }))
            .await
            .unwrap();
        let desc = provider
            .describe(Request::new(DescribeRequest { id: id.clone() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(desc.power_state, PowerState::On as i32);

        provider
            .snapshot_delete(Request::new(SnapshotDeleteRequest {
                vm_id: id,
                snapshot_id: snap.snapshot_id,
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_export_import_round_trip_preserves_guest() {
        let provider = provider();
        let pvc_dir = provider.options.mount_root.join("mig-1-storage");
        std::fs::create_dir_all(&pvc_dir).unwrap();

        let id = provider
            .create(Request::new(create_request("db-1")))
            .await
            .unwrap()
            .into_inner()
            .id;

        provider
            .export_disk(Request::new(ExportDiskRequest {
                vm_id: id,
                destination_url: "pvc://mig-1-storage/export.qcow2".to_string(),
                format: String::new(),
                verify_checksum: true,
            }))
            .await
            .unwrap();
        assert!(pvc_dir.join("export.qcow2").exists());
        assert!(pvc_dir.join("export.sha256").exists());

        let imported = provider
            .import_disk(Request::new(ImportDiskRequest {
                source_url: "pvc://mig-1-storage/export.qcow2".to_string(),
                target_name: "db-1-restored".to_string(),
                verify_checksum: true,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(imported.disk_id, "disk-db-1-restored");
        assert!(!imported.checksum.is_empty());

        // Create over the imported disk: used in place, hostname preserved.
        let create = provider
            .create(Request::new(CreateRequest {
                name: "db-1-restored".to_string(),
                class_json: r#"{"cpu":2,"memoryMiB":4096}"#.to_string(),
                imported_disk_json: serde_json::json!({
                    "diskId": imported.disk_id,
                    "path": imported.path,
                })
                .to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let desc = provider
            .describe(Request::new(DescribeRequest { id: create.id }))
            .await
            .unwrap()
            .into_inner();
        let raw: serde_json::Value = serde_json::from_str(&desc.provider_raw_json).unwrap();
        assert_eq!(raw["hostname"], "db-1");
        assert_eq!(raw["importedDiskPath"], serde_json::json!(imported.path));
    }

    #[tokio::test]
    async fn test_import_rejects_checksum_mismatch() {
        let provider = provider();
        let pvc_dir = provider.options.mount_root.join("mig-2-storage");
        std::fs::create_dir_all(&pvc_dir).unwrap();

        let id = provider
            .create(Request::new(create_request("db-2")))
            .await
            .unwrap()
            .into_inner()
            .id;
        provider
            .export_disk(Request::new(ExportDiskRequest {
                vm_id: id,
                destination_url: "pvc://mig-2-storage/export.qcow2".to_string(),
                format: String::new(),
                verify_checksum: true,
            }))
            .await
            .unwrap();

        let err = provider
            .import_disk(Request::new(ImportDiskRequest {
                source_url: "pvc://mig-2-storage/export.qcow2".to_string(),
                target_name: "db-2-restored".to_string(),
                expected_checksum: "deadbeef".to_string(),
                verify_checksum: true,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_clone_is_idempotent_on_target_name() {
        let provider = provider();
        let id = provider
            .create(Request::new(create_request("web-1")))
            .await
            .unwrap()
            .into_inner()
            .id;

        let first = provider
            .clone(Request::new(CloneRequest {
                vm_id: id.clone(),
                target_name: "web-1-copy".to_string(),
                linked: true,
                snapshot_name: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        let second = provider
            .clone(Request::new(CloneRequest {
                vm_id: id,
                target_name: "web-1-copy".to_string(),
                linked: true,
                snapshot_name: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(first.target_vm_id, second.target_vm_id);
        assert_eq!(provider.vm_count(), 2);

        // The clone inherits the source shape.
        let desc = provider
            .describe(Request::new(DescribeRequest {
                id: first.target_vm_id,
            }))
            .await
            .unwrap()
            .into_inner();
        let raw: serde_json::Value = serde_json::from_str(&desc.provider_raw_json).unwrap();
        assert_eq!(raw["cpu"], 2);
    }

    #[tokio::test]
    async fn test_delete_absent_vm_is_not_found() {
        let provider = provider();
        let err = provider
            .delete(Request::new(DeleteRequest {
                id: "mock-missing".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_resolve_storage_url() {
        let root = PathBuf::from("/mnt/migration-storage");
        assert_eq!(
            resolve_storage_url("pvc://mig-1/export.qcow2", &root).unwrap(),
            root.join("mig-1").join("export.qcow2")
        );
        assert!(resolve_storage_url("pvc://missing-path", &root).is_err());
        assert!(resolve_storage_url("s3://bucket/key", &root).is_err());
    }
}

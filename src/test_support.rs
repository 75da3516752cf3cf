//! Test support utilities shared across unit and integration tests.
//!
//! Every fake keeps its state behind an `Arc<Mutex<_>>`, so a clone handed
//! to [`Services`] and the clone kept by the test observe the same world.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::subscriber::DefaultGuard;

use crate::backend::BackendFuture;
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::lifecycle::{ComputePlatform, PlatformError, PlatformVolume, PlatformVolumeKind};
use crate::model::{
    ContextId, ContextStatus, NetworkMapping, OperationMode, PowerState, SnapshotBackendKind,
    SnapshotHandle, VmContext, VmId, VmSpec, VolumeId, VolumeReference,
};
use crate::replication::{ReplicationError, ReplicationService, ReplicationStatus};
use crate::services::{Services, Settings, Timings};
use crate::snapshot::{SnapshotBackend, SnapshotError};
use crate::source::{CredentialError, CredentialStore, SourceCredentials, SourcePowerAgent, SourcePowerError};
use crate::store::{FailoverStore, MemoryStore, StoreError};
use crate::tracker::MemoryTracker;
use crate::volume::{DeviceMapping, OperationStatus, VolumeDaemon, VolumeError, VolumeOperation};

/// Hub appliance identifier used by the fixtures.
pub const HUB_VM: &str = "hub-vm";
/// Context identifier of [`sample_context`].
pub const CONTEXT_ID: &str = "ctx-web01";
/// Test network identifier in [`sample_mappings`].
pub const TEST_NETWORK: &str = "net-test";
/// Production network identifier in [`sample_mappings`].
pub const PRODUCTION_NETWORK: &str = "net-prod";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A Windows VM with a boot volume and one data volume, both on the hub.
#[must_use]
pub fn sample_context() -> VmContext {
    let volume = |id: &str, disk: &str, device: &str, size: u64| VolumeReference {
        volume_id: VolumeId::from(id),
        disk_id: disk.to_owned(),
        device_path: Some(device.to_owned()),
        size_bytes: size,
        attached_vm_id: Some(VmId::from(HUB_VM)),
        operation_mode: OperationMode::Hub,
    };
    VmContext {
        context_id: ContextId::from(CONTEXT_ID),
        vm_id: VmId::from("vm-4201"),
        vm_name: String::from("web01"),
        status: ContextStatus::ReadyForFailover,
        current_change_id: Some(String::from("52 3c 2f 7d 1a 44 9e 01-0a b2 4c 7f/1042")),
        os_type: String::from("windows"),
        cpu_count: 2,
        memory_mb: 4096,
        networks: vec![String::from("VM Network")],
        volumes: vec![
            volume("vol-os", "disk-2000", "/dev/vdb", 40 << 30),
            volume("vol-data", "disk-2001", "/dev/vdc", 100 << 30),
        ],
        destination_vm_id: None,
        last_operation_summary: None,
    }
}

/// Production and test mappings for the sample context's network.
#[must_use]
pub fn sample_mappings() -> Vec<NetworkMapping> {
    vec![
        NetworkMapping {
            context_id: ContextId::from(CONTEXT_ID),
            source_network_name: String::from("VM Network"),
            destination_network_id: PRODUCTION_NETWORK.to_owned(),
            is_test_network: false,
        },
        NetworkMapping {
            context_id: ContextId::from(CONTEXT_ID),
            source_network_name: String::from("VM Network"),
            destination_network_id: TEST_NETWORK.to_owned(),
            is_test_network: true,
        },
    ]
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, CommandError> {
        Box::pin(async move {
            lock(&self.invocations).push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
            lock(&self.responses)
                .pop_front()
                .ok_or_else(|| CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Collects formatted log lines emitted on the current thread while the
/// guard returned by [`LogCapture::install`] is alive.
#[derive(Clone, Debug, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `tracing` events to this capture until the guard drops.
    #[must_use]
    pub fn install(&self) -> DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Everything captured so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }

    /// Captured lines raised with `severity="CRITICAL"`.
    #[must_use]
    pub fn critical_lines(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains("severity=\"CRITICAL\""))
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.buffer).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    #[must_use]
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct PlatformState {
    vms: BTreeMap<VmId, PowerState>,
    volumes: BTreeMap<String, (VmId, PlatformVolumeKind)>,
    next_id: usize,
    calls: Vec<String>,
    failing: BTreeSet<&'static str>,
    stall_power: bool,
}

impl PlatformState {
    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn check(&self, operation: &'static str) -> Result<(), PlatformError> {
        if self.failing.contains(operation) {
            return Err(PlatformError::Api {
                status: 530,
                message: format!("{operation} rejected by platform"),
            });
        }
        Ok(())
    }

    fn require_vm(&self, vm_id: &VmId) -> Result<(), PlatformError> {
        if self.vms.contains_key(vm_id) {
            Ok(())
        } else {
            Err(PlatformError::NotFound {
                kind: "vm",
                id: vm_id.to_string(),
            })
        }
    }
}

/// In-memory destination platform.
///
/// New VMs are created stopped with one default root volume. Mutating calls
/// are journalled as `operation:argument`.
#[derive(Clone, Debug, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    /// Creates an empty platform.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a VM in `state`.
    pub fn insert_vm(&self, vm_id: &str, state: PowerState) {
        lock(&self.state).vms.insert(VmId::from(vm_id), state);
    }

    /// Makes every call of `operation` fail.
    pub fn fail_on(&self, operation: &'static str) {
        lock(&self.state).failing.insert(operation);
    }

    /// Makes power requests succeed without changing state.
    pub fn stall_power(&self) {
        lock(&self.state).stall_power = true;
    }

    /// Power state of a VM, or `None` when it does not exist.
    #[must_use]
    pub fn vm_state(&self, vm_id: &VmId) -> Option<PowerState> {
        lock(&self.state).vms.get(vm_id).copied()
    }

    /// Identifiers of all existing VMs.
    #[must_use]
    pub fn vm_ids(&self) -> Vec<VmId> {
        lock(&self.state).vms.keys().cloned().collect()
    }

    /// Platform volumes attached to a VM.
    #[must_use]
    pub fn vm_volume_ids(&self, vm_id: &VmId) -> Vec<String> {
        lock(&self.state)
            .volumes
            .iter()
            .filter(|(_, (owner, _))| owner == vm_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Journal of mutating calls.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of journalled calls of `operation`.
    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    fn set_power(&self, operation: &'static str, vm_id: &VmId, target: PowerState) -> Result<(), PlatformError> {
        let mut state = lock(&self.state);
        state.record(format!("{operation}:{vm_id}"));
        state.check(operation)?;
        state.require_vm(vm_id)?;
        if !state.stall_power {
            state.vms.insert(vm_id.clone(), target);
        }
        Ok(())
    }
}

impl ComputePlatform for FakePlatform {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BackendFuture<'a, VmId, PlatformError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.record(format!("create_vm:{}", spec.name));
            state.check("create_vm")?;
            state.next_id += 1;
            let vm_id = VmId::from(format!("dest-vm-{}", state.next_id));
            let root = format!("root-{}", state.next_id);
            state.vms.insert(vm_id.clone(), PowerState::Off);
            state
                .volumes
                .insert(root, (vm_id.clone(), PlatformVolumeKind::Root));
            Ok(vm_id)
        })
    }

    fn power_on<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(async move { self.set_power("power_on", vm_id, PowerState::On) })
    }

    fn power_off<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(async move { self.set_power("power_off", vm_id, PowerState::Off) })
    }

    fn power_state<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, PowerState, PlatformError> {
        Box::pin(async move {
            let state = lock(&self.state);
            state.check("power_state")?;
            state.require_vm(vm_id)?;
            Ok(state.vms.get(vm_id).copied().unwrap_or(PowerState::Other))
        })
    }

    fn delete_vm<'a>(&'a self, vm_id: &'a VmId) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.record(format!("delete_vm:{vm_id}"));
            state.check("delete_vm")?;
            state.require_vm(vm_id)?;
            state.vms.remove(vm_id);
            state.volumes.retain(|_, (owner, _)| owner != vm_id);
            Ok(())
        })
    }

    fn vm_volumes<'a>(
        &'a self,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, Vec<PlatformVolume>, PlatformError> {
        Box::pin(async move {
            let state = lock(&self.state);
            state.check("vm_volumes")?;
            state.require_vm(vm_id)?;
            Ok(state
                .volumes
                .iter()
                .filter(|(_, (owner, _))| owner == vm_id)
                .map(|(id, (_, kind))| PlatformVolume {
                    id: id.clone(),
                    kind: *kind,
                })
                .collect())
        })
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.record(format!("detach_volume:{volume_id}"));
            state.check("detach_volume")?;
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), PlatformError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.record(format!("delete_volume:{volume_id}"));
            state.check("delete_volume")?;
            state
                .volumes
                .remove(volume_id)
                .map(drop)
                .ok_or_else(|| PlatformError::NotFound {
                    kind: "volume",
                    id: volume_id.to_owned(),
                })
        })
    }
}

#[derive(Debug, Default)]
struct DaemonState {
    attachments: BTreeMap<VolumeId, (VmId, String)>,
    operations: BTreeMap<String, VolumeOperation>,
    next_op: usize,
    calls: Vec<String>,
    failing_targets: BTreeSet<VmId>,
    flaky_targets: BTreeMap<VmId, usize>,
    failing_detaches: BTreeSet<VolumeId>,
    unreachable: bool,
}

impl DaemonState {
    fn reachable(&self) -> Result<(), VolumeError> {
        if self.unreachable {
            return Err(VolumeError::Transport {
                message: String::from("connection refused"),
            });
        }
        Ok(())
    }

    fn next_device(&self, vm_id: &VmId, root: bool) -> String {
        if root {
            return String::from("/dev/vda");
        }
        let used = self
            .attachments
            .values()
            .filter(|(owner, _)| owner == vm_id)
            .count();
        let offset = u8::try_from(used).unwrap_or(0).min(20);
        format!("/dev/vd{}", char::from(b'b' + offset))
    }

    /// Records a submitted operation and returns it in the `executing`
    /// state; polling it yields `completed`.
    fn submit(&mut self, volume_id: &VolumeId, vm_id: Option<&VmId>, kind: &str, device: Option<String>) -> VolumeOperation {
        self.next_op += 1;
        let id = format!("op-{}", self.next_op);
        let mut response = BTreeMap::new();
        if let Some(path) = device {
            response.insert(String::from("device_path"), serde_json::Value::String(path));
        }
        let completed = VolumeOperation {
            id: id.clone(),
            operation_type: kind.to_owned(),
            status: OperationStatus::Completed,
            volume_id: volume_id.clone(),
            vm_id: vm_id.cloned(),
            response,
            error: None,
        };
        self.operations.insert(id, completed.clone());
        VolumeOperation {
            status: OperationStatus::Executing,
            response: BTreeMap::new(),
            ..completed
        }
    }

    fn failed(&mut self, volume_id: &VolumeId, vm_id: Option<&VmId>, kind: &str, error: &str) -> VolumeOperation {
        self.next_op += 1;
        VolumeOperation {
            id: format!("op-{}", self.next_op),
            operation_type: kind.to_owned(),
            status: OperationStatus::Failed,
            volume_id: volume_id.clone(),
            vm_id: vm_id.cloned(),
            response: BTreeMap::new(),
            error: Some(error.to_owned()),
        }
    }

    fn take_flaky(&mut self, vm_id: &VmId) -> bool {
        match self.flaky_targets.get_mut(vm_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn attach(&mut self, volume_id: &VolumeId, vm_id: &VmId, root: bool) -> Result<VolumeOperation, VolumeError> {
        let kind = if root { "attach_root" } else { "attach" };
        self.calls.push(format!("{kind}:{volume_id}:{vm_id}"));
        self.reachable()?;
        if self.failing_targets.contains(vm_id) || self.take_flaky(vm_id) {
            return Ok(self.failed(volume_id, Some(vm_id), kind, "attach rejected by hypervisor"));
        }
        let device = self.next_device(vm_id, root);
        self.attachments
            .insert(volume_id.clone(), (vm_id.clone(), device.clone()));
        Ok(self.submit(volume_id, Some(vm_id), kind, Some(device)))
    }
}

/// In-memory volume daemon.
///
/// Submitted operations take effect immediately and report `executing`
/// until polled once. Submissions are journalled as
/// `attach:{volume}:{vm}`, `attach_root:{volume}:{vm}`, or `detach:{volume}`.
#[derive(Clone, Debug, Default)]
pub struct FakeVolumeDaemon {
    state: Arc<Mutex<DaemonState>>,
}

impl FakeVolumeDaemon {
    /// Creates a daemon with no attachments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `volume_id` as attached to `vm_id` without journalling.
    pub fn seed_attachment(&self, volume_id: &VolumeId, vm_id: &str) {
        let mut state = lock(&self.state);
        let owner = VmId::from(vm_id);
        let device = state.next_device(&owner, false);
        state.attachments.insert(volume_id.clone(), (owner, device));
    }

    /// VM currently holding `volume_id`.
    #[must_use]
    pub fn attached_to(&self, volume_id: &VolumeId) -> Option<VmId> {
        lock(&self.state)
            .attachments
            .get(volume_id)
            .map(|(vm_id, _)| vm_id.clone())
    }

    /// Makes every attach targeting `vm_id` fail.
    pub fn fail_attach_to(&self, vm_id: &str) {
        lock(&self.state).failing_targets.insert(VmId::from(vm_id));
    }

    /// Makes the next `times` attaches targeting `vm_id` fail.
    pub fn fail_next_attaches_to(&self, vm_id: &str, times: usize) {
        lock(&self.state)
            .flaky_targets
            .insert(VmId::from(vm_id), times);
    }

    /// Makes every detach of `volume_id` fail, leaving it attached.
    pub fn fail_detach_of(&self, volume_id: &str) {
        lock(&self.state)
            .failing_detaches
            .insert(VolumeId::from(volume_id));
    }

    /// Simulates a daemon that refuses connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Journal of submitted operations.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }
}

impl VolumeDaemon for FakeVolumeDaemon {
    fn attach<'a>(
        &'a self,
        volume_id: &'a VolumeId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move { lock(&self.state).attach(volume_id, vm_id, false) })
    }

    fn attach_root<'a>(
        &'a self,
        volume_id: &'a VolumeId,
        vm_id: &'a VmId,
    ) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move { lock(&self.state).attach(volume_id, vm_id, true) })
    }

    fn detach<'a>(&'a self, volume_id: &'a VolumeId) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.calls.push(format!("detach:{volume_id}"));
            state.reachable()?;
            if state.failing_detaches.contains(volume_id) {
                return Ok(state.failed(volume_id, None, "detach", "volume is busy"));
            }
            state.attachments.remove(volume_id);
            Ok(state.submit(volume_id, None, "detach", None))
        })
    }

    fn operation<'a>(&'a self, operation_id: &'a str) -> BackendFuture<'a, VolumeOperation, VolumeError> {
        Box::pin(async move {
            let state = lock(&self.state);
            state.reachable()?;
            state
                .operations
                .get(operation_id)
                .cloned()
                .ok_or_else(|| VolumeError::Api {
                    status: 404,
                    message: format!("operation {operation_id} not found"),
                })
        })
    }

    fn device_mapping<'a>(
        &'a self,
        volume_id: &'a VolumeId,
    ) -> BackendFuture<'a, Option<DeviceMapping>, VolumeError> {
        Box::pin(async move {
            let state = lock(&self.state);
            state.reachable()?;
            Ok(state
                .attachments
                .get(volume_id)
                .map(|(vm_id, device)| DeviceMapping {
                    volume_id: volume_id.clone(),
                    vm_id: vm_id.clone(),
                    device_path: Some(device.clone()),
                }))
        })
    }

    fn health(&self) -> BackendFuture<'_, (), VolumeError> {
        Box::pin(async move { lock(&self.state).reachable() })
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    live: BTreeMap<String, SnapshotHandle>,
    next: usize,
    calls: Vec<String>,
    failing_creates: BTreeSet<VolumeId>,
    failing_reverts: BTreeSet<VolumeId>,
}

/// In-memory snapshot backend.
///
/// Calls are journalled as `create:{volume}:{name}`, `revert:{id}`, and
/// `delete:{id}`.
#[derive(Clone, Debug)]
pub struct FakeSnapshots {
    kind: SnapshotBackendKind,
    state: Arc<Mutex<SnapshotState>>,
}

impl FakeSnapshots {
    /// Creates a backend reporting `kind`.
    #[must_use]
    pub fn new(kind: SnapshotBackendKind) -> Self {
        Self {
            kind,
            state: Arc::default(),
        }
    }

    /// Adds an existing snapshot.
    pub fn seed(&self, handle: SnapshotHandle) {
        lock(&self.state).live.insert(handle.id.clone(), handle);
    }

    /// Makes snapshot creation fail for `volume_id`.
    pub fn fail_create_for(&self, volume_id: &str) {
        lock(&self.state)
            .failing_creates
            .insert(VolumeId::from(volume_id));
    }

    /// Makes reverts fail for `volume_id`.
    pub fn fail_revert_for(&self, volume_id: &str) {
        lock(&self.state)
            .failing_reverts
            .insert(VolumeId::from(volume_id));
    }

    /// Drops a snapshot behind the caller's back.
    pub fn forget(&self, snapshot_id: &str) {
        lock(&self.state).live.remove(snapshot_id);
    }

    /// Identifiers of existing snapshots.
    #[must_use]
    pub fn live_ids(&self) -> Vec<String> {
        lock(&self.state).live.keys().cloned().collect()
    }

    /// Journal of calls.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of journalled calls of `operation`.
    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }
}

impl SnapshotBackend for FakeSnapshots {
    fn kind(&self) -> SnapshotBackendKind {
        self.kind
    }

    fn create<'a>(
        &'a self,
        volume: &'a VolumeReference,
        name: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, SnapshotError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state
                .calls
                .push(format!("create:{}:{name}", volume.volume_id));
            if state.failing_creates.contains(&volume.volume_id) {
                return Err(SnapshotError::Backend {
                    message: String::from("snapshot quota exceeded"),
                });
            }
            state.next += 1;
            let handle = SnapshotHandle {
                id: format!("snap-{}", state.next),
                name: name.to_owned(),
                backend: self.kind,
                volume_id: volume.volume_id.clone(),
                disk_id: volume.disk_id.clone(),
                created_at: Utc::now(),
            };
            state.live.insert(handle.id.clone(), handle.clone());
            Ok(handle)
        })
    }

    fn revert<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.calls.push(format!("revert:{}", handle.id));
            if !state.live.contains_key(&handle.id) {
                return Err(SnapshotError::NotFound {
                    snapshot_id: handle.id.clone(),
                });
            }
            if state.failing_reverts.contains(&handle.volume_id) {
                return Err(SnapshotError::Backend {
                    message: String::from("volume is busy"),
                });
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, handle: &'a SnapshotHandle) -> BackendFuture<'a, (), SnapshotError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.calls.push(format!("delete:{}", handle.id));
            state
                .live
                .remove(&handle.id)
                .map(drop)
                .ok_or_else(|| SnapshotError::NotFound {
                    snapshot_id: handle.id.clone(),
                })
        })
    }
}

#[derive(Debug)]
struct AgentState {
    power: PowerState,
    calls: Vec<String>,
    ignore_requests: bool,
    unreachable: bool,
}

/// In-memory source power agent.
#[derive(Clone, Debug)]
pub struct FakeSourceAgent {
    state: Arc<Mutex<AgentState>>,
}

impl FakeSourceAgent {
    /// Creates an agent whose VM starts in `power`.
    #[must_use]
    pub fn with_state(power: PowerState) -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentState {
                power,
                calls: Vec::new(),
                ignore_requests: false,
                unreachable: false,
            })),
        }
    }

    /// Makes power requests succeed without changing state.
    pub fn ignore_power_requests(&self) {
        lock(&self.state).ignore_requests = true;
    }

    /// Simulates an agent that refuses connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Current power state.
    #[must_use]
    pub fn state(&self) -> PowerState {
        lock(&self.state).power
    }

    /// Journal of power-on and power-off requests.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn change(&self, operation: &str, vm_id: &VmId, target: PowerState) -> Result<PowerState, SourcePowerError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{operation}:{vm_id}"));
        if state.unreachable {
            return Err(SourcePowerError::Transport {
                message: String::from("connection refused"),
            });
        }
        if !state.ignore_requests {
            state.power = target;
        }
        Ok(state.power)
    }
}

impl SourcePowerAgent for FakeSourceAgent {
    fn power_on<'a>(
        &'a self,
        vm_id: &'a VmId,
        _credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError> {
        Box::pin(async move { self.change("power_on", vm_id, PowerState::On) })
    }

    fn power_off<'a>(
        &'a self,
        vm_id: &'a VmId,
        _credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError> {
        Box::pin(async move { self.change("power_off", vm_id, PowerState::Off) })
    }

    fn power_state<'a>(
        &'a self,
        _vm_id: &'a VmId,
        _credentials: &'a SourceCredentials,
    ) -> BackendFuture<'a, PowerState, SourcePowerError> {
        Box::pin(async move {
            let state = lock(&self.state);
            if state.unreachable {
                return Err(SourcePowerError::Transport {
                    message: String::from("connection refused"),
                });
            }
            Ok(state.power)
        })
    }
}

/// Credential store returning fixed test credentials.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials;

impl CredentialStore for StaticCredentials {
    fn source_credentials(&self) -> Result<SourceCredentials, CredentialError> {
        Ok(SourceCredentials::new(
            "vcenter.test",
            "svc-cutover",
            "not-a-real-password",
        ))
    }
}

#[derive(Debug)]
struct ReplicationState {
    running_polls: usize,
    failure: Option<String>,
    started: usize,
}

/// In-memory replication service.
#[derive(Clone, Debug)]
pub struct FakeReplication {
    state: Arc<Mutex<ReplicationState>>,
}

impl FakeReplication {
    /// Syncs report running `polls` times, then completed.
    #[must_use]
    pub fn completing_after(polls: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplicationState {
                running_polls: polls,
                failure: None,
                started: 0,
            })),
        }
    }

    /// Syncs fail with `message`.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplicationState {
                running_polls: 0,
                failure: Some(message.to_owned()),
                started: 0,
            })),
        }
    }

    /// Number of syncs started.
    #[must_use]
    pub fn started(&self) -> usize {
        lock(&self.state).started
    }
}

impl ReplicationService for FakeReplication {
    fn start_incremental<'a>(
        &'a self,
        _context_id: &'a ContextId,
        _vm_id: &'a VmId,
    ) -> BackendFuture<'a, String, ReplicationError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.started += 1;
            Ok(format!("sync-{}", state.started))
        })
    }

    fn status<'a>(&'a self, _job_id: &'a str) -> BackendFuture<'a, ReplicationStatus, ReplicationError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if let Some(message) = &state.failure {
                return Ok(ReplicationStatus::Failed {
                    message: message.clone(),
                });
            }
            if state.running_polls > 0 {
                state.running_polls -= 1;
                return Ok(ReplicationStatus::Running);
            }
            Ok(ReplicationStatus::Completed)
        })
    }
}

/// Every fake wired together, seeded with [`sample_context`] and
/// [`sample_mappings`] and with both volumes attached to the hub.
#[derive(Clone, Debug)]
pub struct TestBed {
    /// State store.
    pub store: MemoryStore,
    /// Job tracker.
    pub tracker: MemoryTracker,
    /// Destination platform.
    pub platform: FakePlatform,
    /// Volume daemon.
    pub daemon: FakeVolumeDaemon,
    /// Per-volume snapshot backend.
    pub per_volume: FakeSnapshots,
    /// Distributed snapshot backend.
    pub distributed: FakeSnapshots,
    /// Command runner for the injection tool and snapshot CLI.
    pub runner: ScriptedRunner,
    /// Source power agent; the source VM starts powered on.
    pub agent: FakeSourceAgent,
    /// Replication service.
    pub replication: FakeReplication,
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBed {
    /// Builds a seeded test bed.
    #[must_use]
    pub fn new() -> Self {
        let context = sample_context();
        let daemon = FakeVolumeDaemon::new();
        for volume in &context.volumes {
            daemon.seed_attachment(&volume.volume_id, HUB_VM);
        }
        let store = MemoryStore::with_contexts([context]);
        // MemoryStore writes cannot fail.
        drop(store.save_network_mappings(&ContextId::from(CONTEXT_ID), &sample_mappings()));
        Self {
            store,
            tracker: MemoryTracker::new(),
            platform: FakePlatform::new(),
            daemon,
            per_volume: FakeSnapshots::new(SnapshotBackendKind::PerVolume),
            distributed: FakeSnapshots::new(SnapshotBackendKind::DistributedBlock),
            runner: ScriptedRunner::new(),
            agent: FakeSourceAgent::with_state(PowerState::On),
            replication: FakeReplication::completing_after(1),
        }
    }

    /// Services backed by the fakes, with millisecond timings.
    #[must_use]
    pub fn services(&self) -> Services {
        Services {
            store: Arc::new(self.store.clone()),
            tracker: Arc::new(self.tracker.clone()),
            platform: Arc::new(self.platform.clone()),
            volume_daemon: Arc::new(self.daemon.clone()),
            per_volume_snapshots: Arc::new(self.per_volume.clone()),
            distributed_snapshots: Arc::new(self.distributed.clone()),
            commands: Arc::new(self.runner.clone()),
            source_agent: Arc::new(self.agent.clone()),
            credentials: Arc::new(StaticCredentials),
            replication: Arc::new(self.replication.clone()),
            settings: Settings {
                hub_vm_id: VmId::from(HUB_VM),
                default_network_id: Some(String::from("net-default")),
                injection_script: Utf8PathBuf::from("/opt/cutover/bin/inject.sh"),
                injection_log_dir: Utf8PathBuf::from("/var/log/cutover"),
                timings: Timings::immediate(),
            },
        }
    }

    /// Current state of the sample context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context was removed.
    pub fn context(&self) -> Result<VmContext, StoreError> {
        self.store.context(&ContextId::from(CONTEXT_ID))
    }

    /// Replaces the sample context's guest OS label.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the context cannot be updated.
    pub fn set_os_type(&self, os_type: &str) -> Result<(), StoreError> {
        let mut context = self.context()?;
        context.os_type = os_type.to_owned();
        self.store.save_context(&context)
    }
}

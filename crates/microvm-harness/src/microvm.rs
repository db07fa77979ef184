//! One microVM under test: its host directories, jail, launched process,
//! console log and control API, from `setup` to `kill`.
//!
//! A `Microvm` must be torn down explicitly with [`Microvm::kill`]; dropping
//! it only warns. Wrap test bodies so `kill` runs on every exit path.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use microvm_process::{InstanceInfo, MicrovmId};
use regex::Regex;
use serde_json::json;
use tokio::process::Child;

use crate::{
    HarnessError, affinity,
    api::ApiClients,
    console::{ConsoleMonitor, Fifo, LogSink},
    jailer::JailerContext,
    launcher::{self, LaunchMode},
    monitors::{CpuLoadMonitor, MemoryMonitor},
    pidfile, support,
};

pub const READY_MARKER: &str = "Running Firecracker";
pub const CRASH_MARKER: &str = "Shutting down VM after intercepting signal";

const KERNEL_RELPATH: &str = "kernel";
const FSFILES_RELPATH: &str = "fsfiles";
const LOCALTIME: &str = "/etc/localtime";

const SOCKET_POLL_TRIES: u32 = 5;
const SOCKET_POLL_DELAY: Duration = Duration::from_millis(200);
const LOG_POLL_TRIES: u32 = 5;
const LOG_POLL_DELAY: Duration = Duration::from_millis(100);
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MicrovmConfig {
    pub resource_root: PathBuf,
    pub fc_binary: PathBuf,
    pub jailer_binary: PathBuf,
    pub id: MicrovmId,
    pub monitor_memory: bool,
    pub bin_cloner: Option<PathBuf>,
}

impl MicrovmConfig {
    pub fn new(
        resource_root: impl Into<PathBuf>,
        fc_binary: impl Into<PathBuf>,
        jailer_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resource_root: resource_root.into(),
            fc_binary: fc_binary.into(),
            jailer_binary: jailer_binary.into(),
            id: MicrovmId::new(),
            monitor_memory: true,
            bin_cloner: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub create_logger: bool,
    /// Name of the log FIFO, created under the microVM's host directory.
    pub log_file: String,
    pub log_level: String,
    pub use_ramdisk: bool,
    pub create_netns: bool,
    pub metrics_path: Option<PathBuf>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            create_logger: true,
            log_file: "log_fifo".to_string(),
            // The hypervisor defaults to Warning, which hides the boot-time line.
            log_level: "Info".to_string(),
            use_ramdisk: false,
            create_netns: true,
            metrics_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicConfig {
    pub vcpu_count: u8,
    pub smt: Option<bool>,
    pub mem_size_mib: u64,
    pub add_root_device: bool,
    pub boot_args: Option<String>,
    pub use_initrd: bool,
    pub track_dirty_pages: bool,
    pub rootfs_io_engine: Option<String>,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            smt: None,
            mem_size_mib: 256,
            add_root_device: true,
            boot_args: None,
            use_initrd: false,
            track_dirty_pages: false,
            rootfs_io_engine: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriveSpec {
    pub drive_id: String,
    pub file_path: PathBuf,
    pub root_device: bool,
    pub is_read_only: bool,
    pub partuuid: Option<String>,
    pub cache_type: Option<String>,
    pub io_engine: Option<String>,
    pub use_ramdisk: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: Option<String>,
    pub allow_mmds_requests: bool,
    pub tx_rate_limiter: Option<serde_json::Value>,
    pub rx_rate_limiter: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RestoreSnapshot {
    pub mem: PathBuf,
    pub vmstate: PathBuf,
    pub disks: Vec<PathBuf>,
    pub is_diff: bool,
}

/// How to reach a guest over ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub username: String,
    pub hostname: Option<String>,
    pub netns_file_path: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
}

pub struct Microvm {
    id: MicrovmId,
    path: PathBuf,
    kernel_path: PathBuf,
    fsfiles_path: PathBuf,
    fc_binary: PathBuf,
    jailer_binary: PathBuf,
    bin_cloner: Option<PathBuf>,
    session_name: String,

    pub kernel_file: Option<PathBuf>,
    pub rootfs_file: Option<PathBuf>,
    pub initrd_file: Option<PathBuf>,
    /// MMDS contents, linked into the jail and passed as `--metadata`.
    pub metadata_file: Option<PathBuf>,
    pub vcpus_count: Option<u8>,
    pub ssh_hostname: Option<String>,
    pub ssh_key: Option<PathBuf>,

    pub(crate) jailer: JailerContext,
    pub(crate) api: Option<ApiClients>,
    pub(crate) jailer_clone_pid: Option<i32>,
    pub(crate) screen_pid: Option<i32>,
    pub(crate) screen_log: Option<PathBuf>,
    pub(crate) child: Option<Child>,

    log: Arc<LogSink>,
    console: ConsoleMonitor,
    monitor_memory: bool,
    pub(crate) memory_monitor: Option<MemoryMonitor>,
    cpu_load_monitor: Option<CpuLoadMonitor>,

    expect_kill_by_signal: bool,
    signalled: bool,
    killed: bool,
}

impl std::fmt::Debug for Microvm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microvm")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("session_name", &self.session_name)
            .field("jailer_clone_pid", &self.jailer_clone_pid)
            .field("screen_pid", &self.screen_pid)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

impl Microvm {
    pub fn new(cfg: MicrovmConfig) -> anyhow::Result<Self> {
        for bin in [&cfg.fc_binary, &cfg.jailer_binary] {
            if !bin.exists() {
                anyhow::bail!("binary not found: {}", bin.display());
            }
        }

        let id = cfg.id;
        let path = cfg.resource_root.join(id.as_str());
        let root_name = cfg
            .resource_root
            .components()
            .next_back()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let session_name = format!("{root_name}{id}");

        Ok(Self {
            jailer: JailerContext::new(id.as_str(), &cfg.fc_binary),
            log: Arc::new(LogSink::new(id.as_str())),
            kernel_path: path.join(KERNEL_RELPATH),
            fsfiles_path: path.join(FSFILES_RELPATH),
            path,
            id,
            fc_binary: cfg.fc_binary,
            jailer_binary: cfg.jailer_binary,
            bin_cloner: cfg.bin_cloner,
            session_name,
            kernel_file: None,
            rootfs_file: None,
            initrd_file: None,
            metadata_file: None,
            vcpus_count: None,
            ssh_hostname: None,
            ssh_key: None,
            api: None,
            jailer_clone_pid: None,
            screen_pid: None,
            screen_log: None,
            child: None,
            console: ConsoleMonitor::new(),
            monitor_memory: cfg.monitor_memory,
            memory_monitor: None,
            cpu_load_monitor: None,
            expect_kill_by_signal: false,
            signalled: false,
            killed: false,
        })
    }

    pub fn id(&self) -> &MicrovmId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kernel_path(&self) -> &Path {
        &self.kernel_path
    }

    pub fn fsfiles(&self) -> &Path {
        &self.fsfiles_path
    }

    pub fn fc_binary(&self) -> &Path {
        &self.fc_binary
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn jailer(&self) -> &JailerContext {
        &self.jailer
    }

    /// Adjust the jail before `spawn`.
    pub fn jailer_mut(&mut self) -> &mut JailerContext {
        &mut self.jailer
    }

    pub fn chroot(&self) -> PathBuf {
        self.jailer.chroot_path()
    }

    pub fn jailer_clone_pid(&self) -> Option<i32> {
        self.jailer_clone_pid
    }

    pub fn screen_pid(&self) -> Option<i32> {
        self.screen_pid
    }

    pub fn screen_log(&self) -> Option<&Path> {
        self.screen_log.as_deref()
    }

    pub fn memory_monitor(&self) -> Option<&MemoryMonitor> {
        self.memory_monitor.as_ref()
    }

    /// The control API clients; only available after `spawn`.
    pub fn api(&self) -> anyhow::Result<&ApiClients> {
        self.api
            .as_ref()
            .ok_or_else(|| HarnessError::NotSpawned(self.id.to_string()).into())
    }

    /// PID of the hypervisor inside its own PID namespace, if it runs in one.
    pub fn pid_in_new_ns(&self) -> Option<i32> {
        pidfile::resolve_namespaced_pid(&self.jailer.chroot_path())
    }

    pub fn process_alive(&self) -> bool {
        self.jailer_clone_pid.is_some_and(support::pid_exists)
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            username: "root".to_string(),
            hostname: self.ssh_hostname.clone(),
            netns_file_path: self.jailer.netns_file_path(),
            ssh_key: self.ssh_key.clone(),
        }
    }

    /// Create the host directory layout: `<root>/<id>/{kernel,fsfiles}`.
    pub async fn setup(&self) -> anyhow::Result<()> {
        for dir in [&self.path, &self.kernel_path, &self.fsfiles_path] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn create_jailed_resource(&self, path: &Path, create_jail: bool) -> anyhow::Result<PathBuf> {
        self.jailer.jailed_path(path, true, create_jail)
    }

    pub fn get_jailed_resource(&self, path: &Path) -> anyhow::Result<PathBuf> {
        self.jailer.jailed_path(path, false, false)
    }

    pub fn copy_to_jail_ramfs(&self, path: &Path) -> anyhow::Result<PathBuf> {
        self.jailer.copy_to_ramfs(path)
    }

    pub async fn spawn(&mut self, opts: SpawnOptions) -> anyhow::Result<()> {
        self.jailer.setup(opts.create_netns, opts.use_ramdisk).await?;
        if let Err(e) = self.jailer.copy_into_root(Path::new(LOCALTIME), true) {
            tracing::debug!(microvm_id = %self.id, error = %e, "no localtime in jail");
        }

        let socket = self.jailer.api_socket_path();
        self.api = Some(ApiClients::unix_socket(&socket));

        if opts.create_logger {
            let fifo = Fifo::create(self.path.join(&opts.log_file))?;
            self.create_jailed_resource(fifo.path(), true)?;
            self.jailer
                .set_extra_arg("log-path", Some(opts.log_file.clone()));
            self.jailer
                .set_extra_arg("level", Some(opts.log_level.clone()));
            self.console
                .start(fifo.path(), &self.log)
                .context("start console monitor")?;
        }

        if let Some(metrics) = &opts.metrics_path {
            let jailed = self.create_jailed_resource(metrics, true)?;
            self.jailer
                .set_extra_arg("metrics-path", Some(jailed_name(&jailed)));
        }

        if let Some(metadata) = self.metadata_file.clone() {
            if metadata.exists() {
                self.create_jailed_resource(&metadata, true)?;
            }
            let name = metadata
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.jailer.set_extra_arg("metadata", Some(name));
        }

        let args = self.jailer.construct_param_list();
        let mode = if self.jailer.daemonize {
            LaunchMode::Daemonized {
                // The clone helper cannot be combined with the jailer's own
                // --new-pid-ns.
                cloner: self.bin_cloner.clone().filter(|_| !self.jailer.new_pid_ns),
            }
        } else {
            let log_path = launcher::screen_log_path(&self.session_name);
            self.screen_log = Some(log_path.clone());
            LaunchMode::Screen {
                session: self.session_name.clone(),
                log_path,
            }
        };

        let mut launched = launcher::launch(&self.jailer_binary, &args, &mode).await?;
        self.child = launched.take_child();
        self.jailer_clone_pid = Some(launched.pid);
        self.screen_pid = launched.screen_pid;
        tracing::info!(
            microvm_id = %self.id,
            pid = launched.pid,
            screen_pid = ?launched.screen_pid,
            daemonize = self.jailer.daemonize,
            "microvm launched"
        );

        if !self.jailer.has_extra_arg("no-api") {
            let ready =
                support::poll_until(SOCKET_POLL_TRIES, SOCKET_POLL_DELAY, || socket.exists()).await;
            if !ready {
                return Err(HarnessError::ReadinessTimeout {
                    what: format!("API socket {}", socket.display()),
                }
                .into());
            }
            tracing::debug!(microvm_id = %self.id, socket = %socket.display(), "api socket ready");
        }

        if opts.create_logger {
            self.check_log_message(READY_MARKER).await?;
        }
        Ok(())
    }

    pub async fn log_data(&self) -> String {
        self.log.text().await
    }

    async fn poll_log<F>(&self, mut found: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        for attempt in 1..=LOG_POLL_TRIES {
            if found(&self.log.text().await) {
                return true;
            }
            if attempt < LOG_POLL_TRIES {
                tokio::time::sleep(LOG_POLL_DELAY).await;
            }
        }
        false
    }

    /// Wait briefly for `message` to show up in the log.
    pub async fn check_log_message(&self, message: &str) -> anyhow::Result<()> {
        if self.poll_log(|log| log.contains(message)).await {
            return Ok(());
        }
        Err(HarnessError::ReadinessTimeout {
            what: format!("log message {message:?}"),
        }
        .into())
    }

    pub async fn check_any_log_message(&self, messages: &[&str]) -> anyhow::Result<()> {
        if self
            .poll_log(|log| messages.iter().any(|m| log.contains(m)))
            .await
        {
            return Ok(());
        }
        Err(HarnessError::ReadinessTimeout {
            what: format!("any of {messages:?} in log:\n{}", self.log.text().await),
        }
        .into())
    }

    /// Wait for `pattern` to match the log and return every match (group 1
    /// when the pattern has a capture group).
    pub async fn find_log_message(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let re = Regex::new(pattern).with_context(|| format!("invalid log pattern {pattern:?}"))?;
        for attempt in 1..=LOG_POLL_TRIES {
            let found = self.log.find_all(&re).await;
            if !found.is_empty() {
                return Ok(found);
            }
            if attempt < LOG_POLL_TRIES {
                tokio::time::sleep(LOG_POLL_DELAY).await;
            }
        }
        Err(HarnessError::ReadinessTimeout {
            what: format!("log pattern {pattern:?}"),
        }
        .into())
    }

    /// Type `input` into the serial console of a screen-launched microVM.
    pub async fn serial_input(&self, input: &str) -> anyhow::Result<()> {
        launcher::screen_stuff(&self.session_name, input).await
    }

    /// Machine config, boot source and (optionally) the root drive, in that
    /// order. Stops at the first call that does not succeed.
    pub async fn basic_config(&mut self, cfg: BasicConfig) -> anyhow::Result<()> {
        let api = self.api()?.clone();

        let mut machine = json!({
            "vcpu_count": cfg.vcpu_count,
            "mem_size_mib": cfg.mem_size_mib,
            "track_dirty_pages": cfg.track_dirty_pages,
        });
        if let Some(smt) = cfg.smt {
            machine["smt"] = json!(smt);
        }
        api.machine_cfg.put(&machine).await?.error_for_status()?;
        self.vcpus_count = Some(cfg.vcpu_count);

        if self.monitor_memory {
            let mut monitor = MemoryMonitor::new(cfg.mem_size_mib);
            if let Some(pid) = self.jailer_clone_pid {
                monitor.start(pid);
            }
            self.memory_monitor = Some(monitor);
        }

        let kernel = self
            .kernel_file
            .clone()
            .ok_or_else(|| anyhow::anyhow!("kernel_file is not set"))?;
        let mut boot = json!({
            "kernel_image_path": self.create_jailed_resource(&kernel, false)?,
        });
        if let Some(args) = &cfg.boot_args {
            boot["boot_args"] = json!(args);
        }
        if cfg.use_initrd
            && let Some(initrd) = self.initrd_file.clone()
        {
            boot["initrd_path"] = json!(self.create_jailed_resource(&initrd, false)?);
        }
        api.boot.put(&boot).await?.error_for_status()?;

        if cfg.add_root_device
            && let Some(rootfs) = self.rootfs_file.clone()
        {
            let mut drive = json!({
                "drive_id": "rootfs",
                "path_on_host": self.create_jailed_resource(&rootfs, false)?,
                "is_root_device": true,
                "is_read_only": false,
            });
            if let Some(engine) = &cfg.rootfs_io_engine {
                drive["io_engine"] = json!(engine);
            }
            api.drive.put_id("rootfs", &drive).await?.error_for_status()?;
        }
        Ok(())
    }

    pub async fn add_drive(&self, spec: DriveSpec) -> anyhow::Result<()> {
        let path_on_host = if spec.use_ramdisk {
            self.copy_to_jail_ramfs(&spec.file_path)?
        } else {
            self.create_jailed_resource(&spec.file_path, false)?
        };
        let mut body = json!({
            "drive_id": spec.drive_id,
            "path_on_host": path_on_host,
            "is_root_device": spec.root_device,
            "is_read_only": spec.is_read_only,
        });
        if let Some(v) = &spec.partuuid {
            body["partuuid"] = json!(v);
        }
        if let Some(v) = &spec.cache_type {
            body["cache_type"] = json!(v);
        }
        if let Some(v) = &spec.io_engine {
            body["io_engine"] = json!(v);
        }
        self.api()?
            .drive
            .put_id(&spec.drive_id, &body)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn patch_drive(&self, drive_id: &str, file: &Path) -> anyhow::Result<()> {
        let body = json!({
            "drive_id": drive_id,
            "path_on_host": self.create_jailed_resource(file, false)?,
        });
        self.api()?
            .drive
            .patch_id(drive_id, &body)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn put_network(&self, spec: NetworkSpec) -> anyhow::Result<()> {
        let mut body = json!({
            "iface_id": spec.iface_id,
            "host_dev_name": spec.host_dev_name,
            "allow_mmds_requests": spec.allow_mmds_requests,
        });
        if let Some(mac) = &spec.guest_mac {
            body["guest_mac"] = json!(mac);
        }
        if let Some(v) = &spec.tx_rate_limiter {
            body["tx_rate_limiter"] = v.clone();
        }
        if let Some(v) = &spec.rx_rate_limiter {
            body["rx_rate_limiter"] = v.clone();
        }
        self.api()?
            .network
            .put_id(&spec.iface_id, &body)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn describe(&self) -> anyhow::Result<InstanceInfo> {
        let resp = self.api()?.desc_inst.get().await?.error_for_status()?;
        InstanceInfo::parse(&resp.body).context("decode instance info")
    }

    pub async fn state(&self) -> anyhow::Result<Option<microvm_process::InstanceState>> {
        Ok(self.describe().await?.state)
    }

    /// Legacy boolean start flag, for snapshots of older hypervisors.
    pub async fn started(&self) -> anyhow::Result<Option<bool>> {
        Ok(self.describe().await?.started)
    }

    pub async fn firecracker_version(&self) -> anyhow::Result<String> {
        let resp = self.api()?.version.get().await?.error_for_status()?;
        let v: serde_json::Value = resp.json()?;
        v.get("firecracker_version")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("no firecracker_version in {}", resp.body))
    }

    pub async fn start(&self, check: bool) -> anyhow::Result<()> {
        let before = self.describe().await?.start_state();
        if !before.is_some_and(|s| s.is_not_started()) {
            return Err(HarnessError::InvalidState(format!(
                "expected a microvm that has not started, found {before:?}"
            ))
            .into());
        }

        let resp = self
            .api()?
            .actions
            .put(&json!({ "action_type": "InstanceStart" }))
            .await?;
        if !check {
            return Ok(());
        }
        resp.error_for_status()?;

        let after = self.describe().await?.start_state();
        if !after.is_some_and(|s| s.is_running()) {
            return Err(HarnessError::InvalidState(format!(
                "expected a running microvm after start, found {after:?}"
            ))
            .into());
        }
        tracing::info!(microvm_id = %self.id, "microvm started");
        Ok(())
    }

    pub async fn pause_to_snapshot(
        &self,
        mem_file_path: &Path,
        snapshot_path: &Path,
        diff: bool,
        version: Option<&str>,
    ) -> anyhow::Result<()> {
        let api = self.api()?;
        api.vm
            .patch(&json!({ "state": "Paused" }))
            .await?
            .error_for_status()?;

        // Snapshotting a large guest can outlast the request timeout.
        api.session.untime();
        let mut body = json!({
            "mem_file_path": mem_file_path,
            "snapshot_path": snapshot_path,
            "snapshot_type": if diff { "Diff" } else { "Full" },
        });
        if let Some(v) = version {
            body["version"] = json!(v);
        }
        api.snapshot_create.put(&body).await?.error_for_status()?;
        Ok(())
    }

    /// Link every snapshot file into the jail, then load and resume.
    pub async fn restore_from_snapshot(&self, snapshot: &RestoreSnapshot) -> anyhow::Result<()> {
        if snapshot.disks.is_empty() {
            anyhow::bail!("restoring a snapshot requires at least one disk");
        }
        let api = self.api()?;

        let jailed_mem = self.create_jailed_resource(&snapshot.mem, false)?;
        let jailed_vmstate = self.create_jailed_resource(&snapshot.vmstate, false)?;
        for disk in &snapshot.disks {
            self.create_jailed_resource(disk, false)?;
        }

        api.snapshot_load
            .put(&json!({
                "mem_file_path": jailed_mem,
                "snapshot_path": jailed_vmstate,
                "enable_diff_snapshots": snapshot.is_diff,
                "resume_vm": true,
            }))
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Flush metrics and return the single JSON line the hypervisor wrote.
    pub async fn flush_metrics(&self, metrics_fifo: &Fifo) -> anyhow::Result<serde_json::Value> {
        let _ = metrics_fifo.sequential_reader(100)?;
        self.put_flush_metrics().await?;

        let lines = metrics_fifo.sequential_reader(100)?;
        let [line] = lines.as_slice() else {
            anyhow::bail!("expected one metrics line after flush, got {}", lines.len());
        };
        serde_json::from_str(line).context("decode metrics line")
    }

    pub async fn get_all_metrics(&self, metrics_fifo: &Fifo) -> anyhow::Result<Vec<String>> {
        self.put_flush_metrics().await?;
        metrics_fifo.sequential_reader(1000)
    }

    async fn put_flush_metrics(&self) -> anyhow::Result<()> {
        let resp = self
            .api()?
            .actions
            .put(&json!({ "action_type": "FlushMetrics" }))
            .await?
            .error_for_status()?;
        if resp.status != 204 {
            anyhow::bail!("FlushMetrics returned {} instead of 204", resp.status);
        }
        Ok(())
    }

    pub fn enable_cpu_load_monitor(&mut self, threshold_percent: u32) -> anyhow::Result<()> {
        let pid = self
            .jailer_clone_pid
            .ok_or_else(|| HarnessError::NotSpawned(self.id.to_string()))?;
        let mut monitor = CpuLoadMonitor::new(threshold_percent);
        // The emulation thread is the process's first thread.
        monitor.start(pid, pid);
        self.cpu_load_monitor = Some(monitor);
        Ok(())
    }

    async fn pin(&self, thread: &str, cpu: usize) -> anyhow::Result<bool> {
        let Some(pid) = self.jailer_clone_pid else {
            return Ok(false);
        };
        affinity::pin_named_thread(pid, thread, cpu).await
    }

    pub async fn pin_vmm(&self, cpu: usize) -> anyhow::Result<bool> {
        self.pin(affinity::VMM_THREAD, cpu).await
    }

    pub async fn pin_vcpu(&self, vcpu: usize, cpu: usize) -> anyhow::Result<bool> {
        self.pin(&affinity::vcpu_thread(vcpu), cpu).await
    }

    pub async fn pin_api(&self, cpu: usize) -> anyhow::Result<bool> {
        self.pin(affinity::API_THREAD, cpu).await
    }

    /// Tear the microVM down. Safe to call any number of times and on a
    /// microVM that was never spawned.
    ///
    /// Only a failed resource-monitor check is reported as an error.
    pub async fn kill(&mut self) -> anyhow::Result<()> {
        self.killed = true;

        self.console.stop();

        if !self.expect_kill_by_signal && self.log.contains(CRASH_MARKER).await {
            // Too late to fail the test; make it loud instead.
            tracing::error!(
                microvm_id = %self.id,
                log = %self.log.text().await,
                "microvm shut down after intercepting a signal"
            );
        }

        if !self.signalled {
            self.signalled = true;
            if self.jailer.daemonize {
                if let Some(pid) = self.jailer_clone_pid {
                    support::kill_pid(pid);
                }
            } else {
                // Killing screen HUPs the hypervisor, which must not be
                // mistaken for a crash on a later kill().
                self.expect_kill_by_signal = true;
                if let Some(pid) = self.screen_pid {
                    support::kill_pid(pid);
                }
            }

            if let Some(pid) = self.pid_in_new_ns() {
                support::kill_pid(pid);
            }
            tracing::info!(microvm_id = %self.id, "microvm killed");
        }

        if let Some(mut child) = self.child.take()
            && tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err()
        {
            tracing::warn!(microvm_id = %self.id, "launched process not reaped after kill");
        }
        let _ = self.console.join(MONITOR_JOIN_TIMEOUT).await;

        let mut result = Ok(());
        if let Some(mut monitor) = self.memory_monitor.take()
            && monitor.is_alive()
        {
            monitor.signal_stop();
            monitor.join(MONITOR_JOIN_TIMEOUT).await;
            if let Err(e) = monitor.check_samples() {
                tracing::error!(microvm_id = %self.id, error = %e, "memory monitor check failed");
                result = Err(e);
            }
        }
        if let Some(mut monitor) = self.cpu_load_monitor.take() {
            monitor.signal_stop();
            monitor.join(MONITOR_JOIN_TIMEOUT).await;
            if let Err(e) = monitor.check_samples() {
                tracing::error!(microvm_id = %self.id, error = %e, "cpu load monitor check failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for Microvm {
    fn drop(&mut self) {
        if !self.killed && self.jailer_clone_pid.is_some() {
            tracing::warn!(
                microvm_id = %self.id,
                pid = ?self.jailer_clone_pid,
                "microvm dropped without kill(); its processes are left running"
            );
        }
    }
}

fn jailed_name(jailed: &Path) -> String {
    jailed
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

//! Jail context of one microVM: where its chroot lives, how host resources are
//! mapped inside it, and which arguments the jailer binary is launched with.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tokio::process::Command;

use crate::support;

pub const DEFAULT_UID: u32 = 1234;
pub const DEFAULT_GID: u32 = 1234;
pub const DEFAULT_API_SOCKET_NAME: &str = "run/firecracker.socket";
pub const RAMFS_SUBDIR_NAME: &str = "ramfs";
const NETNS_DIR: &str = "/var/run/netns";

#[derive(Debug, Clone)]
pub struct JailerContext {
    pub jailer_id: String,
    pub exec_file: PathBuf,
    pub numa_node: Option<u32>,
    pub uid: u32,
    pub gid: u32,
    pub chroot_base: PathBuf,
    pub netns: Option<String>,
    pub daemonize: bool,
    pub new_pid_ns: bool,
    pub cgroup_version: Option<u8>,
    pub cgroups: Vec<String>,
    pub resource_limits: Vec<String>,
    pub parent_cgroup: Option<String>,
    /// Arguments forwarded to the jailed binary after `--`. A `None` value
    /// emits a bare `--key` flag.
    pub extra_args: Vec<(String, Option<String>)>,
    api_socket_name: String,
    ramfs_mounted: bool,
}

impl JailerContext {
    pub fn new(jailer_id: impl Into<String>, exec_file: impl Into<PathBuf>) -> Self {
        let jailer_id = jailer_id.into();
        Self {
            netns: Some(jailer_id.clone()),
            jailer_id,
            exec_file: exec_file.into(),
            numa_node: None,
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
            chroot_base: support::chroot_base(),
            daemonize: true,
            new_pid_ns: false,
            cgroup_version: None,
            cgroups: Vec::new(),
            resource_limits: Vec::new(),
            parent_cgroup: None,
            extra_args: Vec::new(),
            api_socket_name: DEFAULT_API_SOCKET_NAME.to_string(),
            ramfs_mounted: false,
        }
    }

    /// Insert or replace an extra argument, keeping first-insertion order.
    pub fn set_extra_arg(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        if key == "api-sock"
            && let Some(v) = &value
        {
            self.api_socket_name = v.trim_start_matches('/').to_string();
        }
        match self.extra_args.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.extra_args.push((key, value)),
        }
    }

    pub fn has_extra_arg(&self, key: &str) -> bool {
        self.extra_args.iter().any(|(k, _)| k == key)
    }

    pub fn construct_param_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        // Same order the jailer parses them in.
        out.extend(["--id".to_string(), self.jailer_id.clone()]);
        out.extend([
            "--exec-file".to_string(),
            self.exec_file.display().to_string(),
        ]);
        if let Some(node) = self.numa_node {
            out.extend(["--node".to_string(), node.to_string()]);
        }
        out.extend(["--uid".to_string(), self.uid.to_string()]);
        out.extend(["--gid".to_string(), self.gid.to_string()]);
        out.extend([
            "--chroot-base-dir".to_string(),
            self.chroot_base.display().to_string(),
        ]);
        if let Some(netns_file) = self.netns_file_path() {
            out.extend(["--netns".to_string(), netns_file.display().to_string()]);
        }
        if self.daemonize {
            out.push("--daemonize".to_string());
        }
        if self.new_pid_ns {
            out.push("--new-pid-ns".to_string());
        }
        if let Some(parent) = &self.parent_cgroup {
            out.extend(["--parent-cgroup".to_string(), parent.clone()]);
        }
        if let Some(ver) = self.cgroup_version {
            out.extend(["--cgroup-version".to_string(), ver.to_string()]);
        }
        for cg in &self.cgroups {
            out.extend(["--cgroup".to_string(), cg.clone()]);
        }
        for limit in &self.resource_limits {
            out.extend(["--resource-limit".to_string(), limit.clone()]);
        }
        if !self.extra_args.is_empty() {
            out.push("--".to_string());
            for (key, value) in &self.extra_args {
                out.push(format!("--{key}"));
                if let Some(v) = value {
                    out.push(v.clone());
                }
            }
        }
        out
    }

    fn exec_file_name(&self) -> String {
        self.exec_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firecracker".to_string())
    }

    pub fn chroot_base_with_id(&self) -> PathBuf {
        self.chroot_base
            .join(self.exec_file_name())
            .join(&self.jailer_id)
    }

    pub fn chroot_path(&self) -> PathBuf {
        self.chroot_base_with_id().join("root")
    }

    pub fn chroot_ramfs_path(&self) -> PathBuf {
        self.chroot_path().join(RAMFS_SUBDIR_NAME)
    }

    pub fn api_socket_path(&self) -> PathBuf {
        self.chroot_path().join(&self.api_socket_name)
    }

    pub fn netns_file_path(&self) -> Option<PathBuf> {
        self.netns.as_ref().map(|ns| Path::new(NETNS_DIR).join(ns))
    }

    /// Map `host_path` to its location inside the jail (`/<file name>`).
    ///
    /// With `create`, the file is hard-linked into the chroot (replacing any
    /// previous link) and handed to the jail's uid/gid.
    pub fn jailed_path(
        &self,
        host_path: &Path,
        create: bool,
        create_jail: bool,
    ) -> anyhow::Result<PathBuf> {
        let file_name = host_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", host_path.display()))?;
        let chroot = self.chroot_path();
        if create_jail {
            fs::create_dir_all(&chroot)
                .with_context(|| format!("create jail root {}", chroot.display()))?;
        }

        let global_path = chroot.join(file_name);
        if create {
            if fs::symlink_metadata(&global_path).is_ok() {
                fs::remove_file(&global_path)
                    .with_context(|| format!("replace {}", global_path.display()))?;
            }
            fs::hard_link(host_path, &global_path).with_context(|| {
                format!(
                    "link {} into jail as {}",
                    host_path.display(),
                    global_path.display()
                )
            })?;
            std::os::unix::fs::chown(&global_path, Some(self.uid), Some(self.gid))
                .with_context(|| format!("chown {}", global_path.display()))?;
        }

        Ok(Path::new("/").join(file_name))
    }

    /// Copy a host file into the chroot at the same absolute location.
    pub fn copy_into_root(&self, host_path: &Path, create_jail: bool) -> anyhow::Result<PathBuf> {
        let chroot = self.chroot_path();
        if create_jail {
            fs::create_dir_all(&chroot)
                .with_context(|| format!("create jail root {}", chroot.display()))?;
        }
        let rel = host_path.strip_prefix("/").unwrap_or(host_path);
        let dest = chroot.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(host_path, &dest)
            .with_context(|| format!("copy {} to {}", host_path.display(), dest.display()))?;
        Ok(dest)
    }

    /// Copy a file into the jail's ramfs and return its jailed path.
    pub fn copy_to_ramfs(&self, host_path: &Path) -> anyhow::Result<PathBuf> {
        let file_name = host_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", host_path.display()))?;
        let dest = self.chroot_ramfs_path().join(file_name);
        fs::copy(host_path, &dest)
            .with_context(|| format!("copy {} to {}", host_path.display(), dest.display()))?;
        std::os::unix::fs::chown(&dest, Some(self.uid), Some(self.gid))
            .with_context(|| format!("chown {}", dest.display()))?;
        Ok(Path::new("/").join(RAMFS_SUBDIR_NAME).join(file_name))
    }

    pub async fn setup(&mut self, create_netns: bool, use_ramdisk: bool) -> anyhow::Result<()> {
        let base = self.chroot_base_with_id();
        tokio::fs::create_dir_all(&base)
            .await
            .with_context(|| format!("create {}", base.display()))?;

        if use_ramdisk {
            let ramfs = self.chroot_ramfs_path();
            tokio::fs::create_dir_all(&ramfs)
                .await
                .with_context(|| format!("create {}", ramfs.display()))?;
            run_checked(
                Command::new("mount")
                    .args(["-t", "tmpfs", "-o", "size=1G", "tmpfs"])
                    .arg(&ramfs),
                "mount jail ramfs",
            )
            .await?;
            std::os::unix::fs::chown(&ramfs, Some(self.uid), Some(self.gid))
                .with_context(|| format!("chown {}", ramfs.display()))?;
            self.ramfs_mounted = true;
        }

        if create_netns && let Some(ns) = self.netns.clone() {
            let list = Command::new("ip")
                .args(["netns", "list"])
                .output()
                .await
                .context("run `ip netns list`")?;
            let existing = String::from_utf8_lossy(&list.stdout);
            if !netns_listed(&existing, &ns) {
                run_checked(Command::new("ip").args(["netns", "add", &ns]), "add netns").await?;
            }
        }

        Ok(())
    }

    /// Best-effort removal of everything `setup` and `jailed_path` created.
    pub async fn cleanup(&mut self) {
        if self.ramfs_mounted {
            let ramfs = self.chroot_ramfs_path();
            let _ = Command::new("umount").arg(&ramfs).status().await;
            self.ramfs_mounted = false;
        }

        let base = self.chroot_base_with_id();
        if let Err(e) = tokio::fs::remove_dir_all(&base).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %base.display(), error = %e, "failed to remove jail");
        }

        if let Some(ns) = &self.netns
            && self
                .netns_file_path()
                .is_some_and(|p| p.exists())
        {
            let _ = Command::new("ip").args(["netns", "del", ns]).status().await;
        }
    }
}

fn netns_listed(list_output: &str, ns: &str) -> bool {
    // Lines look like `name (id: 3)` or just `name`.
    list_output
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .any(|name| name == ns)
}

async fn run_checked(cmd: &mut Command, what: &str) -> anyhow::Result<()> {
    let out = cmd.output().await.with_context(|| format!("{what}: spawn"))?;
    if !out.status.success() {
        anyhow::bail!(
            "{what} failed ({}): {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use microvm_harness::{HarnessError, Microvm, MicrovmConfig, MicrovmId, SpawnOptions};

const JAILER_PRELUDE: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --id) id="$2"; shift 2 ;;
    --exec-file) exec_file="$2"; shift 2 ;;
    --chroot-base-dir) base="$2"; shift 2 ;;
    --) shift; break ;;
    *) shift ;;
  esac
done
chroot="$base/$(basename "$exec_file")/$id/root"
mkdir -p "$chroot/run"
"#;

/// A jailer stand-in: parses the jailer arguments it needs, then runs `body`.
fn write_jailer(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("jailer");
    std::fs::write(&path, format!("{JAILER_PRELUDE}{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn microvm(dir: &Path, jailer: &Path, id: &str) -> Microvm {
    let mut cfg = MicrovmConfig::new(dir.join("resources"), "/bin/sh", jailer);
    cfg.id = MicrovmId(id.to_string());
    cfg.monitor_memory = false;
    let mut vm = Microvm::new(cfg).unwrap();
    let j = vm.jailer_mut();
    j.chroot_base = dir.join("jail");
    j.uid = unsafe { libc::getuid() };
    j.gid = unsafe { libc::getgid() };
    j.netns = None;
    vm
}

/// Alive and not a zombie waiting for whoever it was reparented to.
fn running(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .unwrap_or("X");
    !matches!(state, "Z" | "X")
}

fn no_netns() -> SpawnOptions {
    SpawnOptions {
        create_netns: false,
        ..SpawnOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_waits_for_socket_and_ready_marker_then_kill_is_idempotent() {
    let _log = microvm_harness::logging::init();
    let dir = tempfile::tempdir().unwrap();
    let jailer = write_jailer(
        dir.path(),
        r#"echo "Running Firecracker v0.0.0-test" > "$chroot/log_fifo"
touch "$chroot/run/firecracker.socket"
exec sleep 30"#,
    );
    let mut vm = microvm(dir.path(), &jailer, "lifecycle1");

    vm.setup().await.unwrap();
    vm.spawn(no_netns()).await.unwrap();

    assert!(vm.log_data().await.contains(microvm_harness::READY_MARKER));
    assert!(vm.jailer().api_socket_path().exists());
    assert!(vm.chroot().join("log_fifo").exists());
    assert!(vm.process_alive());

    vm.kill().await.unwrap();
    assert!(!vm.process_alive());
    vm.kill().await.unwrap();
    assert!(!vm.process_alive());

    let chroot = vm.chroot();
    vm.jailer_mut().cleanup().await;
    assert!(!chroot.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_fails_when_api_socket_never_appears() {
    let dir = tempfile::tempdir().unwrap();
    let jailer = write_jailer(dir.path(), "exec sleep 30");
    let mut vm = microvm(dir.path(), &jailer, "lifecycle2");
    vm.setup().await.unwrap();

    let err = vm
        .spawn(SpawnOptions {
            create_logger: false,
            ..no_netns()
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::ReadinessTimeout { .. })
    ));

    vm.kill().await.unwrap();
    assert!(!vm.process_alive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_targets_the_pid_namespace_child_too() {
    let dir = tempfile::tempdir().unwrap();
    // The "namespaced" process is a grandchild whose pid lands in the pid file.
    let jailer = write_jailer(
        dir.path(),
        r#"sleep 30 &
echo $! > "$chroot/firecracker.pid"
exec sleep 30"#,
    );
    let mut vm = microvm(dir.path(), &jailer, "lifecycle3");
    vm.jailer_mut().set_extra_arg("no-api", None);
    vm.setup().await.unwrap();
    vm.spawn(SpawnOptions {
        create_logger: false,
        ..no_netns()
    })
    .await
    .unwrap();

    let mut ns_pid = None;
    for _ in 0..50 {
        ns_pid = vm.pid_in_new_ns();
        if ns_pid.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let ns_pid = ns_pid.unwrap();
    assert_ne!(Some(ns_pid), vm.jailer_clone_pid());

    vm.kill().await.unwrap();

    // The grandchild is reparented away from us; wait for it to disappear.
    let mut gone = false;
    for _ in 0..100 {
        if !running(ns_pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(gone, "namespaced pid {ns_pid} still alive");
}

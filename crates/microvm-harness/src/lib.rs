//! Host-side harness for integration tests that run the hypervisor inside
//! jailed microVMs.

pub mod affinity;
pub mod api;
pub mod console;
mod error;
pub mod jailer;
pub mod launcher;
pub mod logging;
pub mod microvm;
pub mod monitors;
pub mod pidfile;
mod procfs;
pub mod serial;
pub mod support;

pub use error::HarnessError;
pub use microvm::{
    BasicConfig, CRASH_MARKER, DriveSpec, Microvm, MicrovmConfig, NetworkSpec, READY_MARKER,
    RestoreSnapshot, SpawnOptions, SshConfig,
};
pub use microvm_process::{InstanceInfo, InstanceState, MicrovmId, StartState};
pub use serial::SerialConsole;

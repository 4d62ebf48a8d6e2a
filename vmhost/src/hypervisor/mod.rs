//! Hypervisor seam.
//!
//! The lifecycle controller drives the host hypervisor exclusively through
//! these traits. Long-running operations take a [`Completion`] slot and may
//! resolve it later from any thread; spontaneous guest activity (shutdown,
//! runtime error) arrives over an explicit event channel rather than
//! open-ended delegate dispatch.
//!
//! Two backends ship with the crate: [`qemu`] drives a `qemu-system-*` child
//! process, [`sim`] is a deterministic in-process backend used by the test
//! suite and for dry runs.

pub mod qemu;
pub mod sim;

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::bundle::identity::{HardwareModel, VmIdentity};
use crate::error::VmhostResult;
use crate::exec::Completion;

/// What a hypervisor backend learns from inspecting a restore source.
///
/// The hardware model is the source's most-capable supported configuration;
/// the minimums bound the settings a new bundle may be created with.
#[derive(Debug, Clone)]
pub struct RestoreSourceInfo {
    pub hardware_model: HardwareModel,
    pub min_cpu_count: u32,
    pub min_ram_bytes: u64,
}

/// Fully-assembled instance configuration handed to the backend.
///
/// Built deterministically from a bundle's identity and configuration, so a
/// reloaded bundle always produces the same device set.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub identity: VmIdentity,
    pub cpu_count: u32,
    pub ram_bytes: u64,
    pub disk_image: PathBuf,
    pub auxiliary_storage: PathBuf,
    pub keyboard: bool,
    pub pointer: bool,
    pub display: bool,
}

/// Spontaneous notifications from the running guest.
#[derive(Debug, Clone)]
pub enum GuestEvent {
    /// The guest shut itself down (or the install sequence powered it off).
    Stopped,
    /// The guest hit a runtime failure and is no longer running.
    Errored(String),
}

pub type EventSender = mpsc::UnboundedSender<GuestEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GuestEvent>;

/// Install progress callback; called with a fraction in `0.0..=1.0`.
pub type ProgressFn = Box<dyn Fn(f64) + Send + 'static>;

/// A hypervisor backend: validates configurations and creates instances.
pub trait Hypervisor: Send + Sync + 'static {
    type Instance: Instance;

    /// Inspect a restore source and report its most-capable supported
    /// configuration. Fails with `InstallFailed` when the source is not
    /// loadable.
    fn inspect_restore_source(&self, path: &Path) -> VmhostResult<RestoreSourceInfo>;

    /// Validate an assembled spec without creating anything. Fails with
    /// `ConfigInvalid` for unsupported hardware models or an impossible
    /// device combination.
    fn validate(&self, spec: &InstanceSpec) -> VmhostResult<()>;

    /// Create the instance handle. Guest events are delivered over `events`
    /// on the backend's own schedule until the instance is dropped.
    fn create_instance(&self, spec: &InstanceSpec, events: EventSender)
    -> VmhostResult<Self::Instance>;
}

/// A bound virtual machine handle.
///
/// Exclusively owned by the controller's serialized executor; no two calls
/// ever run concurrently. Completions may be resolved after the call
/// returns, from any backend thread.
pub trait Instance: Send + 'static {
    /// Start the guest. Resolves `Ok(true)` once running, `Ok(false)` when
    /// the handle cannot be started (already running, wrong state) without
    /// that being an error.
    fn start(&mut self, done: Completion<bool>);

    /// Ask the guest to shut down gracefully. Returns whether the request
    /// was accepted; acceptance does not mean the guest has stopped.
    fn request_stop(&mut self) -> VmhostResult<bool>;

    /// Stop the machine at the host level, unconditionally. Safe to call on
    /// an already-stopping or already-stopped guest.
    fn force_stop(&mut self, done: Completion<()>);

    /// Install the guest OS from `source` onto the bound disk resource.
    /// Reports fractional progress along the way; when the install finishes
    /// the backend powers the guest off and emits [`GuestEvent::Stopped`].
    fn install(&mut self, source: &Path, progress: ProgressFn, done: Completion<()>);
}

const PROVISION_CHUNK: usize = 256 << 10;

/// Write a restore image over the head of a disk resource, preserving the
/// disk's allocated length and reporting fractional progress per chunk.
pub(crate) fn provision_disk(
    source: &Path,
    disk: &Path,
    progress: &ProgressFn,
) -> VmhostResult<()> {
    use std::io::{Read as _, Seek as _, SeekFrom, Write as _};

    use crate::error::VmhostError;

    let mut src = std::fs::File::open(source)
        .map_err(|e| VmhostError::InstallFailed(format!("{}: {e}", source.display())))?;
    let total = src
        .metadata()
        .map_err(|e| VmhostError::InstallFailed(format!("{}: {e}", source.display())))?
        .len();
    let disk_len = std::fs::metadata(disk)?.len();
    if total > disk_len {
        return Err(VmhostError::InstallFailed(format!(
            "restore source is {total} bytes but the disk resource holds only {disk_len}"
        )));
    }

    let mut dst = std::fs::OpenOptions::new().write(true).open(disk)?;
    dst.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; PROVISION_CHUNK];
    let mut copied: u64 = 0;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        copied += n as u64;
        progress(copied as f64 / total as f64);
    }
    dst.flush()?;
    Ok(())
}

//! Deterministic in-process hypervisor backend.
//!
//! Faithful to the backend contract — asynchronous completions, guest events
//! delivered from backend threads, the same validation rules — but with no
//! external processes, so lifecycle behavior can be exercised quickly and
//! repeatably. Used by the test suite and selectable as `--engine sim` for
//! dry runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{VmhostError, VmhostResult};
use crate::exec::Completion;
use crate::hypervisor::{
    EventSender, GuestEvent, Hypervisor, Instance, InstanceSpec, ProgressFn, RestoreSourceInfo,
    provision_disk,
};

/// Hardware model descriptor reported for every sim restore source.
const SIM_HARDWARE_MODEL: &[u8] = b"vmhost-sim/1";

const MIN_RAM_BYTES: u64 = 64 << 20;

/// Behavior knobs, mostly for tests.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Whether a graceful stop request actually stops the guest. When false
    /// the request is accepted and ignored, leaving only the forceful path.
    pub honor_graceful_stop: bool,
    /// How long the guest takes to act on an accepted stop request.
    pub graceful_stop_latency: Duration,
    /// Report the handle as unstartable.
    pub refuse_start: bool,
    /// Fail the install with this message instead of completing it.
    pub install_error: Option<String>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            honor_graceful_stop: true,
            graceful_stop_latency: Duration::from_millis(5),
            refuse_start: false,
            install_error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimHypervisor {
    options: SimOptions,
    instances_created: AtomicUsize,
}

impl SimHypervisor {
    pub fn new(options: SimOptions) -> Self {
        Self {
            options,
            instances_created: AtomicUsize::new(0),
        }
    }

    /// How many instances this backend has created. Lets tests assert that a
    /// failed load never got as far as creating a VM handle.
    pub fn instances_created(&self) -> usize {
        self.instances_created.load(Ordering::SeqCst)
    }
}

impl Hypervisor for SimHypervisor {
    type Instance = SimInstance;

    fn inspect_restore_source(&self, path: &Path) -> VmhostResult<RestoreSourceInfo> {
        let meta = fs::metadata(path).map_err(|e| {
            VmhostError::InstallFailed(format!("restore source {}: {e}", path.display()))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(VmhostError::InstallFailed(format!(
                "restore source {} is not a loadable image",
                path.display()
            )));
        }
        Ok(RestoreSourceInfo {
            hardware_model: crate::bundle::identity::HardwareModel::new(
                SIM_HARDWARE_MODEL.to_vec(),
            ),
            min_cpu_count: 1,
            min_ram_bytes: MIN_RAM_BYTES,
        })
    }

    fn validate(&self, spec: &InstanceSpec) -> VmhostResult<()> {
        if spec.cpu_count == 0 {
            return Err(VmhostError::ConfigInvalid("cpu_count must be at least 1".into()));
        }
        if spec.ram_bytes < MIN_RAM_BYTES {
            return Err(VmhostError::ConfigInvalid(format!(
                "ram_bytes {} is below the supported minimum {MIN_RAM_BYTES}",
                spec.ram_bytes
            )));
        }
        if spec.identity.hardware_model.as_bytes() != SIM_HARDWARE_MODEL {
            return Err(VmhostError::ConfigInvalid(
                "unsupported hardware model for this backend".into(),
            ));
        }
        Ok(())
    }

    fn create_instance(
        &self,
        spec: &InstanceSpec,
        events: EventSender,
    ) -> VmhostResult<SimInstance> {
        if !spec.disk_image.exists() {
            return Err(VmhostError::ConfigInvalid(format!(
                "disk image {} does not exist",
                spec.disk_image.display()
            )));
        }
        if !spec.auxiliary_storage.exists() {
            return Err(VmhostError::ConfigInvalid(format!(
                "auxiliary storage {} does not exist",
                spec.auxiliary_storage.display()
            )));
        }
        self.instances_created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(disk = %spec.disk_image.display(), "sim instance created");
        Ok(SimInstance {
            options: self.options.clone(),
            disk_image: spec.disk_image.clone(),
            events,
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

pub struct SimInstance {
    options: SimOptions,
    disk_image: PathBuf,
    events: EventSender,
    running: Arc<AtomicBool>,
}

impl Instance for SimInstance {
    fn start(&mut self, done: Completion<bool>) {
        if self.options.refuse_start || self.running.load(Ordering::SeqCst) {
            done.ok(false);
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        done.ok(true);
    }

    fn request_stop(&mut self) -> VmhostResult<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.options.honor_graceful_stop {
            let running = Arc::clone(&self.running);
            let events = self.events.clone();
            let latency = self.options.graceful_stop_latency;
            thread::spawn(move || {
                thread::sleep(latency);
                if running.swap(false, Ordering::SeqCst) {
                    let _ = events.send(GuestEvent::Stopped);
                }
            });
        }
        // accepted either way; a guest that ignores it leaves only the
        // forceful path
        Ok(true)
    }

    fn force_stop(&mut self, done: Completion<()>) {
        self.running.store(false, Ordering::SeqCst);
        done.ok(());
    }

    fn install(&mut self, source: &Path, progress: ProgressFn, done: Completion<()>) {
        let source = source.to_path_buf();
        let disk_image = self.disk_image.clone();
        let events = self.events.clone();
        let failure = self.options.install_error.clone();

        thread::spawn(move || {
            if let Some(message) = failure {
                done.err(VmhostError::InstallFailed(message));
                return;
            }
            match provision_disk(&source, &disk_image, &progress) {
                Ok(()) => {
                    done.ok(());
                    // installation leaves the guest powered off
                    let _ = events.send(GuestEvent::Stopped);
                }
                Err(e) => done.err(e),
            }
        });
    }
}

//! Virtual machine lifecycle controller.
//!
//! One controller owns exactly one hypervisor instance handle, one
//! serialized executor, and one terminal-stop gate, and is bound to exactly
//! one bundle for its entire life. All hypervisor-mutating work funnels
//! through the executor, so operations are totally ordered without any
//! caller-side locking.
//!
//! Termination is single-shot by construction: guest-initiated shutdown,
//! guest errors, and the forceful stop path all race to resolve the same
//! [`OnceGate`]; the first wins, the rest are benign no-ops, and every
//! `wait_for_stop` caller observes the winning reason.

mod state;

pub use state::VmState;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::bundle::identity::VmIdentity;
use crate::bundle::{self, Bundle, CreationSettings, VmConfig};
use crate::error::{VmhostError, VmhostResult};
use crate::exec::{Completion, OnceGate, SerialExecutor};
use crate::hypervisor::{GuestEvent, Hypervisor, Instance, InstanceSpec, ProgressFn};

/// Why the terminal-stop gate resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The guest shut down on its own (or a graceful request succeeded).
    GuestStopped,
    /// The host-level forceful stop concluded the run.
    Forced,
    /// The guest reported a runtime failure.
    GuestError(String),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// How long a graceful shutdown request gets before the unconditional
    /// forceful stop is issued.
    pub stop_grace: Duration,
    /// Attach a display surface to the instance.
    pub display: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(15),
            display: false,
        }
    }
}

/// What binding produced: the bundle handle plus the identity and
/// configuration the instance was built from.
struct BoundVm {
    bundle: Bundle,
    identity: VmIdentity,
    config: VmConfig,
}

struct ControllerInner<H: Hypervisor> {
    hypervisor: Arc<H>,
    options: ControllerOptions,
    state: Mutex<VmState>,
    bound: Mutex<Option<BoundVm>>,
    executor: SerialExecutor<Option<H::Instance>>,
    stop_gate: OnceGate<StopReason>,
    restored: AtomicBool,
}

/// Handle to one VM's lifecycle. Cheaply cloneable; clones share the same
/// underlying controller, which is how the interrupt handler gets access
/// without any global state.
pub struct VmController<H: Hypervisor> {
    inner: Arc<ControllerInner<H>>,
}

impl<H: Hypervisor> Clone for VmController<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Hypervisor> VmController<H> {
    pub fn new(hypervisor: H, options: ControllerOptions) -> VmhostResult<Self> {
        let executor = SerialExecutor::new("vmhost-vm-queue", None::<H::Instance>)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                hypervisor: Arc::new(hypervisor),
                options,
                state: Mutex::new(VmState::Unbound),
                bound: Mutex::new(None),
                executor,
                stop_gate: OnceGate::new(),
                restored: AtomicBool::new(false),
            }),
        })
    }

    pub fn state(&self) -> VmState {
        *self.inner.state.lock()
    }

    pub fn hypervisor(&self) -> &H {
        &self.inner.hypervisor
    }

    /// Identity of the bound VM, if bound.
    pub fn identity(&self) -> Option<VmIdentity> {
        self.inner.bound.lock().as_ref().map(|b| b.identity.clone())
    }

    /// Create a new bundle at `bundle_path`, derive a fresh identity from
    /// `restore_source`, and bind the resulting instance.
    ///
    /// The assembled configuration is validated before anything touches the
    /// filesystem; validation failure leaves no partial bundle behind.
    pub fn create_and_bind(
        &self,
        bundle_path: &Path,
        restore_source: &Path,
        settings: &CreationSettings,
    ) -> VmhostResult<()> {
        // the bound lock serializes bind attempts end-to-end
        let mut bound = self.inner.bound.lock();
        self.check_unbound("create_and_bind")?;

        let result = (|| {
            let source = self.inner.hypervisor.inspect_restore_source(restore_source)?;
            if settings.cpu_count < source.min_cpu_count {
                return Err(VmhostError::ConfigInvalid(format!(
                    "cpu_count {} is below the restore source minimum {}",
                    settings.cpu_count, source.min_cpu_count
                )));
            }
            if settings.ram_bytes < source.min_ram_bytes {
                return Err(VmhostError::ConfigInvalid(format!(
                    "ram_bytes {} is below the restore source minimum {}",
                    settings.ram_bytes, source.min_ram_bytes
                )));
            }

            let identity = VmIdentity::generate(source.hardware_model);
            let spec = self.build_spec(bundle_path, &identity, settings.config());
            self.inner.hypervisor.validate(&spec)?;

            let handle = Bundle::create(bundle_path, &identity, settings)?;
            self.bind_instance(spec)?;
            Ok(BoundVm {
                bundle: handle,
                identity,
                config: settings.config(),
            })
        })();

        match result {
            Ok(vm) => {
                *bound = Some(vm);
                *self.inner.state.lock() = VmState::Bound;
                tracing::info!(bundle = %bundle_path.display(), "created and bound");
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = VmState::Failed;
                Err(e)
            }
        }
    }

    /// Load the bundle at `bundle_path` and bind an instance rebuilt
    /// deterministically from the stored identity and configuration.
    pub fn load_and_bind(&self, bundle_path: &Path) -> VmhostResult<()> {
        let mut bound = self.inner.bound.lock();
        self.check_unbound("load_and_bind")?;

        let result = (|| {
            let (handle, identity, config) = Bundle::load(bundle_path)?;
            let spec = self.build_spec(bundle_path, &identity, config);
            self.inner.hypervisor.validate(&spec)?;
            self.bind_instance(spec)?;
            Ok(BoundVm {
                bundle: handle,
                identity,
                config,
            })
        })();

        match result {
            Ok(vm) => {
                *bound = Some(vm);
                *self.inner.state.lock() = VmState::Bound;
                tracing::info!(bundle = %bundle_path.display(), "loaded and bound");
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = VmState::Failed;
                Err(e)
            }
        }
    }

    /// Persist the bound VM's descriptor again. Idempotent.
    pub fn save(&self) -> VmhostResult<()> {
        let bound = self.inner.bound.lock();
        let vm = bound
            .as_ref()
            .ok_or_else(|| VmhostError::StateViolation("save requires a bound VM".into()))?;
        vm.bundle.save(&vm.identity, &vm.config)
    }

    /// Install the guest OS from `restore_source` onto the bound disk.
    ///
    /// Long-running; blocks until the hypervisor reports completion or
    /// failure, logging fractional progress along the way. A controller
    /// performs at most one successful restore; later attempts are
    /// rejected rather than silently reinstalling over a live disk.
    pub fn restore(&self, restore_source: &Path) -> VmhostResult<()> {
        {
            let state = self.inner.state.lock();
            if *state != VmState::Bound {
                return Err(VmhostError::StateViolation(format!(
                    "restore requires a bound, stopped VM (state: {:?})",
                    *state
                )));
            }
        }
        if self.inner.restored.swap(true, Ordering::SeqCst) {
            return Err(VmhostError::StateViolation(
                "this VM has already been restored".into(),
            ));
        }

        tracing::info!(source = %restore_source.display(), "installing guest OS");
        let source = restore_source.to_path_buf();
        let progress = progress_logger();
        let result = self.inner.executor.blocking_call(move |slot, done| {
            match slot.as_mut() {
                Some(instance) => instance.install(&source, progress, done),
                None => done.err(VmhostError::Internal("no instance bound".into())),
            }
        });

        match result {
            Ok(()) => {
                tracing::info!("guest OS install complete");
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = VmState::Failed;
                Err(match e {
                    VmhostError::InstallFailed(_) => e,
                    other => VmhostError::InstallFailed(other.to_string()),
                })
            }
        }
    }

    /// Start the guest.
    ///
    /// When the hypervisor reports the handle cannot be started this is a
    /// logged no-op, not an error.
    pub fn start(&self) -> VmhostResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != VmState::Bound {
                return Err(VmhostError::StateViolation(format!(
                    "start requires a bound, stopped VM (state: {:?})",
                    *state
                )));
            }
            *state = VmState::Starting;
        }

        let result = self.inner.executor.blocking_call(|slot, done| {
            match slot.as_mut() {
                Some(instance) => instance.start(done),
                None => done.err(VmhostError::Internal("no instance bound".into())),
            }
        });

        match result {
            Ok(true) => {
                *self.inner.state.lock() = VmState::Running;
                tracing::info!("guest started");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!("hypervisor reports the VM cannot be started, ignoring");
                *self.inner.state.lock() = VmState::Bound;
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = VmState::Failed;
                Err(e)
            }
        }
    }

    /// Begin stopping the guest: request a graceful shutdown now, issue an
    /// unconditional forceful stop once the grace period elapses.
    ///
    /// Idempotent while a stop is outstanding. Returns immediately; use
    /// [`wait_for_stop`](Self::wait_for_stop) to observe conclusion.
    /// Whichever path concludes first resolves the terminal-stop gate; the
    /// other is a benign late no-op.
    pub fn stop(&self) -> VmhostResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                VmState::Running => *state = VmState::StopRequested,
                VmState::StopRequested => {
                    tracing::debug!("stop already in flight");
                    return Ok(());
                }
                other => {
                    return Err(VmhostError::StateViolation(format!(
                        "stop requires a running VM (state: {other:?})"
                    )));
                }
            }
        }

        tracing::info!("requesting graceful guest shutdown");
        self.inner.executor.submit(|slot| {
            if let Some(instance) = slot.as_mut() {
                match instance.request_stop() {
                    Ok(true) => tracing::debug!("shutdown request accepted"),
                    Ok(false) => tracing::warn!("shutdown request not accepted"),
                    Err(e) => tracing::warn!(error = %e, "shutdown request failed"),
                }
            }
        });

        self.spawn_stop_escalation();
        Ok(())
    }

    /// Block until the VM reaches a stopped or failed state. Callable any
    /// number of times, from any thread; always returns once the terminal
    /// gate has resolved.
    pub fn wait_for_stop(&self) -> StopReason {
        self.inner.stop_gate.wait()
    }

    fn check_unbound(&self, operation: &str) -> VmhostResult<()> {
        let state = *self.inner.state.lock();
        if state != VmState::Unbound {
            return Err(VmhostError::StateViolation(format!(
                "{operation} requires an unbound controller (state: {state:?})"
            )));
        }
        Ok(())
    }

    fn build_spec(&self, bundle_root: &Path, identity: &VmIdentity, config: VmConfig) -> InstanceSpec {
        InstanceSpec {
            identity: identity.clone(),
            cpu_count: config.cpu_count,
            ram_bytes: config.ram_bytes,
            disk_image: bundle_root.join(bundle::DISK_IMAGE_NAME),
            auxiliary_storage: bundle_root.join(bundle::NVRAM_IMAGE_NAME),
            keyboard: true,
            pointer: true,
            display: self.inner.options.display,
        }
    }

    /// Create the instance on the executor worker and spawn the guest-event
    /// pump that turns backend notifications into state transitions and
    /// gate resolutions.
    fn bind_instance(&self, spec: InstanceSpec) -> VmhostResult<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let hypervisor = Arc::clone(&self.inner.hypervisor);
        self.inner.executor.blocking_call(move |slot, done| {
            match hypervisor.create_instance(&spec, events_tx) {
                Ok(instance) => {
                    *slot = Some(instance);
                    done.ok(());
                }
                Err(e) => done.err(e),
            }
        })?;

        // Weak, so a finished pump is the only thing keeping nothing alive:
        // the channel closes when the instance (and its sender) drops.
        let weak = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("vmhost-guest-events".into())
            .spawn(move || {
                while let Some(event) = events_rx.blocking_recv() {
                    let Some(inner) = weak.upgrade() else { return };
                    match event {
                        GuestEvent::Stopped => inner.note_guest_stopped(),
                        GuestEvent::Errored(message) => inner.note_guest_error(message),
                    }
                }
            })
            .map_err(|e| VmhostError::Internal(format!("failed to spawn event pump: {e}")))?;
        Ok(())
    }

    fn spawn_stop_escalation(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("vmhost-stop-escalation".into())
            .spawn(move || {
                thread::sleep(inner.options.stop_grace);
                if inner.stop_gate.is_resolved() {
                    return;
                }
                tracing::info!(
                    grace_ms = inner.options.stop_grace.as_millis() as u64,
                    "grace period elapsed, forcing stop"
                );

                let (tx, rx) = oneshot::channel();
                let gate = Arc::clone(&inner);
                inner.executor.submit(move |slot| {
                    // graceful path may have concluded while we queued;
                    // dropping the sender unblocks the receiver below
                    if gate.stop_gate.is_resolved() {
                        return;
                    }
                    match slot.as_mut() {
                        Some(instance) => instance.force_stop(Completion::new(tx)),
                        None => drop(tx),
                    }
                });

                match rx.blocking_recv() {
                    Ok(Ok(())) => {
                        if inner.stop_gate.resolve(StopReason::Forced) {
                            *inner.state.lock() = VmState::Stopped;
                            tracing::info!("guest stopped (forced)");
                        }
                    }
                    Ok(Err(e)) => {
                        if inner.stop_gate.resolve(StopReason::GuestError(e.to_string())) {
                            *inner.state.lock() = VmState::Failed;
                            tracing::error!(error = %e, "forceful stop failed");
                        }
                    }
                    Err(_) => {} // force skipped, graceful path already won
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn stop escalation thread");
        }
    }
}

impl<H: Hypervisor> ControllerInner<H> {
    fn note_guest_stopped(&self) {
        if self.stop_gate.resolve(StopReason::GuestStopped) {
            let mut state = self.state.lock();
            // an install-completion power-off arrives while merely Bound;
            // the bundle stays loadable, so that is not a terminal stop
            if state.is_active() {
                *state = VmState::Stopped;
            }
            tracing::info!("guest stopped");
        } else {
            tracing::debug!("late guest-stop notification, already concluded");
        }
    }

    fn note_guest_error(&self, message: String) {
        if self
            .stop_gate
            .resolve(StopReason::GuestError(message.clone()))
        {
            *self.state.lock() = VmState::Failed;
            tracing::error!(error = %message, "guest reported an error");
        } else {
            tracing::debug!(error = %message, "late guest-error notification, already concluded");
        }
    }
}

/// Progress callback that logs once per ten-percent step.
fn progress_logger() -> ProgressFn {
    let last_step = AtomicU64::new(u64::MAX);
    Box::new(move |fraction| {
        let step = (fraction.clamp(0.0, 1.0) * 10.0) as u64;
        if last_step.swap(step, Ordering::Relaxed) != step {
            tracing::info!("install progress: {:.0}%", fraction * 100.0);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::hypervisor::sim::{SimHypervisor, SimOptions};

    fn settings() -> CreationSettings {
        CreationSettings {
            cpu_count: 2,
            ram_bytes: 512 << 20,
            disk_bytes: 1 << 20,
        }
    }

    fn controller(options: SimOptions) -> VmController<SimHypervisor> {
        let controller_options = ControllerOptions {
            stop_grace: Duration::from_millis(50),
            display: false,
        };
        VmController::new(SimHypervisor::new(options), controller_options).unwrap()
    }

    fn restore_source(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("restore.img");
        fs::write(&path, vec![0xabu8; 4096]).unwrap();
        path
    }

    #[test]
    fn operations_require_their_states() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions::default());

        assert!(matches!(c.start(), Err(VmhostError::StateViolation(_))));
        assert!(matches!(c.stop(), Err(VmhostError::StateViolation(_))));
        assert!(matches!(
            c.restore(&dir.path().join("x")),
            Err(VmhostError::StateViolation(_))
        ));
    }

    #[test]
    fn create_transitions_to_bound() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions::default());
        let source = restore_source(dir.path());

        c.create_and_bind(&dir.path().join("vm.bundle"), &source, &settings())
            .unwrap();
        assert_eq!(c.state(), VmState::Bound);
        assert_eq!(c.hypervisor().instances_created(), 1);
    }

    #[test]
    fn create_with_too_little_ram_is_config_invalid() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions::default());
        let source = restore_source(dir.path());

        let result = c.create_and_bind(
            &dir.path().join("vm.bundle"),
            &source,
            &CreationSettings {
                cpu_count: 2,
                ram_bytes: 1 << 20,
                disk_bytes: 1 << 20,
            },
        );
        assert!(matches!(result, Err(VmhostError::ConfigInvalid(_))));
        assert_eq!(c.state(), VmState::Failed);
        // validation failed before any filesystem work
        assert!(!dir.path().join("vm.bundle").exists());
        assert_eq!(c.hypervisor().instances_created(), 0);
    }

    #[test]
    fn load_missing_bundle_creates_no_instance() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions::default());

        let result = c.load_and_bind(&dir.path().join("nope.bundle"));
        assert!(matches!(result, Err(VmhostError::NotFound(_))));
        assert_eq!(c.state(), VmState::Failed);
        assert_eq!(c.hypervisor().instances_created(), 0);
    }

    #[test]
    fn binding_twice_is_a_state_violation() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions::default());
        let source = restore_source(dir.path());
        let bundle = dir.path().join("vm.bundle");

        c.create_and_bind(&bundle, &source, &settings()).unwrap();
        assert!(matches!(
            c.load_and_bind(&bundle),
            Err(VmhostError::StateViolation(_))
        ));
    }

    #[test]
    fn second_restore_is_rejected() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions::default());
        let source = restore_source(dir.path());

        c.create_and_bind(&dir.path().join("vm.bundle"), &source, &settings())
            .unwrap();
        c.restore(&source).unwrap();
        assert_eq!(c.state(), VmState::Bound);

        // deliberate guard: reinstalling over an installed disk is refused
        assert!(matches!(
            c.restore(&source),
            Err(VmhostError::StateViolation(_))
        ));
    }

    #[test]
    fn refused_start_is_a_warning_not_an_error() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions {
            refuse_start: true,
            ..SimOptions::default()
        });
        let source = restore_source(dir.path());

        c.create_and_bind(&dir.path().join("vm.bundle"), &source, &settings())
            .unwrap();
        c.start().unwrap();
        assert_eq!(c.state(), VmState::Bound);
    }

    #[test]
    fn failed_install_is_install_failed_and_terminal() {
        let dir = tempdir().unwrap();
        let c = controller(SimOptions {
            install_error: Some("media unreadable".into()),
            ..SimOptions::default()
        });
        let source = restore_source(dir.path());

        c.create_and_bind(&dir.path().join("vm.bundle"), &source, &settings())
            .unwrap();
        let result = c.restore(&source);
        assert!(matches!(result, Err(VmhostError::InstallFailed(_))));
        assert_eq!(c.state(), VmState::Failed);
    }
}

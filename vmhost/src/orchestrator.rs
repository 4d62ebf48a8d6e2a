//! Run-mode orchestration.
//!
//! One process executes exactly one run mode: a fixed sequence of controller
//! calls chosen at startup. The orchestrator owns the sole controller and
//! shares it with the interrupt handler through an ordinary clone; there is
//! no process-global state.

use std::path::{Path, PathBuf};

use crate::bundle::CreationSettings;
use crate::controller::{StopReason, VmController};
use crate::error::{VmhostError, VmhostResult};
use crate::hypervisor::Hypervisor;

/// The four lifecycle sequences this tool can execute.
pub enum RunMode {
    /// Create a bundle, install the guest OS, wait for the installer to
    /// power the guest off.
    CreateAndRestore {
        restore_source: PathBuf,
        settings: CreationSettings,
    },
    /// Reinstall the guest OS into an existing bundle.
    RestoreOnly { restore_source: PathBuf },
    /// Boot an existing bundle headless and wait for it to stop.
    Run,
    /// Boot with a display surface; closing it stops the guest, which is
    /// observed the same way as any other guest-initiated stop.
    RunWithDisplay,
}

/// Execute one run mode to completion.
///
/// Every error is fatal at this scope: it propagates to `main`, which
/// reports it and exits nonzero. There are no retries.
pub fn run<H: Hypervisor>(
    controller: VmController<H>,
    bundle_path: &Path,
    mode: RunMode,
) -> VmhostResult<()> {
    install_interrupt_handler(controller.clone());

    match mode {
        RunMode::CreateAndRestore {
            restore_source,
            settings,
        } => {
            controller.create_and_bind(bundle_path, &restore_source, &settings)?;
            controller.restore(&restore_source)?;
            conclude(controller.wait_for_stop())
        }
        RunMode::RestoreOnly { restore_source } => {
            controller.load_and_bind(bundle_path)?;
            controller.restore(&restore_source)?;
            conclude(controller.wait_for_stop())
        }
        RunMode::Run | RunMode::RunWithDisplay => {
            controller.load_and_bind(bundle_path)?;
            controller.start()?;
            conclude(controller.wait_for_stop())
        }
    }
}

fn conclude(reason: StopReason) -> VmhostResult<()> {
    match reason {
        StopReason::GuestStopped | StopReason::Forced => Ok(()),
        StopReason::GuestError(message) => Err(VmhostError::GuestError(message)),
    }
}

/// Route SIGINT/SIGTERM into the graceful-stop sequence, at most once.
/// Repeated signals while the stop is in flight are ignored; the blocked
/// `wait_for_stop` in the run sequence observes the conclusion and exits.
fn install_interrupt_handler<H: Hypervisor>(controller: VmController<H>) {
    let mut fired = false;
    let result = ctrlc::set_handler(move || {
        if std::mem::replace(&mut fired, true) {
            tracing::debug!("interrupt already handled, ignoring");
            return;
        }
        tracing::info!("interrupt received, stopping guest");
        if let Err(e) = controller.stop() {
            // a stop can be impossible (nothing running yet); in-flight
            // operations are not cancellable, so the sequence runs on
            tracing::warn!(error = %e, "cannot stop on interrupt");
        }
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "interrupt handler not installed");
    }
}

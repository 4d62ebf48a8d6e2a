use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use vmhost::controller::{ControllerOptions, VmController};
use vmhost::hypervisor::qemu::QemuHypervisor;
use vmhost::hypervisor::sim::SimHypervisor;
use vmhost::orchestrator::{self, RunMode};
use vmhost::CreationSettings;

#[derive(Parser)]
#[command(
    name = "vmhost",
    about = "Create and run persisted virtual machine bundles",
    version
)]
struct Cli {
    /// Hypervisor backend.
    #[arg(long, value_enum, default_value = "qemu")]
    engine: Engine,

    /// Seconds a graceful shutdown request gets before the stop is forced.
    #[arg(long, default_value_t = 15)]
    grace: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Engine {
    Qemu,
    Sim,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new bundle and install the guest OS into it.
    Create {
        bundle: PathBuf,
        restore_image: PathBuf,
        cpu_count: u32,
        ram_bytes: u64,
        disk_bytes: u64,
    },
    /// Install the guest OS into an existing bundle.
    Restore {
        bundle: PathBuf,
        restore_image: PathBuf,
    },
    /// Boot an existing bundle headless and wait for it to stop.
    Run { bundle: PathBuf },
    /// Boot an existing bundle with a display surface attached.
    Rungui { bundle: PathBuf },
}

fn main() {
    vmhost::logging::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let (bundle, mode, display) = match cli.command {
        Command::Create {
            bundle,
            restore_image,
            cpu_count,
            ram_bytes,
            disk_bytes,
        } => (
            bundle,
            RunMode::CreateAndRestore {
                restore_source: restore_image,
                settings: CreationSettings {
                    cpu_count,
                    ram_bytes,
                    disk_bytes,
                },
            },
            false,
        ),
        Command::Restore {
            bundle,
            restore_image,
        } => (
            bundle,
            RunMode::RestoreOnly {
                restore_source: restore_image,
            },
            false,
        ),
        Command::Run { bundle } => (bundle, RunMode::Run, false),
        Command::Rungui { bundle } => (bundle, RunMode::RunWithDisplay, true),
    };

    let options = ControllerOptions {
        stop_grace: Duration::from_secs(cli.grace),
        display,
    };

    match cli.engine {
        Engine::Qemu => {
            let controller = VmController::new(QemuHypervisor::new(), options)?;
            orchestrator::run(controller, &bundle, mode)?;
        }
        Engine::Sim => {
            let controller = VmController::new(SimHypervisor::default(), options)?;
            orchestrator::run(controller, &bundle, mode)?;
        }
    }
    Ok(())
}

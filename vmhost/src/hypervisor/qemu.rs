//! QEMU process backend.
//!
//! Runs the guest as a `qemu-system-*` child process. Graceful stop goes
//! through the instance's QMP socket (`system_powerdown`); forceful stop
//! kills the child. A waiter thread watches for the child exiting and turns
//! that into guest events, so a shutdown initiated inside the guest is
//! observed the same way as one we requested.

use std::io::{BufRead as _, BufReader, Write as _};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bundle::identity::{HardwareModel, MachineIdentifier};
use crate::error::{VmhostError, VmhostResult};
use crate::exec::Completion;
use crate::hypervisor::{
    EventSender, GuestEvent, Hypervisor, Instance, InstanceSpec, ProgressFn, RestoreSourceInfo,
    provision_disk,
};

#[cfg(target_arch = "aarch64")]
const QEMU_SYSTEM: &str = "qemu-system-aarch64";
#[cfg(not(target_arch = "aarch64"))]
const QEMU_SYSTEM: &str = "qemu-system-x86_64";

#[cfg(target_arch = "aarch64")]
const MACHINE_TYPE: &str = "virt";
#[cfg(not(target_arch = "aarch64"))]
const MACHINE_TYPE: &str = "q35";

const MIN_RAM_BYTES: u64 = 128 << 20;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const QMP_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Descriptor serialized into the bundle as the hardware model. A bundle
/// created by this backend can only be booted by a backend reporting the
/// same machine type.
#[derive(serde::Serialize, serde::Deserialize, PartialEq)]
struct QemuModel {
    backend: String,
    machine: String,
}

impl QemuModel {
    fn current() -> Self {
        Self {
            backend: "qemu".into(),
            machine: MACHINE_TYPE.into(),
        }
    }

    fn to_descriptor(&self) -> HardwareModel {
        // serializing a two-string struct cannot fail
        HardwareModel::new(serde_json::to_vec(self).unwrap_or_default())
    }
}

pub struct QemuHypervisor {
    binary: PathBuf,
    /// Optional firmware code image; when present the auxiliary storage is
    /// attached as the UEFI variable store.
    firmware: Option<PathBuf>,
}

impl QemuHypervisor {
    /// Backend using `qemu-system-*` from `$PATH`. Firmware comes from
    /// `VMHOST_FIRMWARE` when set.
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from(QEMU_SYSTEM),
            firmware: std::env::var_os("VMHOST_FIRMWARE").map(PathBuf::from),
        }
    }

    pub fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_firmware(mut self, firmware: PathBuf) -> Self {
        self.firmware = Some(firmware);
        self
    }
}

impl Default for QemuHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for QemuHypervisor {
    type Instance = QemuInstance;

    fn inspect_restore_source(&self, path: &Path) -> VmhostResult<RestoreSourceInfo> {
        let meta = std::fs::metadata(path).map_err(|e| {
            VmhostError::InstallFailed(format!("restore source {}: {e}", path.display()))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(VmhostError::InstallFailed(format!(
                "restore source {} is not a loadable image",
                path.display()
            )));
        }
        Ok(RestoreSourceInfo {
            hardware_model: QemuModel::current().to_descriptor(),
            min_cpu_count: 1,
            min_ram_bytes: MIN_RAM_BYTES,
        })
    }

    fn validate(&self, spec: &InstanceSpec) -> VmhostResult<()> {
        if spec.cpu_count == 0 {
            return Err(VmhostError::ConfigInvalid("cpu_count must be at least 1".into()));
        }
        let host_cpus = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        if spec.cpu_count > host_cpus {
            return Err(VmhostError::ConfigInvalid(format!(
                "cpu_count {} exceeds the {host_cpus} available on this host",
                spec.cpu_count
            )));
        }
        if spec.ram_bytes < MIN_RAM_BYTES {
            return Err(VmhostError::ConfigInvalid(format!(
                "ram_bytes {} is below the supported minimum {MIN_RAM_BYTES}",
                spec.ram_bytes
            )));
        }
        let model: QemuModel = serde_json::from_slice(spec.identity.hardware_model.as_bytes())
            .map_err(|_| VmhostError::ConfigInvalid("unsupported hardware model for this backend".into()))?;
        if model != QemuModel::current() {
            return Err(VmhostError::ConfigInvalid(format!(
                "bundle was created for machine type {:?}, this backend provides {MACHINE_TYPE:?}",
                model.machine
            )));
        }
        Ok(())
    }

    fn create_instance(
        &self,
        spec: &InstanceSpec,
        events: EventSender,
    ) -> VmhostResult<QemuInstance> {
        if !spec.disk_image.exists() {
            return Err(VmhostError::ConfigInvalid(format!(
                "disk image {} does not exist",
                spec.disk_image.display()
            )));
        }
        let qmp_socket = spec
            .disk_image
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("qmp.sock");
        Ok(QemuInstance {
            binary: self.binary.clone(),
            firmware: self.firmware.clone(),
            spec: spec.clone(),
            qmp_socket,
            events,
            child: Arc::new(Mutex::new(None)),
            forced: Arc::new(AtomicBool::new(false)),
        })
    }
}

pub struct QemuInstance {
    binary: PathBuf,
    firmware: Option<PathBuf>,
    spec: InstanceSpec,
    qmp_socket: PathBuf,
    events: EventSender,
    child: Arc<Mutex<Option<Child>>>,
    forced: Arc<AtomicBool>,
}

impl QemuInstance {
    fn command(&self) -> Command {
        let spec = &self.spec;
        let mut command = Command::new(&self.binary);
        command
            .arg("-machine")
            .arg(format!("{MACHINE_TYPE},accel=kvm:tcg"))
            .arg("-cpu")
            .arg("max")
            .arg("-smp")
            .arg(spec.cpu_count.to_string())
            .arg("-m")
            .arg(format!("{}M", spec.ram_bytes >> 20))
            .arg("-uuid")
            .arg(uuid_text(&spec.identity.machine_identifier));

        if let Some(firmware) = &self.firmware {
            command.arg("-drive").arg(format!(
                "if=pflash,format=raw,readonly=on,unit=0,file={}",
                firmware.display()
            ));
            command.arg("-drive").arg(format!(
                "if=pflash,format=raw,unit=1,file={}",
                spec.auxiliary_storage.display()
            ));
        }

        command
            .arg("-drive")
            .arg(format!("file={},format=raw,if=virtio", spec.disk_image.display()))
            .arg("-netdev")
            .arg("user,id=net0")
            .arg("-device")
            .arg(format!(
                "virtio-net-pci,netdev=net0,mac={}",
                spec.identity.mac_address
            ));

        if spec.keyboard || spec.pointer {
            command.arg("-usb");
            if spec.keyboard {
                command.arg("-device").arg("usb-kbd");
            }
            if spec.pointer {
                command.arg("-device").arg("usb-tablet");
            }
        }
        if !spec.display {
            command.arg("-nographic");
        }

        command.arg("-qmp").arg(format!(
            "unix:{},server,wait=off",
            self.qmp_socket.display()
        ));

        // detach stdio so guest console noise never interleaves with ours
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
        command
    }

    fn spawn_exit_waiter(&self) {
        let child = Arc::clone(&self.child);
        let forced = Arc::clone(&self.forced);
        let events = self.events.clone();
        let _ = thread::Builder::new()
            .name("vmhost-qemu-waiter".into())
            .spawn(move || {
                loop {
                    let mut guard = child.lock();
                    let Some(running) = guard.as_mut() else {
                        return;
                    };
                    match running.try_wait() {
                        Ok(Some(status)) => {
                            *guard = None;
                            drop(guard);
                            let event = if forced.load(Ordering::SeqCst) || status.success() {
                                GuestEvent::Stopped
                            } else {
                                GuestEvent::Errored(format!("qemu exited with {status}"))
                            };
                            tracing::debug!(?event, "qemu child exited");
                            let _ = events.send(event);
                            return;
                        }
                        Ok(None) => {
                            drop(guard);
                            thread::sleep(EXIT_POLL_INTERVAL);
                        }
                        Err(e) => {
                            *guard = None;
                            drop(guard);
                            let _ = events.send(GuestEvent::Errored(format!(
                                "failed to observe qemu child: {e}"
                            )));
                            return;
                        }
                    }
                }
            });
    }
}

impl Instance for QemuInstance {
    fn start(&mut self, done: Completion<bool>) {
        if self.child.lock().is_some() {
            done.ok(false);
            return;
        }
        match self.command().spawn() {
            Ok(child) => {
                tracing::info!(pid = child.id(), "qemu started");
                *self.child.lock() = Some(child);
                self.forced.store(false, Ordering::SeqCst);
                self.spawn_exit_waiter();
                done.ok(true);
            }
            Err(e) => done.err(VmhostError::Internal(format!(
                "failed to spawn {}: {e}",
                self.binary.display()
            ))),
        }
    }

    fn request_stop(&mut self) -> VmhostResult<bool> {
        if self.child.lock().is_none() {
            return Ok(false);
        }
        match qmp_powerdown(&self.qmp_socket) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "guest did not accept the shutdown request");
                Ok(false)
            }
        }
    }

    fn force_stop(&mut self, done: Completion<()>) {
        self.forced.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.lock().as_mut() {
            // an already-exited child is fine; the waiter reaps it
            let _ = child.kill();
        }
        done.ok(());
    }

    fn install(&mut self, source: &Path, progress: ProgressFn, done: Completion<()>) {
        let source = source.to_path_buf();
        let disk_image = self.spec.disk_image.clone();
        let events = self.events.clone();
        let _ = thread::Builder::new()
            .name("vmhost-install".into())
            .spawn(move || match provision_disk(&source, &disk_image, &progress) {
                Ok(()) => {
                    done.ok(());
                    // provisioning leaves the guest powered off
                    let _ = events.send(GuestEvent::Stopped);
                }
                Err(e) => done.err(e),
            });
    }
}

impl Drop for QemuInstance {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().take() {
            tracing::warn!(pid = child.id(), "instance dropped while guest running, killing");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Minimal QMP exchange: greeting, capability negotiation, `system_powerdown`.
fn qmp_powerdown(socket: &Path) -> std::io::Result<()> {
    let stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(QMP_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(QMP_IO_TIMEOUT))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    // server greeting
    reader.read_line(&mut line)?;

    writer.write_all(b"{\"execute\":\"qmp_capabilities\"}\n")?;
    line.clear();
    reader.read_line(&mut line)?;

    writer.write_all(b"{\"execute\":\"system_powerdown\"}\n")?;
    line.clear();
    reader.read_line(&mut line)?;
    Ok(())
}

fn uuid_text(id: &MachineIdentifier) -> String {
    let h = hex::encode(id.as_bytes());
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

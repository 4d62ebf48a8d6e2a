//! On-disk bundle store.
//!
//! A bundle is a directory holding everything one virtual machine needs to
//! survive restarts: its raw disk image, its firmware/auxiliary storage, and
//! a JSON descriptor combining identity and configuration. Layout is fixed:
//!
//! ```text
//! <bundle>/
//!   disk.img     raw disk resource, sized at creation
//!   nvram.img    firmware storage, created once and opaque thereafter
//!   config.json  identity + configuration descriptor
//! ```
//!
//! Bundles are created exactly once, loaded any number of times, and never
//! deleted by this tool.

pub mod identity;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{VmhostError, VmhostResult};
use self::identity::{HardwareModel, MacAddress, MachineIdentifier, VmIdentity};

pub const DISK_IMAGE_NAME: &str = "disk.img";
pub const NVRAM_IMAGE_NAME: &str = "nvram.img";
pub const CONFIG_JSON_NAME: &str = "config.json";

/// Reserved length of the firmware storage resource. Current hardware models
/// all use the same reservation; the file is sparse until the hypervisor
/// writes to it.
const NVRAM_IMAGE_LEN: u64 = 64 << 20;

/// Configuration persisted with the bundle and re-applied unchanged on every
/// load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub cpu_count: u32,
    pub ram_bytes: u64,
}

/// Creation-time settings. `disk_bytes` only sizes the initial disk resource
/// and is not persisted or re-validated on load.
#[derive(Debug, Clone, Copy)]
pub struct CreationSettings {
    pub cpu_count: u32,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

impl CreationSettings {
    pub fn config(&self) -> VmConfig {
        VmConfig {
            cpu_count: self.cpu_count,
            ram_bytes: self.ram_bytes,
        }
    }
}

/// Serialized form of `config.json`.
///
/// Field names and encodings are the bundle's wire format; changing them
/// breaks every existing bundle.
#[derive(Serialize, Deserialize)]
struct ConfigDescriptor {
    cpu_count: u32,
    ram_size: u64,
    machine_identifier: String,
    hardware_model: String,
    mac_address: String,
}

/// Handle to a bundle directory.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    /// Create a new bundle at `path`.
    ///
    /// Fails with [`VmhostError::AlreadyExists`] if `path` exists in any
    /// form; an existing bundle is never overwritten. The disk resource is
    /// sparse-allocated at `settings.disk_bytes`, the firmware resource is
    /// reserved according to the hardware model, and the descriptor is
    /// written last. Any filesystem failure aborts the whole operation.
    pub fn create(
        path: &Path,
        identity: &VmIdentity,
        settings: &CreationSettings,
    ) -> VmhostResult<Self> {
        if path.exists() {
            return Err(VmhostError::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(path)?;

        let bundle = Self {
            root: path.to_path_buf(),
        };

        let disk = fs::File::create(bundle.disk_path())?;
        disk.set_len(settings.disk_bytes)?;

        let nvram = fs::File::create(bundle.nvram_path())?;
        nvram.set_len(NVRAM_IMAGE_LEN)?;

        bundle.save(identity, &settings.config())?;

        tracing::info!(
            bundle = %path.display(),
            disk_bytes = settings.disk_bytes,
            "created bundle"
        );
        Ok(bundle)
    }

    /// Load an existing bundle.
    ///
    /// Fails with [`VmhostError::NotFound`] when the descriptor is absent
    /// and [`VmhostError::Corrupt`] when any field is missing or malformed.
    /// Identity fields are decoded byte-for-byte; nothing is ever defaulted
    /// or regenerated.
    pub fn load(path: &Path) -> VmhostResult<(Self, VmIdentity, VmConfig)> {
        let bundle = Self {
            root: path.to_path_buf(),
        };
        let config_path = bundle.config_path();
        if !config_path.exists() {
            return Err(VmhostError::NotFound(config_path.display().to_string()));
        }

        let raw = fs::read_to_string(&config_path)?;
        let descriptor: ConfigDescriptor = serde_json::from_str(&raw)
            .map_err(|e| VmhostError::Corrupt(format!("{}: {e}", config_path.display())))?;

        let identity = VmIdentity {
            machine_identifier: MachineIdentifier::from_base64(&descriptor.machine_identifier)?,
            hardware_model: HardwareModel::from_base64(&descriptor.hardware_model)?,
            mac_address: descriptor.mac_address.parse::<MacAddress>()?,
        };
        // identity must round-trip exactly; a descriptor that decodes but
        // re-encodes differently was not written by this tool
        if identity.machine_identifier.to_base64() != descriptor.machine_identifier
            || identity.hardware_model.to_base64() != descriptor.hardware_model
            || identity.mac_address.to_string() != descriptor.mac_address
        {
            return Err(VmhostError::Corrupt(format!(
                "{}: identity fields are not canonical",
                config_path.display()
            )));
        }
        let config = VmConfig {
            cpu_count: descriptor.cpu_count,
            ram_bytes: descriptor.ram_size,
        };

        tracing::debug!(bundle = %path.display(), mac = %identity.mac_address, "loaded bundle");
        Ok((bundle, identity, config))
    }

    /// Write the descriptor. Idempotent overwrite; the disk and firmware
    /// resources are not touched.
    pub fn save(&self, identity: &VmIdentity, config: &VmConfig) -> VmhostResult<()> {
        let descriptor = ConfigDescriptor {
            cpu_count: config.cpu_count,
            ram_size: config.ram_bytes,
            machine_identifier: identity.machine_identifier.to_base64(),
            hardware_model: identity.hardware_model.to_base64(),
            mac_address: identity.mac_address.to_string(),
        };
        let json = serde_json::to_string_pretty(&descriptor)
            .map_err(|e| VmhostError::Internal(format!("descriptor serialization failed: {e}")))?;
        fs::write(self.config_path(), json)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_path(&self) -> PathBuf {
        self.root.join(DISK_IMAGE_NAME)
    }

    pub fn nvram_path(&self) -> PathBuf {
        self.root.join(NVRAM_IMAGE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_JSON_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_identity() -> VmIdentity {
        VmIdentity::generate(HardwareModel::new(b"test-model".to_vec()))
    }

    fn test_settings() -> CreationSettings {
        CreationSettings {
            cpu_count: 4,
            ram_bytes: 4 << 30,
            disk_bytes: 1 << 20,
        }
    }

    #[test]
    fn create_then_load_round_trips_identity_and_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vm.bundle");
        let identity = test_identity();
        let settings = test_settings();

        Bundle::create(&path, &identity, &settings).unwrap();
        let (_, loaded_identity, loaded_config) = Bundle::load(&path).unwrap();

        assert_eq!(loaded_identity, identity);
        assert_eq!(loaded_config, settings.config());
    }

    #[test]
    fn create_allocates_resources_at_requested_sizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vm.bundle");
        let settings = test_settings();

        let bundle = Bundle::create(&path, &test_identity(), &settings).unwrap();

        assert_eq!(
            fs::metadata(bundle.disk_path()).unwrap().len(),
            settings.disk_bytes
        );
        assert!(fs::metadata(bundle.nvram_path()).unwrap().len() > 0);
        assert!(bundle.config_path().exists());
    }

    #[test]
    fn create_refuses_existing_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vm.bundle");
        Bundle::create(&path, &test_identity(), &test_settings()).unwrap();

        let before = fs::read_to_string(path.join(CONFIG_JSON_NAME)).unwrap();
        let result = Bundle::create(&path, &test_identity(), &test_settings());
        assert!(matches!(result, Err(VmhostError::AlreadyExists(_))));

        // nothing was overwritten
        let after = fs::read_to_string(path.join(CONFIG_JSON_NAME)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn load_missing_descriptor_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bundle");
        fs::create_dir_all(&path).unwrap();

        assert!(matches!(
            Bundle::load(&path),
            Err(VmhostError::NotFound(_))
        ));
    }

    #[test]
    fn load_rejects_missing_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vm.bundle");
        fs::create_dir_all(&path).unwrap();
        // ram_size absent
        fs::write(
            path.join(CONFIG_JSON_NAME),
            r#"{"cpu_count": 2, "machine_identifier": "AA==", "hardware_model": "AA==", "mac_address": "02:00:00:00:00:01"}"#,
        )
        .unwrap();

        assert!(matches!(Bundle::load(&path), Err(VmhostError::Corrupt(_))));
    }

    #[test]
    fn load_rejects_malformed_identity_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vm.bundle");
        let bundle = Bundle::create(&path, &test_identity(), &test_settings()).unwrap();

        let good = fs::read_to_string(bundle.config_path()).unwrap();
        let cases = [
            // identifier with the wrong decoded length
            ("machine_identifier", "QUJD"),
            // identifier that is not base64 at all
            ("machine_identifier", "@@@"),
            // empty hardware model
            ("hardware_model", ""),
            // truncated mac
            ("mac_address", "02:00:00"),
            // parses, but does not round-trip to the canonical form
            ("mac_address", "02:AA:BB:CC:DD:EE"),
        ];

        for (field, value) in cases {
            let mut doc: serde_json::Value = serde_json::from_str(&good).unwrap();
            doc[field] = serde_json::Value::String(value.to_string());
            fs::write(bundle.config_path(), doc.to_string()).unwrap();
            assert!(
                matches!(Bundle::load(&path), Err(VmhostError::Corrupt(_))),
                "field {field}={value:?} should be corrupt"
            );
        }
    }

    #[test]
    fn save_is_idempotent_and_leaves_resources_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vm.bundle");
        let identity = test_identity();
        let settings = test_settings();
        let bundle = Bundle::create(&path, &identity, &settings).unwrap();

        let disk_len = fs::metadata(bundle.disk_path()).unwrap().len();
        bundle.save(&identity, &settings.config()).unwrap();
        bundle.save(&identity, &settings.config()).unwrap();

        let (_, loaded, _) = Bundle::load(&path).unwrap();
        assert_eq!(loaded, identity);
        assert_eq!(fs::metadata(bundle.disk_path()).unwrap().len(), disk_len);
    }
}

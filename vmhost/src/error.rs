//! Crate-wide error taxonomy.
//!
//! Every failure in this tool is unrecoverable at its own scope: errors
//! propagate up to the run-mode dispatcher, which reports them and exits.

use thiserror::Error;

/// Convenient result alias used throughout the crate.
pub type VmhostResult<T> = Result<T, VmhostError>;

#[derive(Debug, Error)]
pub enum VmhostError {
    /// The target bundle path already exists; create never overwrites.
    #[error("bundle already exists: {0}")]
    AlreadyExists(String),

    /// The bundle (or its configuration descriptor) does not exist.
    #[error("bundle not found: {0}")]
    NotFound(String),

    /// The bundle descriptor is present but unusable. Identity fields are
    /// never regenerated on load; a corrupt descriptor is fatal.
    #[error("corrupt bundle: {0}")]
    Corrupt(String),

    /// The hypervisor rejected the assembled instance configuration.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The restore source could not be loaded, or the guest install was
    /// rejected by the hypervisor.
    #[error("install failed: {0}")]
    InstallFailed(String),

    /// The guest reported a runtime failure.
    #[error("guest error: {0}")]
    GuestError(String),

    /// An operation was invoked outside its required lifecycle state.
    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

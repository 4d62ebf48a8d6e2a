//! Controller lifecycle states.

/// Lifecycle of one controller-managed virtual machine.
///
/// ```text
/// Unbound -> Bound -> Starting -> Running -> StopRequested -> Stopped
/// ```
///
/// `Failed` is reachable from any non-terminal state; `Stopped` and `Failed`
/// are terminal. A controller is bound to one bundle for its whole life and
/// never returns to `Unbound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No bundle bound yet.
    Unbound,
    /// Bundle bound, instance created, guest not running.
    Bound,
    /// A start has been issued and not yet completed.
    Starting,
    /// Guest is running.
    Running,
    /// A stop has been requested and not yet concluded.
    StopRequested,
    /// Terminal: the guest has stopped.
    Stopped,
    /// Terminal: a fatal error occurred.
    Failed,
}

impl VmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Stopped | VmState::Failed)
    }

    /// Whether the guest is somewhere between start and full stop.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Running | VmState::StopRequested
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(VmState::Stopped.is_terminal());
        assert!(VmState::Failed.is_terminal());
        assert!(!VmState::Running.is_terminal());
        assert!(!VmState::Unbound.is_terminal());
    }

    #[test]
    fn active_states() {
        assert!(VmState::Starting.is_active());
        assert!(VmState::Running.is_active());
        assert!(VmState::StopRequested.is_active());
        assert!(!VmState::Bound.is_active());
        assert!(!VmState::Stopped.is_active());
    }
}

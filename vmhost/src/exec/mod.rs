//! Serialized execution context and one-shot synchronization primitives.
//!
//! Every hypervisor-mutating operation for a controller instance runs on a
//! single dedicated worker thread, in strict submission order. Callers never
//! touch the hypervisor handle directly and need no locking of their own.
//!
//! Two bridges connect the worker's asynchronous completions back to blocking
//! callers:
//! - [`Completion`] is the one-shot result slot a submitted operation must
//!   eventually resolve. Resolution consumes the slot, so resolving twice is
//!   unrepresentable rather than a runtime race.
//! - [`OnceGate`] is a resolve-once, wait-many latch. Multiple sources may
//!   race to resolve it; the first wins and every later attempt is a benign
//!   no-op that reports it lost.

use std::thread;

use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::error::{VmhostError, VmhostResult};

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// One-shot result slot for an operation executed on the worker.
///
/// The operation (or a callback it arranges) must call [`Completion::resolve`]
/// exactly once. Dropping it unresolved wakes the blocked caller with an
/// internal error instead of hanging it.
pub struct Completion<T> {
    tx: oneshot::Sender<VmhostResult<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(tx: oneshot::Sender<VmhostResult<T>>) -> Self {
        Self { tx }
    }

    /// Resolve the slot. Consumes `self`: a completion can fire at most once.
    pub fn resolve(self, result: VmhostResult<T>) {
        // The receiver disappearing means the blocked caller is gone; there
        // is nobody left to inform.
        let _ = self.tx.send(result);
    }

    pub fn ok(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn err(self, error: VmhostError) {
        self.resolve(Err(error));
    }
}

/// Single-worker executor guaranteeing FIFO execution of submitted jobs.
///
/// The worker thread exclusively owns the state `S` (for the lifecycle
/// controller, the hypervisor instance slot). Jobs receive `&mut S`, so no
/// two hypervisor calls ever run concurrently against the same handle.
///
/// The worker drains its queue and exits once the executor is dropped.
pub struct SerialExecutor<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Spawn the worker thread with its initial state.
    pub fn new(name: &str, mut state: S) -> VmhostResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&mut state);
                }
            })
            .map_err(|e| VmhostError::Internal(format!("failed to spawn executor worker: {e}")))?;
        Ok(Self { tx })
    }

    /// Enqueue a job and return immediately.
    ///
    /// Jobs execute strictly after all previously submitted jobs, regardless
    /// of which thread submitted them.
    pub fn submit(&self, job: impl FnOnce(&mut S) + Send + 'static) {
        // A send failure means the worker is gone; the next blocking_call
        // surfaces that as an error.
        let _ = self.tx.send(Box::new(job));
    }

    /// Enqueue a job and block the calling thread until the job resolves the
    /// [`Completion`] it was handed.
    ///
    /// The job itself may return before resolution; any callback it arranges
    /// (for example a hypervisor completion handler) may resolve the slot
    /// later, from any thread except the blocked caller's.
    pub fn blocking_call<T, F>(&self, job: F) -> VmhostResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, Completion<T>) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(tx);
        self.tx
            .send(Box::new(move |state: &mut S| job(state, completion)))
            .map_err(|_| VmhostError::Internal("executor worker has exited".into()))?;
        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(VmhostError::Internal(
                "operation dropped its completion without resolving it".into(),
            )),
        }
    }
}

/// Resolve-once, wait-many latch.
///
/// Used for the terminal-stop signal: guest shutdown, guest error, and the
/// forceful stop path all race to resolve it; exactly one value sticks and
/// every waiter observes that value. Waiting after resolution returns
/// immediately, any number of times.
pub struct OnceGate<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> OnceGate<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Resolve the gate. Returns `true` if this call won the race; `false`
    /// means the gate was already resolved and this call changed nothing.
    pub fn resolve(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.cond.notify_all();
        true
    }

    /// Block until the gate is resolved and return the winning value.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.cond.wait(&mut slot);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> Default for OnceGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn jobs_run_in_submission_order() {
        let executor = SerialExecutor::new("test-exec", Vec::<u32>::new()).unwrap();
        for i in 0..100 {
            executor.submit(move |log| log.push(i));
        }
        let log = executor
            .blocking_call(|log: &mut Vec<u32>, done| done.ok(log.clone()))
            .unwrap();
        assert_eq!(log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn blocking_call_returns_resolved_value() {
        let executor = SerialExecutor::new("test-exec", 41u32).unwrap();
        let value = executor
            .blocking_call(|state, done| done.ok(*state + 1))
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn blocking_call_propagates_errors() {
        let executor = SerialExecutor::new("test-exec", ()).unwrap();
        let result: VmhostResult<()> = executor
            .blocking_call(|_, done| done.err(VmhostError::GuestError("boom".into())));
        assert!(matches!(result, Err(VmhostError::GuestError(_))));
    }

    #[test]
    fn dropped_completion_unblocks_caller() {
        let executor = SerialExecutor::new("test-exec", ()).unwrap();
        let result: VmhostResult<()> = executor.blocking_call(|_, done| drop(done));
        assert!(matches!(result, Err(VmhostError::Internal(_))));
    }

    #[test]
    fn deferred_resolution_from_another_thread() {
        let executor = SerialExecutor::new("test-exec", ()).unwrap();
        let value = executor
            .blocking_call(|_, done| {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    done.ok(7u32);
                });
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn gate_resolves_exactly_once_under_contention() {
        let gate = Arc::new(OnceGate::new());
        let wins = Arc::new(AtomicUsize::new(0));

        let resolvers: Vec<_> = (0..8)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if gate.resolve(i) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in resolvers {
            t.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(gate.is_resolved());
    }

    #[test]
    fn every_waiter_observes_the_winning_value() {
        let gate = Arc::new(OnceGate::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.wait())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(20));
        assert!(gate.resolve("stopped"));
        assert!(!gate.resolve("late"));

        for t in waiters {
            assert_eq!(t.join().unwrap(), "stopped");
        }
        // Waiting after resolution returns immediately.
        assert_eq!(gate.wait(), "stopped");
    }
}

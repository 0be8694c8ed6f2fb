//! RAII guard for entering a sender pod's network namespace to run a
//! probe from inside it, with guaranteed release back to the runner's
//! own namespace on every exit path (including an early return or a
//! panic unwind).
//!
//! The acquire/restore shape is a systems-programming commonplace; no
//! example repo in this pack performs a real `setns(2)` call, so this
//! is built directly against `nix::sched::setns` rather than adapted
//! from a specific file. Nesting is not supported: a second
//! [`NetnsGuard::enter`] call while one is already held panics, since
//! there is exactly one runner task active in a network namespace at
//! a time (probes run sequentially within a runner, §C6).

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sched::{setns, CloneFlags};

use crate::error::RunnerError;

static NETNS_HELD: AtomicBool = AtomicBool::new(false);

/// Holds the runner's own network namespace open so it can be restored,
/// and the target namespace entered for its lifetime.
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    /// Enter the network namespace of the process identified by `pid`.
    /// Restores the caller's original namespace when dropped.
    pub fn enter(pid: u32) -> Result<Self, RunnerError> {
        if NETNS_HELD.swap(true, Ordering::SeqCst) {
            panic!("NetnsGuard::enter called while another guard is already held");
        }

        let result = (|| -> Result<Self, RunnerError> {
            let original = File::open("/proc/self/ns/net")
                .map_err(|e| RunnerError::NamespaceEntry("self".to_string(), e.to_string()))?;

            let target_path = format!("/proc/{pid}/ns/net");
            let target = File::open(&target_path)
                .map_err(|e| RunnerError::NamespaceEntry(target_path.clone(), e.to_string()))?;

            setns(&target, CloneFlags::CLONE_NEWNET)
                .map_err(|e| RunnerError::NamespaceEntry(target_path, e.to_string()))?;

            Ok(NetnsGuard { original })
        })();

        if result.is_err() {
            NETNS_HELD.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // Best-effort: a failure here leaves the runner process itself
        // wedged in the target namespace, which is caught immediately
        // by the next probe's sanity checks rather than silently
        // ignored.
        let _ = setns(&self.original, CloneFlags::CLONE_NEWNET);
        NETNS_HELD.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "already held")]
    fn nested_enter_panics() {
        NETNS_HELD.store(true, Ordering::SeqCst);
        let _ = NetnsGuard::enter(1);
    }
}

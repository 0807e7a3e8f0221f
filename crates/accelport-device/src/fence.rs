use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use accelport_core::{ErrorStatus, Timing};

/// Observable state of a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    /// Not yet signaled.
    Active,
    Signaled,
    /// Signaled with an error; gated work must not run.
    Error,
}

struct FenceInner {
    state: Mutex<FenceState>,
    signaled: Condvar,
}

/// A waitable synchronization primitive gating fenced execution. Clones share
/// the same state; signaling is idempotent and sticky.
#[derive(Clone)]
pub struct SyncFence {
    inner: Arc<FenceInner>,
}

impl SyncFence {
    pub fn new() -> Self {
        Self::with_state(FenceState::Active)
    }

    /// An already-signaled fence; waiting returns immediately.
    pub fn signaled() -> Self {
        Self::with_state(FenceState::Signaled)
    }

    fn with_state(state: FenceState) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(state),
                signaled: Condvar::new(),
            }),
        }
    }

    /// First signal wins; later signals are ignored.
    pub fn signal(&self, success: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == FenceState::Active {
            *state = if success {
                FenceState::Signaled
            } else {
                FenceState::Error
            };
            self.inner.signaled.notify_all();
        }
    }

    pub fn state(&self) -> FenceState {
        *self.inner.state.lock().unwrap()
    }

    /// Blocks until the fence leaves Active, or until `timeout` elapses (in
    /// which case Active is returned).
    pub fn wait(&self, timeout: Option<Duration>) -> FenceState {
        let mut state = self.inner.state.lock().unwrap();
        match timeout {
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while *state == FenceState::Active {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return FenceState::Active;
                    }
                    let (next, _) = self
                        .inner
                        .signaled
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next;
                }
                *state
            }
            None => {
                while *state == FenceState::Active {
                    state = self.inner.signaled.wait(state).unwrap();
                }
                *state
            }
        }
    }
}

impl Default for SyncFence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SyncFence").field(&self.state()).finish()
    }
}

/// Lightweight handle returned by fence-gated dispatch for querying timing
/// after the output fence has signaled.
pub trait FencedExecutionCallback: Send + Sync {
    /// `(status, timing_launched, timing_fenced)`.
    fn execution_info(&self) -> (ErrorStatus, Timing, Timing);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_signal_wins() {
        let fence = SyncFence::new();
        assert_eq!(fence.state(), FenceState::Active);
        fence.signal(false);
        fence.signal(true);
        assert_eq!(fence.state(), FenceState::Error);
    }

    #[test]
    fn wait_times_out_while_active() {
        let fence = SyncFence::new();
        let state = fence.wait(Some(Duration::from_millis(10)));
        assert_eq!(state, FenceState::Active);
    }

    #[test]
    fn wait_observes_signal_from_another_thread() {
        let fence = SyncFence::new();
        let signaler = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                fence.signal(true);
            })
        };
        assert_eq!(fence.wait(None), FenceState::Signaled);
        signaler.join().unwrap();

        // Clones share state; an already-signaled fence returns immediately.
        assert_eq!(fence.wait(Some(Duration::ZERO)), FenceState::Signaled);
        assert_eq!(SyncFence::signaled().wait(None), FenceState::Signaled);
    }
}

//! Start/stop lifecycle shared by the producer and the consumer
//!
//! ```text
//!  Idle ──start──► Running ──stop──► Stopping ──(loop exits)──► Stopped
//!    └──────────────────stop (before start)─────────────────────────┘
//! ```
//!
//! `stop` cancels the shutdown token, which every loop checks between units
//! of work. `abort` additionally cancels the abort token, which interrupts
//! work in progress.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, not yet started
    Idle,
    /// Loop is running
    Running,
    /// Stop requested, loop still draining
    Stopping,
    /// Loop has exited; cannot be restarted
    Stopped,
}

/// Lifecycle controller
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<State>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            state,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// True only between a successful start and the loop's exit
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Move from Idle to Running. Returns false if already started or stopped.
    pub fn try_start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == State::Idle {
                *state = State::Running;
                true
            } else {
                false
            }
        })
    }

    /// Ask the loop to stop after its current unit of work
    pub fn request_stop(&self) {
        self.state.send_if_modified(|state| match *state {
            State::Idle => {
                *state = State::Stopped;
                true
            }
            State::Running => {
                *state = State::Stopping;
                true
            }
            State::Stopping | State::Stopped => false,
        });
        self.shutdown.cancel();
    }

    /// Stop and interrupt work in progress
    pub fn abort(&self) {
        self.request_stop();
        self.abort.cancel();
    }

    /// Mark the loop as exited
    pub fn finish(&self) {
        self.state.send_replace(State::Stopped);
    }

    /// Wait until the loop has exited (or was never started and is stopped)
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|state| *state == State::Stopped).await;
    }

    /// Request a stop and wait for the loop to exit
    pub async fn stop(&self) {
        self.request_stop();
        self.stopped().await;
    }

    /// Guard that marks the lifecycle stopped when the run scope ends,
    /// including when the running future is dropped
    pub(crate) fn run_guard(&self) -> RunGuard<'_> {
        RunGuard(self)
    }

    /// Token cancelled when a stop is requested
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Token cancelled when work in progress must be abandoned
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }
}

pub(crate) struct RunGuard<'a>(&'a Lifecycle);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

//! Connection state machine shared by the backends

use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{BackendError, Result};

/// Lifecycle of the device link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Cold-start read of every channel
    Syncing,
    Polling,
    Reconnecting,
    /// Explicit shutdown, terminal
    Stopped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Syncing => "syncing",
            LinkState::Polling => "polling",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Current state plus an interruptible stop flag
pub(crate) struct Link {
    state: RwLock<LinkState>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Link {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(LinkState::Disconnected),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Link state {} -> {}", *current, state);
            *current = state;
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.stopped.lock() = false;
        self.set_state(LinkState::Disconnected);
    }

    /// Sleep unless stopped; returns true when stopped
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    /// Run `attempt` until it succeeds, waiting `delay` after each recoverable failure
    ///
    /// Gives up after `max_attempts` failures when set, returning the last error.
    pub(crate) fn connect_with_retry<F>(
        &self,
        delay: Duration,
        max_attempts: Option<usize>,
        mut attempt: F,
    ) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let mut failures = 0;
        loop {
            if self.is_stopped() {
                return Err(BackendError::Stopped);
            }
            self.set_state(LinkState::Connecting);
            match attempt() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    failures += 1;
                    if max_attempts.map_or(false, |max| failures >= max) {
                        self.set_state(LinkState::Disconnected);
                        return Err(e);
                    }
                    warn!("Device not available ({}), trying again in {:?}", e, delay);
                    if self.sleep(delay) {
                        return Err(BackendError::Stopped);
                    }
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_until_success() {
        let link = Link::new();
        let mut calls = 0;
        let result = link.connect_with_retry(Duration::ZERO, None, || {
            calls += 1;
            if calls < 3 {
                Err(BackendError::ConnectionLost("down".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_bounded() {
        let link = Link::new();
        let result = link.connect_with_retry(Duration::ZERO, Some(2), || {
            Err(BackendError::PortNotFound("x".into()))
        });
        assert!(matches!(result, Err(BackendError::PortNotFound(_))));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_fatal_error_not_retried() {
        let link = Link::new();
        let mut calls = 0;
        let result = link.connect_with_retry(Duration::ZERO, None, || {
            calls += 1;
            Err(BackendError::Config("bad".into()))
        });
        assert!(matches!(result, Err(BackendError::Config(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let link = std::sync::Arc::new(Link::new());
        let stopper = link.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.stop();
        });
        assert!(link.sleep(Duration::from_secs(30)));
        handle.join().unwrap();
    }
}

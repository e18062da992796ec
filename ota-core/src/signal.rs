//! Flags shared between the worker, the timer and the application.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Check,
    Download,
}

#[derive(Debug, Default)]
struct Pending {
    check: bool,
    download: bool,
    shutdown: bool,
}

impl Pending {
    /// A pending download wins over a pending check
    fn first(&self) -> Option<Trigger> {
        if self.download {
            Some(Trigger::Download)
        } else if self.check {
            Some(Trigger::Check)
        } else {
            None
        }
    }
}

/// Pending work for the worker. Requests are coalesced: asking twice for
/// the same trigger before it completes results in one cycle.
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    inner: Arc<(Mutex<Pending>, Condvar)>,
}

impl Triggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, trigger: Trigger) {
        let (pending, wakeup) = &*self.inner;
        let mut pending = lock(pending);
        match trigger {
            Trigger::Check => pending.check = true,
            Trigger::Download => pending.download = true,
        }
        wakeup.notify_all();
    }

    pub fn is_pending(&self, trigger: Trigger) -> bool {
        let pending = lock(&self.inner.0);
        match trigger {
            Trigger::Check => pending.check,
            Trigger::Download => pending.download,
        }
    }

    /// Pending trigger without blocking
    pub fn peek(&self) -> Option<Trigger> {
        lock(&self.inner.0).first()
    }

    /// Block until something is pending. The trigger stays pending until
    /// `complete` is called. Returns None once shut down.
    pub fn next(&self) -> Option<Trigger> {
        let (pending, wakeup) = &*self.inner;
        let mut pending = lock(pending);
        loop {
            if pending.shutdown {
                return None;
            }
            if let Some(trigger) = pending.first() {
                return Some(trigger);
            }
            pending = wakeup.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// `next` with an upper bound on the wait
    pub fn next_timeout(&self, timeout: Duration) -> Option<Trigger> {
        let deadline = Instant::now() + timeout;
        let (pending, wakeup) = &*self.inner;
        let mut pending = lock(pending);
        loop {
            if pending.shutdown {
                return None;
            }
            if let Some(trigger) = pending.first() {
                return Some(trigger);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            pending = wakeup
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn complete(&self, trigger: Trigger) {
        let mut pending = lock(&self.inner.0);
        match trigger {
            Trigger::Check => pending.check = false,
            Trigger::Download => pending.download = false,
        }
    }

    pub fn shutdown(&self) {
        let (pending, wakeup) = &*self.inner;
        lock(pending).shutdown = true;
        wakeup.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.0).shutdown
    }
}

/// "Network reachable" level signal driven by the WiFi layer
#[derive(Debug, Clone, Default)]
pub struct ConnectivitySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ConnectivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, connected: bool) {
        let (state, wakeup) = &*self.inner;
        let mut state = lock(state);
        if *state != connected {
            log::debug!("Connectivity changed: {}", if connected { "up" } else { "down" });
        }
        *state = connected;
        wakeup.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Wait until connected; false if `timeout` passed first
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let (state, wakeup) = &*self.inner;
        let guard = lock(state);
        let (guard, _) = wakeup
            .wait_timeout_while(guard, timeout, |connected| !*connected)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

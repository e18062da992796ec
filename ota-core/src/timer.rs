//! Periodic check scheduling.
//!
//! The timer is one-shot: the worker re-arms it after every completed check
//! with the interval known at that point, so an interval delivered by the
//! metadata takes effect for the very next period.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{OtaError, Result};
use crate::signal::{Trigger, Triggers};

pub trait CheckTimer: Send {
    /// Request a check once `period` has elapsed, replacing any pending deadline
    fn arm(&mut self, period: Duration) -> Result<()>;
    /// Cancel the pending deadline, if any
    fn disarm(&mut self);
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    stop: bool,
}

fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `CheckTimer` backed by a std thread waiting on a condvar deadline
pub struct ThreadTimer {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    pub fn spawn(triggers: Triggers) -> Result<Self> {
        let shared = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
        let worker_shared = shared.clone();

        let handle = thread::Builder::new()
            .name("ota_timer".into())
            .spawn(move || run_timer(&worker_shared, &triggers))
            .map_err(|e| {
                log::error!("Failed to spawn timer thread: {}", e);
                OtaError::OutOfMemory
            })?;

        Ok(Self { shared, handle: Some(handle) })
    }

    pub fn deadline(&self) -> Option<Instant> {
        lock(&self.shared.0).deadline
    }
}

fn run_timer(shared: &(Mutex<TimerState>, Condvar), triggers: &Triggers) {
    let (state, wakeup) = shared;
    let mut guard = lock(state);
    loop {
        if guard.stop {
            break;
        }
        match guard.deadline {
            None => {
                guard = wakeup.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    guard.deadline = None;
                    log::debug!("Periodic update check due");
                    triggers.request(Trigger::Check);
                } else {
                    guard = wakeup
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

impl CheckTimer for ThreadTimer {
    fn arm(&mut self, period: Duration) -> Result<()> {
        let (state, wakeup) = &*self.shared;
        lock(state).deadline = Some(Instant::now() + period);
        wakeup.notify_all();
        log::debug!("Next update check in {} s", period.as_secs());
        Ok(())
    }

    fn disarm(&mut self) {
        let (state, wakeup) = &*self.shared;
        lock(state).deadline = None;
        wakeup.notify_all();
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        let (state, wakeup) = &*self.shared;
        lock(state).stop = true;
        wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

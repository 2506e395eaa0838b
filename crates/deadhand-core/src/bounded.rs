//! Time-bounded calls into code outside our control.
//!
//! Each call runs on its own thread while the caller waits at most the
//! given timeout. A call that overruns is abandoned, not killed: its thread
//! keeps running until the callee returns. [`CallBudget`] counts those
//! abandoned threads and refuses new calls once too many are still out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Abandoned calls tolerated before new ones are refused.
pub const DEFAULT_MAX_ABANDONED: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoundedCallError {
    #[error("no answer within {0:?}")]
    TimedOut(Duration),

    #[error("call panicked")]
    Panicked,

    #[error("{0} earlier calls are still hanging")]
    Saturated(usize),

    #[error("could not start worker thread: {0}")]
    Spawn(String),
}

/// Shared count of abandoned calls. Clones share the count.
#[derive(Debug, Clone)]
pub struct CallBudget {
    abandoned: Arc<AtomicUsize>,
    max_abandoned: usize,
}

impl Default for CallBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ABANDONED)
    }
}

impl CallBudget {
    pub fn new(max_abandoned: usize) -> Self {
        Self {
            abandoned: Arc::new(AtomicUsize::new(0)),
            max_abandoned,
        }
    }

    /// Calls that timed out and whose threads have not finished yet.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Run `f` on a worker thread named after `name`, waiting at most
    /// `timeout` for its result.
    pub fn call<T, F>(&self, name: &str, timeout: Duration, f: F) -> Result<T, BoundedCallError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let abandoned = self.abandoned();
        if abandoned >= self.max_abandoned {
            log::error!(
                "Refusing {}: {} earlier calls are still hanging",
                name,
                abandoned
            );
            return Err(BoundedCallError::Saturated(abandoned));
        }

        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Waiting),
            ready: Condvar::new(),
        });
        let finish = Finish {
            shared: shared.clone(),
            abandoned: self.abandoned.clone(),
            name: name.to_string(),
        };
        thread::Builder::new()
            .name(format!("call-{}", name))
            .spawn(move || {
                let finish = finish;
                let value = f();
                let mut slot = lock(&finish.shared.slot);
                if matches!(*slot, Slot::Waiting) {
                    *slot = Slot::Done(value);
                    finish.shared.ready.notify_all();
                }
            })
            .map_err(|e| BoundedCallError::Spawn(e.to_string()))?;

        let (mut slot, _) = shared
            .ready
            .wait_timeout_while(lock(&shared.slot), timeout, |s| matches!(s, Slot::Waiting))
            .unwrap_or_else(PoisonError::into_inner);

        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Done(value) => Ok(value),
            Slot::Panicked => Err(BoundedCallError::Panicked),
            _ => {
                *slot = Slot::Abandoned;
                let now_abandoned = self.abandoned.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "{} gave no answer within {:?}; {} abandoned call(s) still running",
                    name,
                    timeout,
                    now_abandoned
                );
                Err(BoundedCallError::TimedOut(timeout))
            }
        }
    }
}

enum Slot<T> {
    Waiting,
    Done(T),
    Panicked,
    Abandoned,
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

fn lock<T>(slot: &Mutex<Slot<T>>) -> MutexGuard<'_, Slot<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned by the worker thread; settles the slot however the callee exits.
struct Finish<T> {
    shared: Arc<Shared<T>>,
    abandoned: Arc<AtomicUsize>,
    name: String,
}

impl<T> Drop for Finish<T> {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared.slot);
        match *slot {
            // Unwinding out of the callee
            Slot::Waiting => {
                *slot = Slot::Panicked;
                self.shared.ready.notify_all();
            }
            Slot::Abandoned => {
                self.abandoned.fetch_sub(1, Ordering::SeqCst);
                log::info!("Abandoned call {} finally returned", self.name);
            }
            _ => {}
        }
    }
}

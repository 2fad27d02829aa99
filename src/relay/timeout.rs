//! Per-request deadlines
//!
//! Each armed request gets a one-shot Tokio task sleeping until its deadline.
//! Whether the expiry action or a matching response wins is decided by the
//! correlator, so the expiry action must tolerate the entry being gone.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{task::AbortHandle, time::Instant};
use tracing::debug;

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Debug, Default)]
struct Timers {
    next_generation: u64,
    armed: HashMap<String, ArmedTimer>,
}

#[derive(Debug, Clone, Default)]
pub struct TimeoutSupervisor {
    timers: Arc<Mutex<Timers>>,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `on_expiry` at `deadline`. Re-arming an id replaces its timer.
    pub fn arm<F>(&self, rewritten_id: String, deadline: Instant, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timers = self.lock();
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let registry = Arc::clone(&self.timers);
        let key = rewritten_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            {
                let mut timers = registry.lock().unwrap_or_else(PoisonError::into_inner);
                if timers
                    .armed
                    .get(&key)
                    .is_some_and(|armed| armed.generation == generation)
                {
                    timers.armed.remove(&key);
                }
            }

            debug!(rewritten_id = %key, "request deadline reached");
            on_expiry();
        });

        if let Some(previous) = timers.armed.insert(
            rewritten_id,
            ArmedTimer {
                generation,
                handle: task.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Returns whether a timer was armed for the id.
    pub fn disarm(&self, rewritten_id: &str) -> bool {
        match self.lock().armed.remove(rewritten_id) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&self) {
        let mut timers = self.lock();
        for (_, armed) in timers.armed.drain() {
            armed.handle.abort();
        }
    }

    pub fn armed_count(&self) -> usize {
        self.lock().armed.len()
    }

    fn lock(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

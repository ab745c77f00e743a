//! Minicron: a named thread that runs a job every `period` seconds.
//!
//! Period 0 pauses the job (the thread idles until the period changes or the
//! cron is shut down). Changing the period restarts the wait. Shutdown is
//! prompt: the thread waits on a condvar, not a sleep.

use anyhow::{Context, Result};
use log::warn;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::util::relock;

struct CronState {
    period_secs: u64,
    shutdown: bool,
    generation: u64,
}

struct CronShared {
    state: Mutex<CronState>,
    cond: Condvar,
}

pub struct Minicron {
    name: String,
    shared: Arc<CronShared>,
    handle: Option<JoinHandle<()>>,
}

impl Minicron {
    pub fn start<F>(name: &str, period_secs: u64, mut job: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let shared = Arc::new(CronShared {
            state: Mutex::new(CronState { period_secs, shutdown: false, generation: 0 }),
            cond: Condvar::new(),
        });
        let s = Arc::clone(&shared);
        let tname = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while wait_for_tick(&s) {
                    if let Err(e) = job() {
                        warn!("{}: periodic job failed: {:#}", tname, e);
                    }
                }
            })
            .with_context(|| format!("spawn cron thread {}", name))?;
        Ok(Self { name: name.to_string(), shared, handle: Some(handle) })
    }

    pub fn period_secs(&self) -> u64 {
        relock(self.shared.state.lock()).period_secs
    }

    pub fn change_period(&self, secs: u64) {
        let mut st = relock(self.shared.state.lock());
        st.period_secs = secs;
        st.generation += 1;
        self.shared.cond.notify_all();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the thread and wait for a job in progress to finish.
    pub fn shutdown(&mut self) {
        {
            let mut st = relock(self.shared.state.lock());
            st.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Minicron {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep one period. Returns false on shutdown.
fn wait_for_tick(s: &CronShared) -> bool {
    let mut st = relock(s.state.lock());
    'restart: loop {
        if st.shutdown {
            return false;
        }
        let gen = st.generation;
        if st.period_secs == 0 {
            while !st.shutdown && st.generation == gen {
                st = relock(s.cond.wait(st));
            }
            continue 'restart;
        }
        let deadline = Instant::now() + Duration::from_secs(st.period_secs);
        loop {
            if st.shutdown {
                return false;
            }
            if st.generation != gen {
                continue 'restart;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            st = relock(s.cond.wait_timeout(st, deadline - now)).0;
        }
    }
}

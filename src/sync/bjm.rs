//! Background job barrier.
//!
//! Counts in-flight background jobs against one owner (a cache file, the
//! clone writer of a checkpoint). `drain` stops accepting and waits for the
//! count to reach zero; `reset` re-opens the barrier.

use std::sync::{Condvar, Mutex};

use crate::util::relock;

#[derive(Debug)]
struct BarrierState {
    accepting: bool,
    count: u32,
}

#[derive(Debug)]
pub struct JobBarrier {
    state: Mutex<BarrierState>,
    idle: Condvar,
}

impl Default for JobBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState { accepting: true, count: 0 }),
            idle: Condvar::new(),
        }
    }

    /// Register a job. Returns false once draining has started.
    pub fn try_add(&self) -> bool {
        let mut st = relock(self.state.lock());
        if !st.accepting {
            return false;
        }
        st.count += 1;
        true
    }

    /// Job done.
    pub fn remove(&self) {
        let mut st = relock(self.state.lock());
        assert!(st.count > 0, "JobBarrier::remove without a matching add");
        st.count -= 1;
        if st.count == 0 && !st.accepting {
            self.idle.notify_all();
        }
    }

    /// Stop accepting and wait for all registered jobs.
    pub fn drain(&self) {
        let mut st = relock(self.state.lock());
        st.accepting = false;
        while st.count > 0 {
            st = relock(self.idle.wait(st));
        }
    }

    /// Accept jobs again. The barrier must be empty.
    pub fn reset(&self) {
        let mut st = relock(self.state.lock());
        assert_eq!(st.count, 0, "JobBarrier::reset with jobs in flight");
        st.accepting = true;
    }

    pub fn count(&self) -> u32 {
        relock(self.state.lock()).count
    }

    pub fn is_accepting(&self) -> bool {
        relock(self.state.lock()).accepting
    }
}

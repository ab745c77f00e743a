//! Fixed-size worker pool with a FIFO task queue.
//!
//! Mutex + Condvar очередь (как group-commit регистр WAL): submit() кладёт
//! задачу в хвост и будит одного воркера; shutdown() перестаёт принимать,
//! дожидается опустошения очереди и join'ит потоки.

use anyhow::{Context, Result};
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::util::relock;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    shutting_down: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

pub struct WorkerPool {
    name: String,
    queue: Arc<Queue>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `<name>-<i>`.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState { tasks: VecDeque::new(), shutting_down: false }),
            ready: Condvar::new(),
        });
        let mut handles = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let q = Arc::clone(&queue);
            let h = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(&q))
                .with_context(|| format!("spawn worker thread {}-{}", name, i))?;
            handles.push(h);
        }
        debug!("worker pool '{}' started with {} threads", name, handles.len());
        Ok(Self { name: name.to_string(), queue, handles: Mutex::new(handles) })
    }

    /// Enqueue a task. After shutdown the task is handed back unrun.
    pub fn submit<F>(&self, f: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = relock(self.queue.state.lock());
        if st.shutting_down {
            return Err(f);
        }
        st.tasks.push_back(Box::new(f));
        self.queue.ready.notify_one();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !relock(self.queue.state.lock()).shutting_down
    }

    pub fn queued(&self) -> usize {
        relock(self.queue.state.lock()).tasks.len()
    }

    /// Stop accepting, run what is queued, join the workers. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut st = relock(self.queue.state.lock());
            st.shutting_down = true;
            self.queue.ready.notify_all();
        }
        let handles: Vec<_> = relock(self.handles.lock()).drain(..).collect();
        let n = handles.len();
        for h in handles {
            let _ = h.join();
        }
        if n > 0 {
            debug!("worker pool '{}' stopped", self.name);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(q: &Queue) {
    loop {
        let task = {
            let mut st = relock(q.state.lock());
            loop {
                if let Some(t) = st.tasks.pop_front() {
                    break Some(t);
                }
                if st.shutting_down {
                    break None;
                }
                st = relock(q.ready.wait(st));
            }
        };
        match task {
            Some(t) => t(),
            None => return,
        }
    }
}

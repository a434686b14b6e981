// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deferred work.
//!
//! A single worker thread runs queued closures in order. Delayed items wait
//! for their deadline and can be cancelled until they start. Job completion
//! and job timeouts run here rather than in the interrupt handler.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use nvhost_common::{HostError, Result};
use parking_lot::{Condvar, Mutex};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Handle for cancelling delayed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelayedWorkId(u64);

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Work>,
    delayed: BTreeMap<(Instant, u64), Work>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
    busy: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
}

pub struct Workqueue {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Workqueue {
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker(&worker_shared))
            .map_err(|e| {
                log::error!("workqueue: failed to spawn {}: {}", name, e);
                HostError::ResourceExhausted("worker thread")
            })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            name: name.to_string(),
            shared,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self, work: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            log::warn!("workqueue: {} is shut down, dropping work", self.name);
            return;
        }
        state.ready.push_back(Box::new(work));
        self.shared.work.notify_one();
    }

    /// Run `work` once `delay` has elapsed.
    pub fn queue_delayed(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> DelayedWorkId {
        let mut state = self.shared.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        if state.shutdown {
            log::warn!("workqueue: {} is shut down, dropping delayed work", self.name);
            return DelayedWorkId(id);
        }
        let deadline = Instant::now() + delay;
        state.delayed.insert((deadline, id), Box::new(work));
        state.deadlines.insert(id, deadline);
        self.shared.work.notify_one();
        DelayedWorkId(id)
    }

    /// Cancel delayed work that has not started. Returns whether it was
    /// still pending.
    pub fn cancel_delayed(&self, id: DelayedWorkId) -> bool {
        let mut state = self.shared.state.lock();
        match state.deadlines.remove(&id.0) {
            Some(deadline) => state.delayed.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    pub fn pending_delayed(&self) -> usize {
        self.shared.state.lock().delayed.len()
    }

    /// Wait until all ready work has run. Does not wait for delayed work.
    pub fn flush(&self) {
        if thread::current().id() == self.thread_id {
            log::warn!("workqueue: {} flushed from its own worker", self.name);
            return;
        }
        let mut state = self.shared.state.lock();
        while !state.shutdown && (!state.ready.is_empty() || state.busy) {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Stop the worker after it drains ready work. Pending delayed work is
    /// dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.delayed.clear();
            state.deadlines.clear();
            self.shared.work.notify_all();
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("workqueue: {} worker panicked", self.name);
            }
        }
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        let now = Instant::now();
        while let Some(entry) = state.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), work) = entry.remove_entry();
            state.deadlines.remove(&id);
            state.ready.push_back(work);
        }

        if let Some(work) = state.ready.pop_front() {
            state.busy = true;
            parking_lot::MutexGuard::unlocked(&mut state, work);
            state.busy = false;
            continue;
        }

        shared.idle.notify_all();
        if state.shutdown {
            break;
        }
        match state.delayed.keys().next() {
            Some(&(deadline, _)) => {
                shared.work.wait_until(&mut state, deadline);
            }
            None => shared.work.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_queue_runs_in_order() {
        let wq = Workqueue::new("test-wq").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            wq.queue(move || log.lock().push(i));
        }
        wq.flush();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_delayed_work_fires() {
        let wq = Workqueue::new("test-wq").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let start = Instant::now();
        wq.queue_delayed(Duration::from_millis(30), move || {
            let _ = tx.send(Instant::now());
        });
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(30));
        assert_eq!(wq.pending_delayed(), 0);
    }

    #[test]
    fn test_cancel_delayed() {
        let wq = Workqueue::new("test-wq").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = wq.queue_delayed(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wq.cancel_delayed(id));
        assert!(!wq.cancel_delayed(id));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drains_ready_work() {
        let wq = Workqueue::new("test-wq").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            wq.queue(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        wq.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // Queueing after shutdown is ignored.
        wq.queue(|| panic!("must not run"));
    }
}

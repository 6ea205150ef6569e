/// Bounded groups of worker threads with join-one/join-all semantics.
use crate::dedupfs_lib::errors::{FsError, Result};
use log::*;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;

#[derive(Default)]
struct GroupState {
    active: usize,
    finished: u64,
    errors: Vec<FsError>,
}

/// A group of spawned threads, at most `max_threads` running at once.
/// `spawn` blocks while the group is at capacity, so callers must not
/// hold the global filesystem lock when calling it. Clones share the
/// same group.
#[derive(Clone)]
pub struct ThreadGroup {
    max_threads: usize,
    inner: Arc<(Mutex<GroupState>, Condvar)>,
}

impl ThreadGroup {
    pub fn new(max_threads: usize) -> Self {
        assert!(max_threads > 0);
        Self {
            max_threads,
            inner: Arc::new((Mutex::new(GroupState::default()), Condvar::new())),
        }
    }

    /// Start `task` on a new thread. `max_override` tightens the
    /// concurrency bound for this admission only.
    pub fn spawn<F>(&self, task: F, max_override: Option<usize>)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let limit = max_override.unwrap_or(self.max_threads).max(1);
        let (lock, cond) = &*self.inner;
        {
            let mut state = lock.lock();
            while state.active >= limit {
                cond.wait(&mut state);
            }
            state.active += 1;
        }
        let inner = self.inner.clone();
        thread::spawn(move || {
            let res = task();
            let (lock, cond) = &*inner;
            let mut state = lock.lock();
            state.active -= 1;
            state.finished += 1;
            if let Err(e) = res {
                debug!("worker thread failed: {}", e);
                state.errors.push(e);
            }
            cond.notify_all();
        });
    }

    /// Number of currently running threads.
    pub fn len(&self) -> usize {
        self.inner.0.lock().active
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until one more thread has finished. Returns immediately if
    /// the group is idle.
    pub fn join_one(&self) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock();
        if state.active == 0 {
            return;
        }
        let target = state.finished + 1;
        while state.finished < target && state.active > 0 {
            cond.wait(&mut state);
        }
    }

    /// Wait until the group is idle.
    pub fn join_all(&self) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock();
        while state.active > 0 {
            cond.wait(&mut state);
        }
    }

    /// Drain errors collected from finished threads.
    pub fn take_errors(&self) -> Vec<FsError> {
        std::mem::take(&mut self.inner.0.lock().errors)
    }
}

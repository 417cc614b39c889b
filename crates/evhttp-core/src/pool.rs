//! `WorkerPool`: a fixed set of worker threads draining one FIFO task queue.
//!
//! Spawns N OS threads at creation. `submit()` appends to a mutex-guarded
//! queue and wakes one worker; each worker pops and runs tasks outside the
//! lock. No dynamic scaling.
//!
//! Shutdown closes the queue to new tasks, wakes everyone, and joins the
//! threads. Workers only exit once the queue is empty, so every task that
//! was accepted by `submit()` runs before `shutdown()` returns.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error};

use crate::error::PoolError;

/// A unit of work run by exactly one worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    closed: bool,
}

/// Shared state between submitters and workers.
struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Tasks run outside the lock, so a poisoned guard still holds a
        // consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    total: usize,
}

impl WorkerPool {
    /// Create a pool with `n` workers (at least one).
    pub fn new(n: usize) -> io::Result<Self> {
        let n = n.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let pool = WorkerPool {
            shared,
            handles: Mutex::new(Vec::with_capacity(n)),
            total: n,
        };

        for worker_id in 0..n {
            let shared = Arc::clone(&pool.shared);
            // On error, dropping `pool` shuts down the workers already started.
            let handle = thread::Builder::new()
                .name(format!("evhttp-worker-{}", worker_id))
                .spawn(move || worker_loop(shared, worker_id))?;
            pool.lock_handles().push(handle);
        }

        Ok(pool)
    }

    /// Queue a task and wake one worker. Never blocks on task execution.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.queue.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
        Ok(())
    }

    pub fn total_workers(&self) -> usize {
        self.total
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop accepting tasks, let workers drain the queue, and join them.
    ///
    /// Idempotent. Must not be called from inside a task.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
        }
        self.shared.cond.notify_all();

        let handles = std::mem::take(&mut *self.lock_handles());
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread exited by panic");
            }
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread main loop.
fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    debug!(worker_id, "worker started");
    let mut state = shared.lock();
    loop {
        if let Some(task) = state.queue.pop_front() {
            drop(state);

            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!(worker_id, "task panicked");
            }

            state = shared.lock();
        } else if state.closed {
            break;
        } else {
            state = shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
    debug!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_all_tasks() {
        let pool = WorkerPool::new(4).unwrap();
        assert_eq!(pool.total_workers(), 4);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = counter.clone();
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let counter = Arc::new(AtomicUsize::new(0));

        // Block the only worker so the rest pile up in the queue.
        pool.submit(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        for _ in 0..10 {
            let c = counter.clone();
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        assert!(pool.is_closed());
        assert_eq!(pool.submit(|| {}), Err(PoolError::Closed));
        // Second shutdown is a no-op.
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(|| panic!("boom")).unwrap();
        pool.submit(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_each_task_runs_once() {
        let pool = WorkerPool::new(8).unwrap();
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..256).map(|_| AtomicUsize::new(0)).collect());
        for i in 0..256 {
            let hits = hits.clone();
            pool.submit(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }
}

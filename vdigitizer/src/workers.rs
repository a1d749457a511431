// Copyright 2024 vdigitizer Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-session worker pool
//!
//! One named worker thread per negotiated kernel buffer. The pool is created
//! after the stream starts and torn down before the stream stops; workers
//! never touch the device or its buffers. Each worker blocks on the stop
//! latch until the pool is shut down or the stop signal is set.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::device::SessionInfo;
use crate::stop::StopSignal;
use crate::{CaptureError, Result};

/// Lifecycle state reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Exited,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Private busy/idle pair of one worker
#[derive(Debug)]
struct WorkerSync {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl WorkerSync {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Starting),
            cond: Condvar::new(),
        }
    }

    fn set(&self, state: WorkerState) {
        *lock(&self.state) = state;
        self.cond.notify_all();
    }

    fn get(&self) -> WorkerState {
        *lock(&self.state)
    }
}

struct Worker {
    index: u32,
    sync: Arc<WorkerSync>,
    handle: Option<JoinHandle<()>>,
}

type WorkerBody = Box<dyn FnOnce() + Send>;

fn worker_main(
    index: u32,
    info: SessionInfo,
    shutdown: &AtomicBool,
    sync: &WorkerSync,
    stop: &StopSignal,
) {
    debug!(
        "Worker #{index} ready for {}x{} {} frames",
        info.width, info.height, info.format
    );
    sync.set(WorkerState::Idle);

    stop.wait_while(|| !shutdown.load(Ordering::Acquire));

    sync.set(WorkerState::Exited);
    debug!("Worker #{index} exited");
}

fn allocate<T>(n_workers: u32) -> Result<Vec<T>> {
    let mut workers = Vec::new();
    workers
        .try_reserve_exact(n_workers as usize)
        .map_err(|_| CaptureError::PoolAllocation(n_workers))?;
    Ok(workers)
}

/// Worker pool sized to one session's buffer count
pub struct WorkerPool {
    info: SessionInfo,
    shutdown: Arc<AtomicBool>,
    stop: StopSignal,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn one worker per buffer of the session.
    ///
    /// If a spawn fails, the workers started so far are torn down before the
    /// error is returned.
    pub fn spawn(info: SessionInfo, stop: &StopSignal) -> Result<Self> {
        Self::spawn_with(info, stop, |builder, body| builder.spawn(body))
    }

    fn spawn_with<S>(info: SessionInfo, stop: &StopSignal, mut spawner: S) -> Result<Self>
    where
        S: FnMut(thread::Builder, WorkerBody) -> io::Result<JoinHandle<()>>,
    {
        let n_workers = info.n_buffers;
        let mut pool = Self {
            info,
            shutdown: Arc::new(AtomicBool::new(false)),
            stop: stop.clone(),
            workers: allocate(n_workers)?,
        };

        info!("Spawning {n_workers} workers ...");
        for index in 0..n_workers {
            let sync = Arc::new(WorkerSync::new());
            let body: WorkerBody = Box::new({
                let shutdown = Arc::clone(&pool.shutdown);
                let sync = Arc::clone(&sync);
                let stop = stop.clone();
                move || worker_main(index, info, &shutdown, &sync, &stop)
            });
            let builder = thread::Builder::new().name(format!("vdigitizer-worker-{index}"));
            let handle = spawner(builder, body).map_err(|source| {
                error!("Can't spawn worker #{index}: {source}");
                CaptureError::WorkerSpawn { index, source }
            })?;

            pool.workers.push(Worker {
                index,
                sync,
                handle: Some(handle),
            });
        }

        Ok(pool)
    }

    /// Number of spawned workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Session parameters the workers were spawned for
    pub fn info(&self) -> SessionInfo {
        self.info
    }

    /// Current state of every worker, by index
    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|worker| worker.sync.get()).collect()
    }

    pub fn idle_count(&self) -> usize {
        self.states()
            .into_iter()
            .filter(|state| *state == WorkerState::Idle)
            .count()
    }

    /// Block until no worker is still starting, or `timeout` elapses.
    ///
    /// Returns `true` if every worker left the starting state in time.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for worker in &self.workers {
            let mut state = lock(&worker.sync.state);
            while *state == WorkerState::Starting {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                state = worker
                    .sync
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        true
    }

    /// Shut the pool down and join every worker.
    ///
    /// Calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        info!("Stopping {} workers ...", self.workers.len());
        self.shutdown.store(true, Ordering::Release);
        self.stop.wake_all();

        for mut worker in self.workers.drain(..) {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("Worker #{} panicked", worker.index);
                }
            }
        }
        info!("Workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

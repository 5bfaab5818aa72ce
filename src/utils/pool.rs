//! Bounded worker pool.
//!
//! Node creation, node start, configuration push, bridge wiring and node
//! close all fan out on one pool whose size caps the number of operations
//! in flight against the container runtime. A batch always runs every unit
//! to completion; the caller gets the first error in submission order.

use crate::errors::{NetemError, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

pub struct WorkerPool {
    pool: ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("netemu-worker-{}", idx))
            .build()
            .map_err(|e| NetemError::Config(format!("unable to build worker pool: {}", e)))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` on every item and collect every outcome, in item order.
    pub fn map_all<T, R, E, F>(&self, items: &[T], f: F) -> Vec<std::result::Result<R, E>>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> std::result::Result<R, E> + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(|item| f(item)).collect())
    }

    /// Run `f` on every item; return the first error once all are done.
    pub fn run_all<T, E, F>(&self, items: &[T], f: F) -> std::result::Result<(), E>
    where
        T: Sync,
        E: Send,
        F: Fn(&T) -> std::result::Result<(), E> + Sync + Send,
    {
        self.map_all(items, f).into_iter().collect()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

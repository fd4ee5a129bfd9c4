//! Process execution context: worker pool, node factory, environment lookup

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use log::{debug, error};

use crate::error::{raise, FlowError, Result};
use crate::nodes::factory::NodeFactory;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PendingTasks {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Fixed-size worker pool fed by a channel.
///
/// Tasks run to completion or failure; there is no cancellation.
struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<PendingTasks>,
}

impl ThreadPool {
    fn new(size: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let pending = Arc::new(PendingTasks {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });

        let workers = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                std::thread::Builder::new()
                    .name(format!("nodeflow-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!("worker {index}: computation panicked");
                            }
                            let mut count = pending.count.lock().unwrap();
                            *count -= 1;
                            if *count == 0 {
                                pending.drained.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            pending,
        }
    }

    fn execute(&self, job: Job) {
        *self.pending.count.lock().unwrap() += 1;
        self.sender
            .as_ref()
            .expect("pool is shut down")
            .send(job)
            .expect("worker channel closed");
    }

    fn wait(&self) {
        let mut count = self.pending.count.lock().unwrap();
        while *count > 0 {
            count = self.pending.drained.wait(count).unwrap();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Process-wide execution context.
///
/// Owns the worker pool used by `Graph::run` and exactly one `NodeFactory`.
/// Graphs and modules keep the environment alive through `Arc`, so its
/// resources are torn down only after the last dependent drops.
pub struct Env {
    factory: Arc<NodeFactory>,
    pool: ThreadPool,
}

impl Env {
    /// Create an environment with `max_threads` pool workers
    pub fn create(max_threads: usize) -> Result<Arc<Env>> {
        if max_threads == 0 {
            return Err(raise(FlowError::InvalidArgument(
                "max_threads must be positive".to_string(),
            )));
        }
        debug!("creating environment with {max_threads} worker threads");
        Ok(Arc::new(Env {
            factory: NodeFactory::with_builtins(),
            pool: ThreadPool::new(max_threads),
        }))
    }

    /// The environment's node factory
    pub fn factory(&self) -> Arc<NodeFactory> {
        Arc::clone(&self.factory)
    }

    /// Dispatch a task onto the worker pool
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.execute(Box::new(job));
    }

    /// Block until every computation dispatched through this environment
    /// has completed. Cancels nothing.
    pub fn wait(&self) {
        self.pool.wait();
    }

    /// Read-only process environment lookup
    pub fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(
            Env::create(0),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn wait_blocks_until_tasks_finish() {
        let env = Env::create(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let done = Arc::clone(&done);
            env.execute(move || {
                std::thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        env.wait();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn pool_survives_a_panicking_task() {
        let env = Env::create(1).unwrap();
        env.execute(|| panic!("boom"));
        env.wait();

        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        env.execute(move || {
            flag.store(1, Ordering::SeqCst);
        });
        env.wait();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn var_reads_process_environment() {
        let env = Env::create(1).unwrap();
        std::env::set_var("NODEFLOW_TEST_VAR", "present");
        assert_eq!(env.var("NODEFLOW_TEST_VAR").as_deref(), Some("present"));
        assert_eq!(env.var("NODEFLOW_TEST_VAR_MISSING"), None);
    }
}

use std::sync::Arc;

use crossbeam_channel::{Sender, unbounded};

use crate::error::ExecutorError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where goal continuations, compute steps and completion callbacks run.
///
/// There is no process-wide default: every goal receives its executor
/// explicitly at construction, so two graphs never contend over hidden
/// global state. The usual setup is one shared [`pool`](Self::pool) for the
/// whole graph, plus a [`serial`](Self::serial) executor for work that must
/// not run in parallel with itself.
pub struct Executor {
    inner: Inner,
}

enum Inner {
    Pool(rayon::ThreadPool),
    Serial(Sender<Job>),
}

impl Executor {
    /// A shared worker pool with `threads` workers. Passing `0` lets rayon
    /// pick one worker per core.
    ///
    /// A compute step may hold its worker while blocking on another goal
    /// (the cache wrapper does this when it recomputes after evicting a bad
    /// entry), so a pool of one thread can deadlock against itself. Size
    /// pools driving cached graphs with at least two workers.
    pub fn pool(threads: usize) -> Result<Arc<Self>, ExecutorError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("telos-worker-{i}"))
            .build()?;

        Ok(Arc::new(Self {
            inner: Inner::Pool(pool),
        }))
    }

    /// A dedicated single-thread executor for non-parallelizable work.
    ///
    /// The backing thread exits once the executor (and every pending job
    /// sender) is dropped.
    pub fn serial() -> Arc<Self> {
        let (tx, rx) = unbounded::<Job>();

        std::thread::Builder::new()
            .name("telos-serial".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("Failed to spawn serial executor thread");

        Arc::new(Self {
            inner: Inner::Serial(tx),
        })
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner {
            Inner::Pool(pool) => pool.spawn(job),
            Inner::Serial(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    tracing::warn!("Serial executor is shut down, job dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;

    #[test]
    fn test_pool_runs_jobs() {
        let executor = Executor::pool(2).unwrap();
        let (tx, rx) = channel();

        for i in 0..8 {
            let tx = tx.clone();
            executor.spawn(move || tx.send(i).unwrap());
        }

        let mut seen: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_preserves_order() {
        let executor = Executor::serial();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();

        for i in 0..16 {
            let counter = counter.clone();
            let tx = tx.clone();
            executor.spawn(move || {
                // Only one job may be in flight at a time on a serial
                // executor, so the counter ticks in submission order.
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                tx.send((i, seen)).unwrap();
            });
        }

        for _ in 0..16 {
            let (i, seen) = rx.recv().unwrap();
            assert_eq!(i, seen);
        }
    }
}

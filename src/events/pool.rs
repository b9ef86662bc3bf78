//! The zone event worker pool.
//!
//! A fixed set of threads drains a FIFO queue of tasks.  Every assigned
//! task runs at most once; ordering between distinct tasks is unspecified.
//! Per-zone ordering is not this pool's business; the per-zone event table
//! admits only one task per zone at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::trace;

//----------- Task -------------------------------------------------------------

/// A unit of work for the pool.
pub struct Task {
    run: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Construct a task from a closure.
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self { run: Box::new(run) }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}

//----------- WorkerPool -------------------------------------------------------

/// A fixed-size pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,

    /// The number of worker threads.
    size: usize,

    /// The worker threads, while running.
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct PoolInner {
    state: Mutex<PoolState>,

    /// Wakes workers on assign, resume and stop.
    work: Condvar,
}

#[derive(Debug)]
struct PoolState {
    queue: VecDeque<Task>,
    suspended: bool,
    stopped: bool,

    /// The number of tasks being run right now.
    ///
    /// Suspension and clearing affect only the queue; running tasks always
    /// complete.
    running: usize,
}

impl WorkerPool {
    /// Construct a pool of `size` workers.
    ///
    /// The workers do not run until [`WorkerPool::start`] is called.
    pub fn create(size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    suspended: false,
                    stopped: false,
                    running: 0,
                }),
                work: Condvar::new(),
            }),
            size: size.max(1),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Enqueue a task.
    ///
    /// The task runs exactly once, unless the queue is cleared or the pool
    /// is stopped before a worker picks it up.
    pub fn assign(&self, task: Task) {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(task);
        self.inner.work.notify_one();
    }

    /// Start the worker threads.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return;
        }
        self.inner.state.lock().unwrap().stopped = false;
        for index in 0..self.size {
            let inner = self.inner.clone();
            let thread = std::thread::Builder::new()
                .name(format!("worker#{index}"))
                .spawn(move || inner.work_loop())
                .expect("spawning a worker thread");
            threads.push(thread);
        }
    }

    /// Ask the workers to stop.
    ///
    /// Queued tasks are dropped; running tasks complete.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stopped = true;
        state.queue.clear();
        self.inner.work.notify_all();
    }

    /// Wait for the worker threads to finish.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            let _ = thread.join();
        }
    }

    /// Stop picking up queued tasks.
    ///
    /// Running tasks are unaffected.
    pub fn suspend(&self) {
        self.inner.state.lock().unwrap().suspended = true;
    }

    /// Resume picking up queued tasks.
    pub fn resume(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.suspended = false;
        self.inner.work.notify_all();
    }

    /// Drop all queued tasks.
    ///
    /// Tasks already being run are not cancelled.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            trace!("dropped {dropped} queued tasks");
        }
    }

    /// The number of queued and running tasks.
    pub fn load(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.queue.len(), state.running)
    }
}

impl PoolInner {
    fn work_loop(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                break;
            }
            if state.suspended || state.queue.is_empty() {
                state = self.work.wait(state).unwrap();
                continue;
            }

            let task = state.queue.pop_front().unwrap();
            state.running += 1;
            drop(state);

            (task.run)();

            state = self.state.lock().unwrap();
            state.running -= 1;
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_each_task_once() {
        let pool = WorkerPool::create(3);
        pool.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = count.clone();
            pool.assign(Task::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 50 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 50);

        pool.stop();
        pool.join();
    }

    #[test]
    fn suspend_holds_queue() {
        let pool = WorkerPool::create(1);
        pool.start();
        pool.suspend();

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            pool.assign(Task::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        pool.resume();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        pool.stop();
        pool.join();
    }

    #[test]
    fn clear_drops_queued_not_running() {
        let pool = WorkerPool::create(1);
        pool.start();

        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        // The first task occupies the only worker.
        {
            let started = started.clone();
            let finished = finished.clone();
            pool.assign(Task::new(move || {
                started.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Wait for it to start, then queue more and clear them.
        while started.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = count.clone();
            pool.assign(Task::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.clear();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        pool.stop();
        pool.join();
    }
}

//! Thread primitives: a blocking work queue, an in-flight counter and a
//! fixed pool of worker threads.

use std::fmt::{self, Debug};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

/// A unit of work for the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can start a named thread.
///
/// The pool only ever spawns through this trait, so tests and embedders can
/// substitute their own thread creation.
pub trait Spawn: Send + Sync {
    /// Start `job` on a new thread called `name`.
    fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

/// Spawns plain OS threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsThreads;

impl Spawn for OsThreads {
    fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new().name(name).spawn(job)
    }
}

/// A multi-producer, multi-consumer queue whose consumers sleep while it is
/// empty.
///
/// Items live in a lock-free `SegQueue`; the mutex only guards the sleep.
pub struct BlockingQueue<T> {
    items: SegQueue<T>,
    closed: AtomicBool,
    sleepers: Mutex<usize>,
    wake: Condvar,
}

impl<T> BlockingQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> BlockingQueue<T> {
        BlockingQueue {
            items: SegQueue::new(),
            closed: AtomicBool::new(false),
            sleepers: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    /// Add an item and wake one sleeping consumer.
    pub fn push(&self, item: T) {
        self.items.push(item);
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wake.notify_one();
        }
    }

    /// Take an item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Take an item, sleeping until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }

            let mut sleepers = self.sleepers.lock();
            // Re-check under the lock: a push between the pop above and here
            // would otherwise notify nobody.
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            *sleepers += 1;
            self.wake.wait(&mut sleepers);
            *sleepers -= 1;
        }
    }

    /// Stop accepting sleepers. Consumers drain what is left, then get `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _sleepers = self.sleepers.lock();
        self.wake.notify_all();
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

impl<T> Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<BlockingQueue {} items{}>", self.len(), if self.is_closed() { ", closed" } else { "" })
    }
}

/// Counts outstanding work and lets one thread wait for it to reach zero.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitGroup {
    /// Create a counter at zero.
    pub fn new() -> WaitGroup {
        WaitGroup::default()
    }

    /// Add `n` outstanding items.
    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Mark one item finished.
    pub fn done(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "WaitGroup::done called more often than add");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// The number of outstanding items.
    pub fn pending(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or `timeout` passes.
    ///
    /// Returns true if the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// A fixed set of long-lived worker threads fed from one `BlockingQueue`.
///
/// Dropping the pool closes the queue, lets the workers drain it and joins
/// them.
pub struct ThreadPool {
    queue: Arc<BlockingQueue<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Start `workers` threads named `{name}-{n}` through `spawner`.
    pub fn new(workers: usize, name: &str, spawner: &dyn Spawn) -> io::Result<ThreadPool> {
        let queue = Arc::new(BlockingQueue::<Job>::new());
        let mut pool = ThreadPool {
            queue,
            workers: Vec::with_capacity(workers),
        };

        for n in 0..workers.max(1) {
            let queue = pool.queue.clone();
            // On failure, dropping `pool` stops the threads already started.
            let handle = spawner.spawn(format!("{}-{}", name, n), Box::new(move || {
                while let Some(job) = queue.pop() {
                    job();
                }
            }))?;
            pool.workers.push(handle);
        }

        tracing::debug!(workers = pool.workers.len(), name, "started thread pool");
        Ok(pool)
    }

    /// The number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job for any worker.
    pub fn execute(&self, job: Job) {
        self.queue.push(job);
    }

    /// The shared job queue.
    pub fn queue(&self) -> &Arc<BlockingQueue<Job>> {
        &self.queue
    }

    /// Stop the pool and wait for every worker to exit.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ThreadPool {} workers>", self.workers.len())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_queue_close_drains() {
        let queue = BlockingQueue::new();
        queue.push(1);
        queue.push(2);
        queue.close();

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_queue_wakes_sleeper() {
        let queue = Arc::new(BlockingQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.push(7u32);
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn test_wait_group() {
        let wait = Arc::new(WaitGroup::new());
        wait.add(3);
        assert!(!wait.wait_timeout(Duration::from_millis(5)));

        let threads: Vec<_> = (0..3).map(|_| {
            let wait = wait.clone();
            std::thread::spawn(move || wait.done())
        }).collect();

        wait.wait();
        assert_eq!(wait.pending(), 0);
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_pool_runs_jobs() {
        let pool = ThreadPool::new(4, "test", &OsThreads).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let wait = Arc::new(WaitGroup::new());

        wait.add(100);
        for _ in 0..100 {
            let done = done.clone();
            let wait = wait.clone();
            pool.execute(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
                wait.done();
            }));
        }

        wait.wait();
        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert_eq!(pool.workers(), 4);
        pool.join();
    }

    struct CountingSpawner(AtomicUsize);

    impl Spawn for CountingSpawner {
        fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            OsThreads.spawn(name, job)
        }
    }

    #[test]
    fn test_custom_spawner() {
        let spawner = CountingSpawner(AtomicUsize::new(0));
        let pool = ThreadPool::new(0, "one", &spawner).unwrap();
        assert_eq!(spawner.0.load(Ordering::SeqCst), 1);
        drop(pool);
    }
}

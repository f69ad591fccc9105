//! A thread-pool task executor for parallel system and chunk execution.
//!
//! Tasks can be submitted from any thread and are executed by worker threads
//! in FIFO order; completion order is non-deterministic. The [`Scope`] API
//! lets callers spawn tasks borrowing stack data, joining on all of them
//! before the scope ends. That join is the scheduler's only blocking point.

use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use crossbeam::channel::{Receiver, Sender, unbounded};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Task(Task),
    Shutdown,
}

thread_local! {
    /// Set while the current thread is one of an executor's workers. Used to
    /// keep nested parallel iteration from joining on the pool it runs on.
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is an executor worker.
#[inline]
pub fn on_worker() -> bool {
    ON_WORKER.with(|flag| flag.get())
}

/// A concurrent task executor based on a thread pool.
pub struct Executor {
    sender: Sender<Message>,
    workers: Vec<Worker>,
}

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
}

impl Executor {
    /// Creates a new executor with the specified number of worker threads.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool size must be greater than 0");

        let (sender, receiver) = unbounded();
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            workers.push(Worker::new(id, receiver.clone()));
        }

        Executor { sender, workers }
    }

    /// Creates a single-threaded executor.
    pub fn single_threaded() -> Self {
        Self::new(1)
    }

    /// Returns the number of worker threads in the pool.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Executes a fire-and-forget task on the pool.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Message::Task(Box::new(f)))
            .expect("executor channel closed");
    }

    /// Spawns a task and returns a future that resolves to the task's result.
    /// The caller can block on the [`TaskFuture`] to join it.
    pub fn spawn<F, T>(&self, f: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.execute(move || {
            let result = f();
            let _ = tx.send(result);
        });
        TaskFuture { receiver: rx }
    }

    /// Dispatch `f` over every index in `[begin, end)` on the pool, blocking
    /// until the whole range has been processed. The general-purpose entry
    /// point for hosts that bring their own work decomposition.
    pub fn spawn_range(&self, begin: usize, end: usize, f: impl Fn(usize) + Send + Sync) {
        let f = &f;
        self.scope(|scope| {
            for index in begin..end {
                scope.spawn(move || f(index));
            }
        });
    }

    /// Creates a scope for spawning tasks that borrow non-`'static` data.
    /// Every task spawned in the scope completes before `scope` returns.
    ///
    /// # Example
    /// ```ignore
    /// let results: Vec<AtomicU32> = ...;
    /// executor.scope(|s| {
    ///     for r in &results {
    ///         s.spawn(|| { r.fetch_add(1, Ordering::Relaxed); });
    ///     }
    /// });
    /// // All tasks guaranteed complete here.
    /// ```
    pub fn scope<'env, F, R>(&'env self, f: F) -> R
    where
        F: FnOnce(&Scope<'env>) -> R,
    {
        let scope = Scope {
            executor: self,
            pending: Arc::new(Pending::default()),
            _phantom: PhantomData,
        };
        f(&scope)
        // Scope's Drop joins on all spawned tasks.
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Message::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Worker {
    fn new(id: usize, receiver: Receiver<Message>) -> Self {
        let handle = thread::Builder::new()
            .name(format!("quarry-worker-{id}"))
            .spawn(move || {
                ON_WORKER.with(|flag| flag.set(true));
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Task(task) => task(),
                        Message::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn worker thread");
        Self {
            handle: Some(handle),
        }
    }
}

/// Join-counter shared between a scope and its spawned tasks.
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    lock: Mutex<()>,
    done: Condvar,
}

impl Pending {
    fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.lock.lock().unwrap();
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.count.load(Ordering::SeqCst) != 0 {
            guard = self.done.wait(guard).unwrap();
        }
        drop(guard);
    }
}

/// A scope for spawning tasks that can borrow data from the environment.
/// All tasks spawned within the scope complete before the scope ends.
pub struct Scope<'env> {
    executor: &'env Executor,
    pending: Arc<Pending>,
    _phantom: PhantomData<std::cell::Cell<&'env ()>>,
}

impl<'env> Scope<'env> {
    /// Spawns a scoped task that can access data from the environment.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'env,
    {
        self.pending.increment();
        let pending = Arc::clone(&self.pending);
        let task: Box<dyn FnOnce() + Send + 'env> = Box::new(move || {
            f();
            pending.decrement();
        });
        // SAFETY: the transmute erases the 'env lifetime for storage in the
        // executor's 'static channel. This is sound because Scope's Drop
        // blocks until the pending count reaches zero, so no task outlives
        // the borrows it captured.
        let static_task: Box<dyn FnOnce() + Send + 'static> = unsafe { std::mem::transmute(task) };
        self.executor
            .sender
            .send(Message::Task(static_task))
            .expect("executor channel closed");
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        // Join on every spawned task. The counter, not per-worker markers,
        // defines completion: a task still executing holds the count up even
        // after the queue has drained.
        self.pending.wait();
    }
}

/// A handle to a task's eventual result.
pub struct TaskFuture<T> {
    receiver: Receiver<T>,
}

impl<T> TaskFuture<T> {
    /// Block until the task completes and return its result.
    pub fn wait(self) -> T {
        self.receiver.recv().expect("task dropped without result")
    }

    /// Poll for the result without blocking.
    pub fn try_wait(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// A frame-scoped cooperative cancellation token.
///
/// The scheduler hands the token to systems through their state; long-running
/// work should poll it and return early when requested. Parallel chunk
/// iteration polls it between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clear the token for the next frame.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

//! The scheduler: a worker pool plus the per-frame state machine.
//!
//! ```
//! use std::sync::Arc;
//! use taskgraph_ecs::{Read, Scheduler, SchedulerConfig, Store, Task, TypeRegistry, Write};
//!
//! #[derive(Debug, Clone, Copy, Default)]
//! struct Position(f32);
//! #[derive(Debug, Clone, Copy, Default)]
//! struct Velocity(f32);
//!
//! let registry = Arc::new(TypeRegistry::new());
//! registry.register::<Position>("position").unwrap();
//! registry.register::<Velocity>("velocity").unwrap();
//! registry.seal();
//!
//! let mut store = Store::new(registry.clone()).unwrap();
//! let e = store.create_entity();
//! store.add_component(e, Position(0.0)).unwrap();
//! store.add_component(e, Velocity(1.5)).unwrap();
//!
//! let scheduler = Scheduler::new(registry, SchedulerConfig::default().with_workers(2)).unwrap();
//! let mut frame = scheduler.frame();
//! frame.submit(Task::new("move", |ctx| {
//!     ctx.query::<(Write<Position>, Read<Velocity>)>()?
//!         .for_each(|_, (p, v)| p.0 += v.0);
//!     Ok(())
//! }).read::<Velocity>().write::<Position>()).unwrap();
//!
//! let report = scheduler.run(&mut store, frame).unwrap();
//! assert!(report.is_success());
//! assert_eq!(store.get::<Position>(e).unwrap().0, 1.5);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::component::TypeRegistry;
use crate::config::SchedulerConfig;
use crate::error::{GraphError, SchedulerError};
use crate::executor::{self, FrameObserver, FrameReport, RunSettings};
use crate::graph::{Frame, TaskGraph};
use crate::store::Store;
use crate::thread::{OsThreads, Spawn, ThreadPool};

/// Where the scheduler is in its frame cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// No frame has been built yet.
    Idle,
    /// A graph has been built and not yet run.
    GraphBuilt,
    /// A frame is executing.
    Running,
    /// The last frame has finished; its writes are visible.
    Drained,
}

impl FrameState {
    fn from_u8(value: u8) -> FrameState {
        match value {
            1 => FrameState::GraphBuilt,
            2 => FrameState::Running,
            3 => FrameState::Drained,
            _ => FrameState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FrameState::Idle => 0,
            FrameState::GraphBuilt => 1,
            FrameState::Running => 2,
            FrameState::Drained => 3,
        }
    }
}

/// Stops a frame from starting any more tasks.
///
/// Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Cancel. Tasks already running are not interrupted.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once `cancel` has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs frames of tasks on a fixed pool of worker threads.
pub struct Scheduler {
    registry: Arc<TypeRegistry>,
    config: SchedulerConfig,
    pool: ThreadPool,
    state: AtomicU8,
    frames: AtomicU64,
    cancel: Mutex<CancelToken>,
    observer: Option<Arc<dyn FrameObserver>>,
}

impl Scheduler {
    /// Create a scheduler running on plain OS threads.
    pub fn new(registry: Arc<TypeRegistry>, config: SchedulerConfig) -> Result<Scheduler, SchedulerError> {
        Scheduler::with_spawner(registry, config, &OsThreads)
    }

    /// Create a scheduler whose workers are started through `spawner`.
    pub fn with_spawner(registry: Arc<TypeRegistry>, config: SchedulerConfig, spawner: &dyn Spawn) -> Result<Scheduler, SchedulerError> {
        if !registry.is_sealed() {
            return Err(SchedulerError::RegistryNotSealed);
        }

        let pool = ThreadPool::new(config.worker_count(), &config.thread_name, spawner)?;
        Ok(Scheduler {
            registry,
            config,
            pool,
            state: AtomicU8::new(FrameState::Idle.as_u8()),
            frames: AtomicU64::new(0),
            cancel: Mutex::new(CancelToken::new()),
            observer: None,
        })
    }

    /// Install hooks called around every task and frame.
    pub fn set_observer(&mut self, observer: Arc<dyn FrameObserver>) {
        self.observer = Some(observer);
    }

    /// The registry tasks are resolved against.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The configuration the scheduler was created with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The number of worker threads.
    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// The current frame state.
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The number of frames started so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// The token cancelling the running frame, or the next one if none is
    /// running.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.lock().clone()
    }

    /// Cancel the running frame, or the next one if none is running.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Start an empty frame.
    pub fn frame<'a>(&self) -> Frame<'a> {
        Frame::new(self.registry.clone())
    }

    /// Build a frame's graph with the configured hint policy.
    pub fn build<'a>(&self, frame: Frame<'a>) -> Result<TaskGraph<'a>, SchedulerError> {
        if !Arc::ptr_eq(frame.registry(), &self.registry) {
            return Err(GraphError::ForeignRegistry.into());
        }

        let graph = frame.build(self.config.hint_policy)?;
        // A running frame keeps its state; building the next graph is fine.
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
            if state == FrameState::Running.as_u8() {
                None
            } else {
                Some(FrameState::GraphBuilt.as_u8())
            }
        });
        Ok(graph)
    }

    /// Build and run a frame, returning once every task has finished or
    /// been skipped.
    pub fn run<'a>(&self, store: &'a mut Store, frame: Frame<'a>) -> Result<FrameReport, SchedulerError> {
        let graph = self.build(frame)?;
        self.run_graph(store, graph)
    }

    /// Run a graph built by `build`.
    ///
    /// The store is borrowed mutably for the whole frame, so task bodies
    /// can only reach it through their `TaskContext`.
    pub fn run_graph<'a>(&self, store: &'a mut Store, graph: TaskGraph<'a>) -> Result<FrameReport, SchedulerError> {
        if !Arc::ptr_eq(graph.registry(), &self.registry) || !Arc::ptr_eq(store.registry(), &self.registry) {
            return Err(GraphError::ForeignRegistry.into());
        }

        if self.state.swap(FrameState::Running.as_u8(), Ordering::AcqRel) == FrameState::Running.as_u8() {
            return Err(SchedulerError::FrameInProgress);
        }

        let frame = self.frames.fetch_add(1, Ordering::AcqRel);
        let cancel = self.cancel_token();
        tracing::debug!(frame, tasks = graph.len(), edges = graph.edge_count(), "frame started");

        let report = executor::execute(self.pool.queue(), store, graph, RunSettings {
            frame,
            cancel,
            access_checks: self.config.access_checks,
            stall_warning: self.config.stall_warning(),
            observer: self.observer.clone(),
        });

        *self.cancel.lock() = CancelToken::new();
        self.state.store(FrameState::Drained.as_u8(), Ordering::Release);
        tracing::debug!(
            frame,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            elapsed = ?report.elapsed,
            "frame drained"
        );
        Ok(report)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Scheduler {} workers, {:?}, {} frames>", self.workers(), self.state(), self.frame_count())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use crate::error::FailureKind;
    use crate::task::Task;

    use super::*;

    #[derive(Debug, Default)]
    struct Counter(u32);

    fn setup() -> (Arc<TypeRegistry>, Store) {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<Counter>("counter").unwrap();
        registry.seal();
        let store = Store::new(registry.clone()).unwrap();
        (registry, store)
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_workers(4)
            .with_access_checks(true)
            .with_stall_warning(None)
    }

    #[test]
    fn test_requires_sealed_registry() {
        let registry = Arc::new(TypeRegistry::new());
        assert!(matches!(Scheduler::new(registry, config()), Err(SchedulerError::RegistryNotSealed)));
    }

    #[test]
    fn test_state_machine() {
        let (registry, mut store) = setup();
        let scheduler = Scheduler::new(registry, config()).unwrap();
        assert_eq!(scheduler.state(), FrameState::Idle);

        let graph = scheduler.build(scheduler.frame()).unwrap();
        assert_eq!(scheduler.state(), FrameState::GraphBuilt);

        let report = scheduler.run_graph(&mut store, graph).unwrap();
        assert_eq!(scheduler.state(), FrameState::Drained);
        assert_eq!(report.task_count(), 0);
        assert_eq!(scheduler.frame_count(), 1);
    }

    #[test]
    fn test_failure_skips_dependents() {
        let (registry, mut store) = setup();
        let scheduler = Scheduler::new(registry, config()).unwrap();
        let ran = AtomicUsize::new(0);

        let mut frame = scheduler.frame();
        let bad = frame.submit(Task::new("bad", |_| anyhow::bail!("broken")).write::<Counter>()).unwrap();
        frame.submit(Task::new("after-bad", |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).read::<Counter>()).unwrap();
        frame.submit(Task::new("sibling", |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })).unwrap();
        frame.submit(Task::new("panics", |_| panic!("kaboom"))).unwrap();

        let report = scheduler.run(&mut store, frame).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(report.succeeded, vec!["sibling".to_owned()]);
        assert_eq!(report.skipped, vec!["after-bad".to_owned()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].task, bad);
        assert_eq!(report.failed[0].message, "broken");
        assert_eq!(report.failed[1].kind, FailureKind::Panic);
        assert_eq!(report.failed[1].message, "kaboom");
    }

    #[test]
    fn test_cancel_before_start() {
        let (registry, mut store) = setup();
        let scheduler = Scheduler::new(registry, config()).unwrap();
        let mut frame = scheduler.frame();
        frame.submit(Task::new("never", |_| Ok(()))).unwrap();

        scheduler.cancel();
        let report = scheduler.run(&mut store, frame).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.skipped, vec!["never".to_owned()]);

        // The next frame gets a fresh token.
        assert!(!scheduler.cancel_token().is_cancelled());
    }

    #[test]
    fn test_foreign_registry() {
        let (registry, mut store) = setup();
        let scheduler = Scheduler::new(registry, config()).unwrap();

        let other = Arc::new(TypeRegistry::new());
        other.seal();
        let frame = Frame::new(other);
        assert!(matches!(
            scheduler.run(&mut store, frame),
            Err(SchedulerError::Graph(GraphError::ForeignRegistry))
        ));
    }
}

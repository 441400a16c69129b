//! Running one task graph on the worker pool.
//!
//! Every node carries a counter of unfinished predecessors. Roots are queued
//! straight away; a worker that finishes a task decrements each successor's
//! counter and queues the ones that reach zero. A task that fails does not
//! release its successors, so they, and everything behind them, are
//! reported as skipped.
//!
//! A node also counts its open shares: one for its own body plus one per
//! extension it queued. Successors are released only once every share is
//! retired. Deferred tasks are collected while the graph runs and started
//! in waves each time the frame drains.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::access::Access;
use crate::error::{FailureKind, FrameError, TaskFailure};
use crate::graph::{conflict_edges, Node, Resolved, TaskGraph};
use crate::guard::AccessGuard;
use crate::scheduler::CancelToken;
use crate::store::{Scope, Store};
use crate::task::{Body, FollowUps, TaskContext, TaskId};
use crate::thread::{BlockingQueue, Job, WaitGroup};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const SUCCEEDED: u8 = 2;
const FAILED: u8 = 3;
const SKIPPED: u8 = 4;

/// Hooks called around task and frame execution.
///
/// Task hooks run on the worker thread executing the task. Every method
/// does nothing by default.
pub trait FrameObserver: Send + Sync {
    /// A task is about to run.
    fn task_started(&self, _frame: u64, _task: TaskId, _name: &str) {}

    /// A task has finished, successfully or not.
    fn task_finished(&self, _frame: u64, _task: TaskId, _name: &str, _elapsed: Duration, _failure: Option<&TaskFailure>) {}

    /// Every task of the frame has finished or been skipped.
    fn frame_finished(&self, _report: &FrameReport) {}
}

/// The outcome of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// The frame number.
    pub frame: u64,
    /// Names of the tasks that completed, in `TaskId` order.
    pub succeeded: Vec<String>,
    /// Tasks whose body returned an error or panicked, in `TaskId` order.
    pub failed: Vec<TaskFailure>,
    /// Names of the tasks that never ran, in `TaskId` order.
    pub skipped: Vec<String>,
    /// Whether the frame was cancelled.
    pub cancelled: bool,
    /// Wall time from the first task being queued to the frame draining.
    pub elapsed: Duration,
}

impl FrameReport {
    /// Returns true if every task ran and succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// The number of tasks in the frame.
    pub fn task_count(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// Turn an unsuccessful report into an error.
    pub fn into_result(self) -> Result<FrameReport, FrameError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FrameError {
                frame: self.frame,
                failures: self.failed,
                skipped: self.skipped,
            })
        }
    }
}

/// Per-frame settings handed down by the scheduler.
pub(crate) struct RunSettings {
    pub frame: u64,
    pub cancel: CancelToken,
    pub access_checks: bool,
    pub stall_warning: Option<Duration>,
    pub observer: Option<Arc<dyn FrameObserver>>,
}

struct NodeRun {
    name: String,
    access: Access,
    body: Mutex<Option<Body<'static>>>,
    successors: Vec<usize>,
    parent: Option<usize>,
    remaining: AtomicUsize,
    open: AtomicUsize,
    status: AtomicU8,
}

impl NodeRun {
    fn new(name: String, access: Access, body: Body<'static>, successors: Vec<usize>, predecessors: usize, parent: Option<usize>) -> NodeRun {
        NodeRun {
            name,
            access,
            body: Mutex::new(Some(body)),
            successors,
            parent,
            remaining: AtomicUsize::new(predecessors),
            open: AtomicUsize::new(1),
            status: AtomicU8::new(PENDING),
        }
    }
}

struct FrameRun {
    frame: u64,
    store: &'static Store,
    component_types: usize,
    nodes: RwLock<Vec<Arc<NodeRun>>>,
    cancel: CancelToken,
    guard: Option<AccessGuard>,
    observer: Option<Arc<dyn FrameObserver>>,
    queue: Arc<BlockingQueue<Job>>,
    wait: Arc<WaitGroup>,
    failures: Mutex<Vec<TaskFailure>>,
    deferred: Mutex<Vec<(usize, Vec<Resolved<'static>>)>>,
    finished: AtomicUsize,
}

/// Waits for the frame's jobs even if the waiting thread unwinds, so no
/// worker can outlive the borrows handed to it.
struct Drain<'r>(&'r WaitGroup);

impl<'r> Drop for Drain<'r> {
    fn drop(&mut self) {
        self.0.wait();
    }
}

/// Run `graph` against `store` on the workers behind `queue`, returning once
/// every task, including extensions and deferred tasks, has finished or been
/// skipped.
pub(crate) fn execute<'a>(
    queue: &Arc<BlockingQueue<Job>>,
    store: &'a Store,
    graph: TaskGraph<'a>,
    settings: RunSettings,
) -> FrameReport {
    let started = Instant::now();
    let component_types = graph.registry().len();

    // SAFETY: the workers see the store and the bodies as 'static. This
    // function does not return, nor unwind, before the wait group drains for
    // the last time, which happens only after the last job has stopped
    // touching either. Bodies that never ran are dropped below on this
    // thread.
    let store: &'static Store = unsafe { std::mem::transmute::<&'a Store, &'static Store>(store) };
    let nodes: Vec<Arc<NodeRun>> = graph.into_nodes()
        .into_iter()
        .map(|node: Node<'a>| {
            let body = unsafe { std::mem::transmute::<Body<'a>, Body<'static>>(node.body) };
            Arc::new(NodeRun::new(node.name, node.access, body, node.successors, node.predecessors.len(), None))
        })
        .collect();

    let roots: Vec<usize> = nodes.iter()
        .enumerate()
        .filter(|(_, node)| node.remaining.load(Ordering::Relaxed) == 0)
        .map(|(idx, _)| idx)
        .collect();

    let run = Arc::new(FrameRun {
        frame: settings.frame,
        store,
        component_types,
        nodes: RwLock::new(nodes),
        cancel: settings.cancel,
        guard: if settings.access_checks { Some(AccessGuard::new(component_types)) } else { None },
        observer: settings.observer,
        queue: queue.clone(),
        wait: Arc::new(WaitGroup::new()),
        failures: Mutex::new(Vec::new()),
        deferred: Mutex::new(Vec::new()),
        finished: AtomicUsize::new(0),
    });

    {
        let drain = Drain(&run.wait);
        run.start(roots);

        loop {
            run.settle(settings.stall_warning);

            let mut waves = std::mem::take(&mut *run.deferred.lock());
            if waves.is_empty() {
                break;
            }

            // Stable, so each task's deferrals keep their order.
            waves.sort_by_key(|(parent, _)| *parent);
            let tasks: Vec<Resolved<'static>> = waves.into_iter()
                .flat_map(|(_, tasks)| tasks)
                .collect();

            if run.cancel.is_cancelled() {
                run.append_skipped(tasks);
                break;
            }

            tracing::debug!(frame = run.frame, tasks = tasks.len(), "running deferred tasks");
            let ready = run.append(tasks, None);
            run.start(ready);
        }
        drop(drain);
    }

    for node in run.nodes.read().iter() {
        drop(node.body.lock().take());
    }

    let report = run.report(started.elapsed());
    if let Some(observer) = &run.observer {
        observer.frame_finished(&report);
    }
    report
}

fn schedule(run: &Arc<FrameRun>, idx: usize) {
    let job_run = run.clone();
    run.queue.push(Box::new(move || {
        let wait = job_run.wait.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job_run.run_node(idx))) {
            job_run.abandon(idx, &*payload);
        }
        drop(job_run);
        wait.done();
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_owned()
    }
}

impl FrameRun {
    fn node(&self, idx: usize) -> Arc<NodeRun> {
        self.nodes.read()[idx].clone()
    }

    fn start(self: &Arc<Self>, ready: Vec<usize>) {
        self.wait.add(ready.len());
        for idx in ready {
            schedule(self, idx);
        }
    }

    /// Block until nothing is queued or running, warning whenever no task
    /// finishes within `stall_warning`.
    fn settle(&self, stall_warning: Option<Duration>) {
        let interval = match stall_warning {
            Some(interval) => interval,
            None => return self.wait.wait(),
        };

        let mut last = self.finished.load(Ordering::Acquire);
        while !self.wait.wait_timeout(interval) {
            let now = self.finished.load(Ordering::Acquire);
            if now == last {
                tracing::warn!(
                    frame = self.frame,
                    running = ?self.running(),
                    "no task finished within {:?}", interval
                );
            }
            last = now;
        }
    }

    /// Add `tasks` as new nodes, ordered among themselves by their access in
    /// the order given. Returns the ones that are ready to run.
    fn append(&self, tasks: Vec<Resolved<'static>>, parent: Option<usize>) -> Vec<usize> {
        let edges = conflict_edges(tasks.iter().map(|task| &task.access), self.component_types);
        let mut successors = vec![Vec::new(); tasks.len()];
        let mut predecessors = vec![0; tasks.len()];
        for (from, to) in edges {
            successors[from].push(to);
            predecessors[to] += 1;
        }

        let mut nodes = self.nodes.write();
        let base = nodes.len();
        let mut ready = Vec::new();
        for (offset, (task, successors)) in tasks.into_iter().zip(successors).enumerate() {
            if predecessors[offset] == 0 {
                ready.push(base + offset);
            }
            let successors = successors.into_iter().map(|s| base + s).collect();
            nodes.push(Arc::new(NodeRun::new(task.name, task.access, task.body, successors, predecessors[offset], parent)));
        }
        ready
    }

    /// Record tasks that will never run.
    fn append_skipped(&self, tasks: Vec<Resolved<'static>>) {
        let mut nodes = self.nodes.write();
        for task in tasks {
            let node = NodeRun::new(task.name, task.access, task.body, Vec::new(), 0, None);
            node.status.store(SKIPPED, Ordering::Release);
            nodes.push(Arc::new(node));
        }
    }

    fn run_node(self: &Arc<Self>, idx: usize) {
        let node = self.node(idx);
        if self.cancel.is_cancelled() {
            node.status.store(SKIPPED, Ordering::Release);
            return;
        }

        let body = match node.body.lock().take() {
            Some(body) => body,
            None => return,
        };

        let task = TaskId(idx);
        let span = tracing::trace_span!("task", frame = self.frame, name = %node.name);
        let _enter = span.enter();

        node.status.store(RUNNING, Ordering::Release);
        let started = Instant::now();
        let (outcome, follow_ups) = self.invoke(idx, &node, body);
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                node.status.store(SUCCEEDED, Ordering::Release);
                self.notify_finished(task, &node.name, elapsed, None);
                self.finished.fetch_add(1, Ordering::AcqRel);

                let FollowUps { extended, deferred } = follow_ups;
                if !deferred.is_empty() {
                    self.deferred.lock().push((idx, deferred));
                }
                if !extended.is_empty() {
                    tracing::trace!(frame = self.frame, task = %node.name, extensions = extended.len(), "extending task");
                    node.open.fetch_add(extended.len(), Ordering::AcqRel);
                    let ready = self.append(extended, Some(idx));
                    self.start(ready);
                }
                self.complete(idx);
            }
            Err(failure) => {
                tracing::warn!(frame = self.frame, task = %node.name, kind = ?failure.kind, "task failed: {}", failure.message);
                node.status.store(FAILED, Ordering::Release);
                self.notify_finished(task, &node.name, elapsed, Some(&failure));
                self.failures.lock().push(failure);
                self.finished.fetch_add(1, Ordering::AcqRel);

                if !follow_ups.is_empty() {
                    self.append_skipped(follow_ups.extended.into_iter().chain(follow_ups.deferred).collect());
                }
            }
        }
    }

    /// Retire one share of a node. When its last share goes, its successors
    /// are released and its parent loses a share in turn.
    fn complete(self: &Arc<Self>, idx: usize) {
        let mut idx = idx;
        loop {
            let node = self.node(idx);
            if node.open.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }

            for succ in &node.successors {
                if self.node(*succ).remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.start(vec![*succ]);
                }
            }

            match node.parent {
                Some(parent) => idx = parent,
                None => return,
            }
        }
    }

    fn invoke(&self, idx: usize, node: &NodeRun, body: Body<'static>) -> (Result<(), TaskFailure>, FollowUps) {
        let task = TaskId(idx);
        let failure = |kind, message| TaskFailure {
            task,
            name: node.name.clone(),
            kind,
            message,
        };

        let _claim = match &self.guard {
            Some(guard) => match guard.claim(&node.access) {
                Ok(claim) => Some(claim),
                Err(component) => {
                    let component = self.store.registry().name_of(component);
                    let failure = failure(
                        FailureKind::Error,
                        format!("access to `{}` overlaps another running task", component),
                    );
                    return (Err(failure), FollowUps::default());
                }
            },
            None => None,
        };

        let scope = Scope::restricted(self.store, &node.name, &node.access);
        let mut ctx = TaskContext::new(scope, task, &node.name, &node.access, self.frame, &self.cancel);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(observer) = &self.observer {
                observer.task_started(self.frame, task, &node.name);
            }
            body(&mut ctx)
        }));

        let outcome = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(failure(FailureKind::Error, format!("{:#}", err))),
            Err(payload) => Err(failure(FailureKind::Panic, panic_message(&*payload))),
        };
        (outcome, ctx.into_follow_ups())
    }

    fn notify_finished(&self, task: TaskId, name: &str, elapsed: Duration, failure: Option<&TaskFailure>) {
        let observer = match &self.observer {
            Some(observer) => observer,
            None => return,
        };

        let notified = panic::catch_unwind(AssertUnwindSafe(|| {
            observer.task_finished(self.frame, task, name, elapsed, failure)
        }));
        if let Err(payload) = notified {
            tracing::error!(frame = self.frame, task = %name, "observer panicked: {}", panic_message(&*payload));
        }
    }

    /// The job for `idx` panicked outside the task body. A node that had
    /// not reached a final state is recorded as failed.
    fn abandon(&self, idx: usize, payload: &(dyn Any + Send)) {
        let message = panic_message(payload);
        let node = match self.nodes.read().get(idx) {
            Some(node) => node.clone(),
            None => return,
        };
        tracing::error!(frame = self.frame, task = %node.name, "task bookkeeping panicked: {}", message);

        let claimed = [PENDING, RUNNING].iter().any(|from| {
            node.status.compare_exchange(*from, FAILED, Ordering::AcqRel, Ordering::Acquire).is_ok()
        });
        if claimed {
            self.failures.lock().push(TaskFailure {
                task: TaskId(idx),
                name: node.name.clone(),
                kind: FailureKind::Panic,
                message,
            });
            self.finished.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn running(&self) -> Vec<String> {
        self.nodes.read().iter()
            .filter(|node| node.status.load(Ordering::Acquire) == RUNNING)
            .map(|node| node.name.clone())
            .collect()
    }

    fn report(&self, elapsed: Duration) -> FrameReport {
        let mut failed = std::mem::take(&mut *self.failures.lock());
        failed.sort_by_key(|failure| failure.task);

        let mut succeeded = Vec::new();
        let mut skipped = Vec::new();
        for node in self.nodes.read().iter() {
            match node.status.load(Ordering::Acquire) {
                SUCCEEDED => succeeded.push(node.name.clone()),
                FAILED => {}
                _ => skipped.push(node.name.clone()),
            }
        }

        FrameReport {
            frame: self.frame,
            succeeded,
            failed,
            skipped,
            cancelled: self.cancel.is_cancelled(),
            elapsed,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn report(failed: usize, skipped: usize) -> FrameReport {
        FrameReport {
            frame: 3,
            succeeded: vec!["ok".into()],
            failed: (0..failed).map(|i| TaskFailure {
                task: TaskId(i),
                name: format!("bad{}", i),
                kind: FailureKind::Error,
                message: "nope".into(),
            }).collect(),
            skipped: (0..skipped).map(|i| format!("skip{}", i)).collect(),
            cancelled: false,
            elapsed: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_into_result() {
        assert!(report(0, 0).into_result().is_ok());

        let err = report(1, 2).into_result().unwrap_err();
        assert_eq!(err.frame, 3);
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.skipped, vec!["skip0".to_owned(), "skip1".to_owned()]);
        assert_eq!(err.to_string(), "frame 3 did not complete: 1 failed, 2 skipped");
    }

    #[test]
    fn test_task_count() {
        assert_eq!(report(2, 3).task_count(), 6);
        assert!(!report(0, 1).is_success());
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom 1");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");
    }
}

//! Tasks and the context they run in.
//!
//! A `Task` is a named body plus the component types it reads and writes.
//! The body receives a `TaskContext` which hands out pool borrows, but only
//! for the types the task declared.
//!
//! A running task can queue more work through its context. An extension
//! runs after its parent and before anything ordered after the parent, with
//! at most the parent's access. A deferred task runs once the rest of the
//! frame has drained, with any access it likes. Both are created while the
//! frame runs, so they cannot borrow from outside it.

use std::any::{type_name, TypeId};
use std::fmt;

use parking_lot::Mutex;

use crate::access::Access;
use crate::component::Component;
use crate::error::{AccessError, GraphError};
use crate::graph::{resolve, Resolved};
use crate::query::{Query, View};
use crate::scheduler::CancelToken;
use crate::store::{PoolMut, PoolRef, ResourceMut, ResourceRef, Scope, Structure};

/// The body of a task.
pub(crate) type Body<'a> = Box<dyn FnOnce(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + 'a>;

/// Identifies a task within its frame. Ids are handed out in submission
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    /// The submission index of this task.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named synchronisation point within a frame.
///
/// Every task that signals a barrier finishes before any task waiting on it
/// starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Barrier(pub(crate) usize);

/// A component type named by a task before it is resolved.
#[derive(Clone, Debug)]
pub(crate) enum Declared {
    Type(TypeId, &'static str),
    Name(String),
}

impl Declared {
    pub(crate) fn label(&self) -> &str {
        match self {
            Declared::Type(_, name) => name,
            Declared::Name(name) => name,
        }
    }
}

/// A unit of work plus its declared access.
///
/// ```
/// use taskgraph_ecs::Task;
///
/// #[derive(Debug, Default)]
/// struct Position(f32);
/// #[derive(Debug, Default)]
/// struct Velocity(f32);
///
/// let task = Task::new("move", |ctx| {
///     let velocity = ctx.read::<Velocity>()?;
///     let mut position = ctx.write::<Position>()?;
///     for (entity, v) in velocity.iter() {
///         if let Some(p) = position.get_mut(entity) {
///             p.0 += v.0;
///         }
///     }
///     Ok(())
/// })
/// .read::<Velocity>()
/// .write::<Position>();
/// assert_eq!(task.name(), "move");
/// ```
pub struct Task<'a> {
    pub(crate) name: String,
    pub(crate) body: Body<'a>,
    pub(crate) reads: Vec<Declared>,
    pub(crate) writes: Vec<Declared>,
    pub(crate) structural: bool,
    pub(crate) after: Vec<TaskId>,
    pub(crate) before: Vec<TaskId>,
    pub(crate) signals: Vec<Barrier>,
    pub(crate) waits_for: Vec<Barrier>,
}

impl<'a> Task<'a> {
    /// Create a task with no declared access.
    pub fn new<F>(name: impl Into<String>, body: F) -> Task<'a>
        where F: FnOnce(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + 'a
    {
        Task {
            name: name.into(),
            body: Box::new(body),
            reads: Vec::new(),
            writes: Vec::new(),
            structural: false,
            after: Vec::new(),
            before: Vec::new(),
            signals: Vec::new(),
            waits_for: Vec::new(),
        }
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare shared access to `T`, a component or a resource.
    #[must_use]
    pub fn read<T: Component>(mut self) -> Self {
        self.reads.push(Declared::Type(TypeId::of::<T>(), type_name::<T>()));
        self
    }

    /// Declare exclusive access to `T`, a component or a resource.
    #[must_use]
    pub fn write<T: Component>(mut self) -> Self {
        self.writes.push(Declared::Type(TypeId::of::<T>(), type_name::<T>()));
        self
    }

    /// Declare shared access to a component type by registered name.
    #[must_use]
    pub fn read_named(mut self, name: impl Into<String>) -> Self {
        self.reads.push(Declared::Name(name.into()));
        self
    }

    /// Declare exclusive access to a component type by registered name.
    #[must_use]
    pub fn write_named(mut self, name: impl Into<String>) -> Self {
        self.writes.push(Declared::Name(name.into()));
        self
    }

    /// Declare that the task creates or destroys entities, or adds or
    /// removes components.
    ///
    /// Structural tasks never overlap with any task touching the store.
    #[must_use]
    pub fn structural(mut self) -> Self {
        self.structural = true;
        self
    }

    /// Run after `task` finishes.
    #[must_use]
    pub fn after(mut self, task: TaskId) -> Self {
        self.after.push(task);
        self
    }

    /// Run before `task` starts.
    #[must_use]
    pub fn before(mut self, task: TaskId) -> Self {
        self.before.push(task);
        self
    }

    /// Finish before anything waiting on `barrier` starts.
    #[must_use]
    pub fn signals(mut self, barrier: Barrier) -> Self {
        self.signals.push(barrier);
        self
    }

    /// Start only once everything signalling `barrier` has finished.
    #[must_use]
    pub fn waits_for(mut self, barrier: Barrier) -> Self {
        self.waits_for.push(barrier);
        self
    }
}

impl<'a> fmt::Debug for Task<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("reads", &self.reads.iter().map(Declared::label).collect::<Vec<_>>())
            .field("writes", &self.writes.iter().map(Declared::label).collect::<Vec<_>>())
            .field("structural", &self.structural)
            .finish()
    }
}

/// Work queued by a running task.
#[derive(Default)]
pub(crate) struct FollowUps {
    pub extended: Vec<Resolved<'static>>,
    pub deferred: Vec<Resolved<'static>>,
}

impl FollowUps {
    pub fn is_empty(&self) -> bool {
        self.extended.is_empty() && self.deferred.is_empty()
    }
}

/// What a running task body sees.
pub struct TaskContext<'s> {
    scope: Scope<'s>,
    task: TaskId,
    name: &'s str,
    frame: u64,
    cancel: &'s CancelToken,
    access: &'s Access,
    follow_ups: Mutex<FollowUps>,
}

impl<'s> TaskContext<'s> {
    pub(crate) fn new(
        scope: Scope<'s>,
        task: TaskId,
        name: &'s str,
        access: &'s Access,
        frame: u64,
        cancel: &'s CancelToken,
    ) -> TaskContext<'s> {
        TaskContext {
            scope,
            task,
            name,
            frame,
            cancel,
            access,
            follow_ups: Mutex::new(FollowUps::default()),
        }
    }

    pub(crate) fn into_follow_ups(self) -> FollowUps {
        self.follow_ups.into_inner()
    }

    /// This task's id.
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// This task's name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// The number of the running frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Borrow the pool of `T`. `T` must be declared as read or written.
    pub fn read<T: Component>(&self) -> Result<PoolRef<'_, T>, AccessError> {
        self.scope.read::<T>()
    }

    /// Mutably borrow the pool of `T`. `T` must be declared as written.
    pub fn write<T: Component>(&self) -> Result<PoolMut<'_, T>, AccessError> {
        self.scope.write::<T>()
    }

    /// Borrow resource `R`. `R` must be declared as read or written.
    pub fn resource<R: Component>(&self) -> Result<ResourceRef<'_, R>, AccessError> {
        self.scope.resource::<R>()
    }

    /// Mutably borrow resource `R`. `R` must be declared as written.
    pub fn resource_mut<R: Component>(&self) -> Result<ResourceMut<'_, R>, AccessError> {
        self.scope.resource_mut::<R>()
    }

    /// Run a query over declared component types.
    pub fn query<Q: Query>(&self) -> Result<View<'_, Q>, AccessError> {
        self.scope.query::<Q>()
    }

    /// Create and destroy entities. The task must be structural.
    pub fn structure(&self) -> Result<Structure<'_>, AccessError> {
        self.scope.structure()
    }

    fn follow_up(&self, task: Task<'static>) -> Result<Resolved<'static>, GraphError> {
        let task = resolve(self.scope.store().registry(), task)?;
        if task.has_ordering() {
            return Err(GraphError::FollowUpOrdering { task: task.name });
        }
        Ok(task)
    }

    /// Queue `task` to run once this task returns, before anything that
    /// is ordered after this task starts.
    ///
    /// The extension may only declare access this task already has.
    /// Extensions of the same task are ordered among themselves by their
    /// access, in the order they were queued. If this task fails, its
    /// extensions are skipped.
    pub fn extend(&self, task: Task<'static>) -> Result<(), GraphError> {
        let task = self.follow_up(task)?;
        if let Some(component) = task.access.excess_over(self.access) {
            return Err(GraphError::ExtensionAccess {
                task: task.name,
                parent: self.name.to_owned(),
                component: self.scope.store().registry().name_of(component),
            });
        }

        self.follow_ups.lock().extended.push(task);
        Ok(())
    }

    /// Queue `task` to run after every other task in the frame, including
    /// any structural ones.
    ///
    /// Deferred tasks run in waves once the frame has drained, ordered by
    /// their access, then by the task that queued them, then by the order
    /// they were queued. Nothing deferred runs if the frame is cancelled.
    pub fn defer(&self, task: Task<'static>) -> Result<(), GraphError> {
        let task = self.follow_up(task)?;
        self.follow_ups.lock().deferred.push(task);
        Ok(())
    }

    /// Stop the rest of the frame from starting. Running tasks finish.
    pub fn cancel_frame(&self) {
        self.cancel.cancel();
    }

    /// Returns true if the frame has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<'s> fmt::Debug for TaskContext<'s> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<TaskContext {} `{}` frame {}>", self.task, self.name, self.frame)
    }
}

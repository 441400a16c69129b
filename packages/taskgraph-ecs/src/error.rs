//! Error types for registration, storage, graph building and scheduling.
//!
//! Registry and graph errors are programmer errors and are meant to stop
//! progress loudly. Store lookups on dead entities are soft: most accessors
//! return `None` and only the mutating ones report `StoreError::StaleEntity`.

use thiserror::Error;

use crate::component::StorageKind;
use crate::entity::EntityID;
use crate::task::TaskId;

/// Errors raised while registering component types.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two different Rust types were registered under the same name.
    #[error("component name `{name}` is already registered for `{existing}`, cannot register `{requested}`")]
    DuplicateName {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// A new type was registered after `TypeRegistry::seal`.
    #[error("cannot register `{name}`: the type registry is sealed")]
    Sealed { name: String },

    /// The type is already registered as a different kind of storage.
    #[error("`{type_name}` is already registered as a {registered}")]
    WrongKind {
        type_name: &'static str,
        registered: StorageKind,
    },

    /// `EntityID` stands for the entity table and cannot be stored.
    #[error("`{type_name}` is reserved for the entity table")]
    Reserved { type_name: &'static str },
}

/// Errors raised by the component store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The entity has been destroyed, or its generation is otherwise stale.
    #[error("entity {0} is stale or dead")]
    StaleEntity(EntityID),

    /// The component type was never registered.
    #[error("component type `{type_name}` is not registered")]
    Unregistered { type_name: &'static str },

    /// Stores can only be created from a sealed registry.
    #[error("the type registry must be sealed before creating a store")]
    RegistryNotSealed,

    /// The resource type is registered but no value has been inserted.
    #[error("resource `{resource}` has not been inserted")]
    MissingResource { resource: String },

    /// A pool lock is held elsewhere.
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Errors raised when a task reaches for component storage.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    /// The task did not declare the access it attempted.
    #[error("task `{task}` did not declare {mode} access to `{component}`")]
    Undeclared {
        task: String,
        component: String,
        mode: &'static str,
    },

    /// The task attempted a structural change without declaring it.
    #[error("task `{task}` did not declare structural access")]
    NotStructural { task: String },

    /// The pool is already borrowed in a conflicting way.
    #[error("component `{component}` is already borrowed")]
    Contended { component: String },

    /// The component type was never registered.
    #[error("component type `{type_name}` is not registered")]
    Unregistered { type_name: &'static str },

    /// The resource type is registered but no value has been inserted.
    #[error("resource `{resource}` has not been inserted")]
    MissingResource { resource: String },
}

/// Errors raised while building a frame's task graph.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The combination of hints and inferred conflicts forms a cycle.
    #[error("cyclic dependency between tasks: {}", tasks.join(" -> "))]
    CyclicDependency { tasks: Vec<String> },

    /// A task declared access to an unregistered component.
    #[error("task `{task}` declares unregistered component `{component}`")]
    Unregistered { task: String, component: String },

    /// A hint names a task that is not part of this frame.
    #[error("task `{task}` references unknown task {reference}")]
    UnknownTask { task: String, reference: TaskId },

    /// A task references a barrier that was not created by this frame.
    #[error("task `{task}` references unknown barrier #{barrier}")]
    UnknownBarrier { task: String, barrier: usize },

    /// The frame was built against a different registry than the scheduler's.
    #[error("frame was built against a different type registry")]
    ForeignRegistry,

    /// An extension asked for access its parent task did not declare.
    #[error("extension `{task}` of `{parent}` needs access to `{component}` that its parent did not declare")]
    ExtensionAccess {
        task: String,
        parent: String,
        component: String,
    },

    /// Follow-up tasks are ordered by their access alone; hints and
    /// barriers cannot be attached to them.
    #[error("follow-up task `{task}` cannot carry ordering hints or barriers")]
    FollowUpOrdering { task: String },
}

/// Errors raised by the scheduler itself.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Another frame is still running.
    #[error("a frame is already running")]
    FrameInProgress,

    /// Schedulers can only be created from a sealed registry.
    #[error("the type registry must be sealed before creating a scheduler")]
    RegistryNotSealed,

    /// The frame's graph could not be built.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How a task failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The body returned an error.
    Error,
    /// The body panicked.
    Panic,
}

/// A single task failure captured by the executor.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("task `{name}` failed: {message}")]
pub struct TaskFailure {
    pub task: TaskId,
    pub name: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Returned by `FrameReport::into_result` when any task did not succeed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("frame {frame} did not complete: {} failed, {} skipped", failures.len(), skipped.len())]
pub struct FrameError {
    pub frame: u64,
    pub failures: Vec<TaskFailure>,
    pub skipped: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cycle_message() {
        let err = GraphError::CyclicDependency {
            tasks: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency between tasks: a -> b -> a");
    }

    #[test]
    fn test_access_into_store_error() {
        let err: StoreError = AccessError::Contended { component: "position".into() }.into();
        assert_eq!(err.to_string(), "component `position` is already borrowed");
    }
}

//! A parallel task scheduler over an entity component system.
//!
//! Component types are registered once with a `TypeRegistry`, which is then
//! sealed. Each frame, tasks are submitted with the component types they
//! read and write; the scheduler orders conflicting tasks by submission
//! order and runs everything else in parallel on a fixed pool of workers.
//! Shared resources are declared and ordered the same way.

pub use access::{Access, ComponentSet};
pub use component::{
    Component,
    ComponentRegistration,
    ComponentTypeID,
    StorageKind,
    TypeRegistry,
};
pub use config::{HintPolicy, SchedulerConfig};
pub use entity::EntityID;
pub use error::{
    AccessError,
    FailureKind,
    FrameError,
    GraphError,
    RegistryError,
    SchedulerError,
    StoreError,
    TaskFailure,
};
pub use executor::{FrameObserver, FrameReport};
pub use graph::{Frame, TaskGraph};
pub use pool::ComponentPool;
pub use query::{Fetch, Query, Read, View, Write};
pub use scheduler::{CancelToken, FrameState, Scheduler};
pub use store::{ComponentRef, PoolMut, PoolRef, ResourceMut, ResourceRef, Store, Structure};
pub use task::{Barrier, Task, TaskContext, TaskId};

pub mod access;
pub mod component;
pub mod config;
mod entity;
pub mod error;
mod executor;
pub mod graph;
mod guard;
pub mod pool;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod thread;

/// The types most task code needs.
pub mod prelude {
    pub use crate::{
        EntityID,
        Frame,
        Read,
        Scheduler,
        SchedulerConfig,
        Store,
        Task,
        TaskContext,
        TypeRegistry,
        Write,
    };
}

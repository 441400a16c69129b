//! Frames and the task graphs built from them.
//!
//! A `Frame` collects tasks in submission order. Building it resolves each
//! task's declared access and adds an edge between every pair of tasks
//! that conflict, from the earlier-submitted task to the later one. Explicit
//! hints (`after`, `before`, `Frame::order`, barriers) add more edges.
//!
//! Inferred edges come from one pass over the tasks that remembers, per
//! component type, the last writer and the readers since that writer. That
//! keeps the edge count linear in practice while still ordering every pair
//! of conflicting tasks, transitively.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::access::Access;
use crate::component::{ComponentTypeID, StorageKind, TypeRegistry};
use crate::config::HintPolicy;
use crate::error::GraphError;
use crate::task::{Barrier, Body, Declared, Task, TaskId};

/// A task whose access has been resolved against the registry.
pub(crate) struct Resolved<'a> {
    pub name: String,
    pub access: Access,
    pub body: Body<'a>,
    pub after: Vec<TaskId>,
    pub before: Vec<TaskId>,
    pub signals: Vec<Barrier>,
    pub waits_for: Vec<Barrier>,
}

impl<'a> Resolved<'a> {
    /// Returns true if the task carries hints or barriers.
    pub fn has_ordering(&self) -> bool {
        !(self.after.is_empty() && self.before.is_empty()
            && self.signals.is_empty() && self.waits_for.is_empty())
    }
}

fn resolve_one(registry: &TypeRegistry, task: &str, declared: &Declared) -> Result<(ComponentTypeID, StorageKind), GraphError> {
    let id = match declared {
        Declared::Type(type_id, _) => registry.id_of_type(*type_id),
        Declared::Name(name) => registry.lookup(name),
    };

    id.and_then(|id| Some((id, registry.kind_of(id)?)))
        .filter(|(_, kind)| *kind != StorageKind::Entity)
        .ok_or_else(|| GraphError::Unregistered {
            task: task.to_owned(),
            component: declared.label().to_owned(),
        })
}

/// Resolve a task's declared types. Components and resources land in the
/// same access sets; only components imply a read of the entity table.
pub(crate) fn resolve<'a>(registry: &TypeRegistry, task: Task<'a>) -> Result<Resolved<'a>, GraphError> {
    let mut components = (Vec::new(), Vec::new());
    let mut resources = (Vec::new(), Vec::new());
    for (declared, write) in task.reads.iter().map(|d| (d, false)).chain(task.writes.iter().map(|d| (d, true))) {
        let (id, kind) = resolve_one(registry, &task.name, declared)?;
        let lists = if kind == StorageKind::Resource { &mut resources } else { &mut components };
        if write { lists.1.push(id) } else { lists.0.push(id) }
    }

    Ok(Resolved {
        access: Access::new(components.0, components.1, task.structural)
            .with_resources(resources.0, resources.1),
        name: task.name,
        body: task.body,
        after: task.after,
        before: task.before,
        signals: task.signals,
        waits_for: task.waits_for,
    })
}

/// Edges between every pair of conflicting accesses, from the earlier to
/// the later one, transitively reduced per type.
pub(crate) fn conflict_edges<'x>(accesses: impl IntoIterator<Item=&'x Access>, types: usize) -> HashSet<(usize, usize)> {
    let mut edges = HashSet::new();
    let mut last_writer: Vec<Option<usize>> = vec![None; types];
    let mut readers: Vec<Vec<usize>> = vec![Vec::new(); types];
    for (idx, access) in accesses.into_iter().enumerate() {
        for c in access.reads().iter() {
            let c = c.id();
            if let Some(writer) = last_writer[c] {
                edges.insert((writer, idx));
            }
            readers[c].push(idx);
        }

        for c in access.writes().iter() {
            let c = c.id();
            if readers[c].is_empty() {
                if let Some(writer) = last_writer[c] {
                    edges.insert((writer, idx));
                }
            } else {
                for reader in readers[c].drain(..) {
                    edges.insert((reader, idx));
                }
            }
            last_writer[c] = Some(idx);
        }
    }
    edges
}

/// The tasks of one frame, before their graph is built.
pub struct Frame<'a> {
    registry: Arc<TypeRegistry>,
    tasks: Vec<Resolved<'a>>,
    orders: Vec<(TaskId, TaskId)>,
    barriers: Vec<String>,
}

impl<'a> Frame<'a> {
    /// Create an empty frame resolving names through `registry`.
    pub fn new(registry: Arc<TypeRegistry>) -> Frame<'a> {
        Frame {
            registry,
            tasks: Vec::new(),
            orders: Vec::new(),
            barriers: Vec::new(),
        }
    }

    /// The registry this frame resolves component types with.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The number of submitted tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no tasks have been submitted.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The name of a submitted task.
    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.tasks.get(task.0).map(|t| t.name.as_str())
    }

    fn check_task(&self, task: &str, reference: TaskId) -> Result<(), GraphError> {
        if reference.0 < self.tasks.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownTask { task: task.to_owned(), reference })
        }
    }

    fn check_barrier(&self, task: &str, barrier: Barrier) -> Result<(), GraphError> {
        if barrier.0 < self.barriers.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownBarrier { task: task.to_owned(), barrier: barrier.0 })
        }
    }

    /// Add a task to the frame.
    ///
    /// Its declared component types are resolved now; `after` and `before`
    /// may only name tasks already submitted.
    pub fn submit(&mut self, task: Task<'a>) -> Result<TaskId, GraphError> {
        let task = resolve(&self.registry, task)?;
        for reference in task.after.iter().chain(task.before.iter()) {
            self.check_task(&task.name, *reference)?;
        }
        for barrier in task.signals.iter().chain(task.waits_for.iter()) {
            self.check_barrier(&task.name, *barrier)?;
        }

        let id = TaskId(self.tasks.len());
        self.tasks.push(task);
        Ok(id)
    }

    /// Submit `task` to run after `previous`.
    pub fn then(&mut self, previous: TaskId, task: Task<'a>) -> Result<TaskId, GraphError> {
        self.submit(task.after(previous))
    }

    /// Require `first` to finish before `second` starts.
    pub fn order(&mut self, first: TaskId, second: TaskId) -> Result<(), GraphError> {
        let name = self.task_name(second).unwrap_or("<frame>").to_owned();
        self.check_task(&name, first)?;
        self.check_task(&name, second)?;
        self.orders.push((first, second));
        Ok(())
    }

    /// Create a named barrier for this frame.
    pub fn barrier(&mut self, name: impl Into<String>) -> Barrier {
        self.barriers.push(name.into());
        Barrier(self.barriers.len() - 1)
    }

    /// Build the task graph.
    pub fn build(self, policy: HintPolicy) -> Result<TaskGraph<'a>, GraphError> {
        let n = self.tasks.len();
        let mut edges = conflict_edges(self.tasks.iter().map(|t| &t.access), self.registry.len());

        // Hints.
        let mut hints = Vec::new();
        for (idx, task) in self.tasks.iter().enumerate() {
            hints.extend(task.after.iter().map(|a| (a.0, idx)));
            hints.extend(task.before.iter().map(|b| (idx, b.0)));
        }
        hints.extend(self.orders.iter().map(|(a, b)| (a.0, b.0)));
        for barrier in 0..self.barriers.len() {
            let signallers: Vec<usize> = self.tasks.iter().enumerate()
                .filter(|(_, t)| t.signals.iter().any(|b| b.0 == barrier))
                .map(|(idx, _)| idx)
                .collect();
            for (idx, task) in self.tasks.iter().enumerate() {
                if task.waits_for.iter().any(|b| b.0 == barrier) {
                    hints.extend(signallers.iter().map(|s| (*s, idx)));
                }
            }
        }

        for (from, to) in hints {
            let keep = match policy {
                HintPolicy::Enforce => true,
                HintPolicy::ConflictsOnly => {
                    self.tasks[from].access.conflicts_with(&self.tasks[to].access)
                }
            };
            if keep {
                edges.insert((from, to));
            }
        }

        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        for (from, to) in edges {
            successors[from].push(to);
            predecessors[to].push(from);
        }
        for list in successors.iter_mut().chain(predecessors.iter_mut()) {
            list.sort_unstable();
        }

        if let Some(cycle) = find_cycle(&successors, &predecessors) {
            let tasks = cycle.into_iter().map(|idx| self.tasks[idx].name.clone()).collect();
            return Err(GraphError::CyclicDependency { tasks });
        }

        let nodes = self.tasks.into_iter()
            .zip(successors.into_iter().zip(predecessors))
            .map(|(task, (successors, predecessors))| Node {
                name: task.name,
                access: task.access,
                body: task.body,
                successors,
                predecessors,
            })
            .collect();

        Ok(TaskGraph {
            registry: self.registry,
            nodes,
        })
    }
}

impl<'a> fmt::Debug for Frame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Frame {} tasks, {} barriers>", self.tasks.len(), self.barriers.len())
    }
}

/// Kahn's algorithm. If some nodes are never released, walk predecessors
/// among them until a node repeats; that loop is a cycle.
///
/// The cycle is returned in edge order with its first node repeated at the
/// end.
fn find_cycle(successors: &[Vec<usize>], predecessors: &[Vec<usize>]) -> Option<Vec<usize>> {
    let n = successors.len();
    let mut remaining: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut ready: Vec<usize> = (0..n).filter(|idx| remaining[*idx] == 0).collect();
    let mut released = vec![false; n];

    while let Some(idx) = ready.pop() {
        released[idx] = true;
        for succ in &successors[idx] {
            remaining[*succ] -= 1;
            if remaining[*succ] == 0 {
                ready.push(*succ);
            }
        }
    }

    let start = (0..n).find(|idx| !released[*idx])?;
    let mut seen = vec![None; n];
    let mut path = Vec::new();
    let mut current = start;
    while seen[current].is_none() {
        seen[current] = Some(path.len());
        path.push(current);
        // Every unreleased node has an unreleased predecessor.
        current = *predecessors[current].iter().find(|p| !released[**p])?;
    }

    let first = seen[current]?;
    let mut cycle: Vec<usize> = path[first..].to_vec();
    cycle.reverse();
    cycle.push(cycle[0]);
    Some(cycle)
}

pub(crate) struct Node<'a> {
    pub name: String,
    pub access: Access,
    pub body: Body<'a>,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

/// The dependency DAG of one frame.
pub struct TaskGraph<'a> {
    registry: Arc<TypeRegistry>,
    nodes: Vec<Node<'a>>,
}

impl<'a> TaskGraph<'a> {
    /// The registry the graph was built against.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The number of tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The name of a task.
    pub fn name(&self, task: TaskId) -> Option<&str> {
        self.nodes.get(task.0).map(|n| n.name.as_str())
    }

    /// The resolved access of a task.
    pub fn access(&self, task: TaskId) -> Option<&Access> {
        self.nodes.get(task.0).map(|n| &n.access)
    }

    /// Tasks that may only start once `task` has finished.
    pub fn successors(&self, task: TaskId) -> Vec<TaskId> {
        self.nodes.get(task.0)
            .map(|n| n.successors.iter().map(|s| TaskId(*s)).collect())
            .unwrap_or_default()
    }

    /// Tasks that must finish before `task` starts.
    pub fn predecessors(&self, task: TaskId) -> Vec<TaskId> {
        self.nodes.get(task.0)
            .map(|n| n.predecessors.iter().map(|p| TaskId(*p)).collect())
            .unwrap_or_default()
    }

    /// Returns true if there is a direct edge from `from` to `to`.
    pub fn has_edge(&self, from: TaskId, to: TaskId) -> bool {
        self.nodes.get(from.0).map_or(false, |n| n.successors.binary_search(&to.0).is_ok())
    }

    /// The total number of edges.
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.successors.len()).sum()
    }

    /// Tasks with no predecessors, in submission order.
    pub fn roots(&self) -> Vec<TaskId> {
        self.nodes.iter().enumerate()
            .filter(|(_, n)| n.predecessors.is_empty())
            .map(|(idx, _)| TaskId(idx))
            .collect()
    }

    pub(crate) fn into_nodes(self) -> Vec<Node<'a>> {
        self.nodes
    }
}

impl<'a> fmt::Debug for TaskGraph<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for node in &self.nodes {
            list.entry(&format_args!("{} -> {:?}", node.name, node.successors));
        }
        list.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct A;
    struct B;
    struct C;
    struct Clock;
    struct Unknown;

    fn registry() -> Arc<TypeRegistry> {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<A>("a").unwrap();
        registry.register::<B>("b").unwrap();
        registry.register::<C>("c").unwrap();
        registry.register_resource::<Clock>("clock").unwrap();
        registry.seal();
        registry
    }

    fn noop<'a>(name: &str) -> Task<'a> {
        Task::new(name, |_| Ok(()))
    }

    #[test]
    fn test_disjoint_tasks_are_independent() {
        let mut frame = Frame::new(registry());
        let x = frame.submit(noop("x").write::<A>()).unwrap();
        let y = frame.submit(noop("y").write::<B>()).unwrap();
        let z = frame.submit(noop("z").read::<C>()).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.roots(), vec![x, y, z]);
    }

    #[test]
    fn test_conflicts_follow_submission_order() {
        let mut frame = Frame::new(registry());
        let w1 = frame.submit(noop("w1").write::<A>()).unwrap();
        let r1 = frame.submit(noop("r1").read::<A>()).unwrap();
        let r2 = frame.submit(noop("r2").read::<A>()).unwrap();
        let w2 = frame.submit(noop("w2").write::<A>()).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert!(graph.has_edge(w1, r1));
        assert!(graph.has_edge(w1, r2));
        assert!(!graph.has_edge(r1, r2));
        assert!(graph.has_edge(r1, w2));
        assert!(graph.has_edge(r2, w2));
        assert_eq!(graph.roots(), vec![w1]);
    }

    #[test]
    fn test_structural_orders_everything() {
        let mut frame = Frame::new(registry());
        let r = frame.submit(noop("reader").read::<A>()).unwrap();
        let s = frame.submit(noop("spawner").structural()).unwrap();
        let w = frame.submit(noop("writer").write::<B>()).unwrap();
        let p = frame.submit(noop("pure")).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert!(graph.has_edge(r, s));
        assert!(graph.has_edge(s, w));
        assert!(graph.predecessors(p).is_empty());
    }

    #[test]
    fn test_hint_cycle() {
        let mut frame = Frame::new(registry());
        let a = frame.submit(noop("a").write::<A>()).unwrap();
        let b = frame.submit(noop("b").read::<A>()).unwrap();
        frame.order(b, a).unwrap();

        match frame.build(HintPolicy::Enforce) {
            Err(GraphError::CyclicDependency { tasks }) => {
                assert_eq!(tasks.first(), tasks.last());
                assert_eq!(tasks.len(), 3);
                assert!(tasks.contains(&"a".to_owned()));
                assert!(tasks.contains(&"b".to_owned()));
            }
            other => panic!("expected a cycle, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn test_conflicts_only_drops_spurious_hints() {
        let mut frame = Frame::new(registry());
        let a = frame.submit(noop("a").write::<A>()).unwrap();
        let b = frame.submit(noop("b").write::<B>().after(a)).unwrap();
        let c = frame.submit(noop("c").read::<A>().after(a)).unwrap();

        let graph = frame.build(HintPolicy::ConflictsOnly).unwrap();
        assert!(!graph.has_edge(a, b));
        assert!(graph.has_edge(a, c));
    }

    #[test]
    fn test_barrier() {
        let mut frame = Frame::new(registry());
        let physics = frame.barrier("physics");
        let p1 = frame.submit(noop("p1").write::<A>().signals(physics)).unwrap();
        let p2 = frame.submit(noop("p2").write::<B>().signals(physics)).unwrap();
        let render = frame.submit(noop("render").read::<C>().waits_for(physics)).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert_eq!(graph.predecessors(render), vec![p1, p2]);
    }

    #[test]
    fn test_then_and_before() {
        let mut frame = Frame::new(registry());
        let first = frame.submit(noop("first")).unwrap();
        let second = frame.then(first, noop("second")).unwrap();
        let third = frame.submit(noop("third").before(first)).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert!(graph.has_edge(first, second));
        assert!(graph.has_edge(third, first));
        assert_eq!(graph.roots(), vec![third]);
    }

    #[test]
    fn test_unregistered() {
        let mut frame = Frame::new(registry());
        let err = frame.submit(noop("bad").read::<Unknown>()).unwrap_err();
        assert!(matches!(err, GraphError::Unregistered { ref task, .. } if task == "bad"));

        let err = frame.submit(noop("bad").write_named("missing")).unwrap_err();
        assert_eq!(err, GraphError::Unregistered { task: "bad".into(), component: "missing".into() });
        assert!(frame.is_empty());
    }

    #[test]
    fn test_unknown_references() {
        let mut frame = Frame::new(registry());
        let err = frame.submit(noop("early").after(TaskId(4))).unwrap_err();
        assert_eq!(err, GraphError::UnknownTask { task: "early".into(), reference: TaskId(4) });

        let err = frame.submit(noop("lost").waits_for(Barrier(0))).unwrap_err();
        assert_eq!(err, GraphError::UnknownBarrier { task: "lost".into(), barrier: 0 });
    }

    #[test]
    fn test_named_access() {
        let mut frame = Frame::new(registry());
        let w = frame.submit(noop("w").write_named("b")).unwrap();
        let r = frame.submit(noop("r").read::<B>()).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert!(graph.has_edge(w, r));
    }

    #[test]
    fn test_resources_conflict_like_components() {
        let mut frame = Frame::new(registry());
        let tick = frame.submit(noop("tick").write::<Clock>()).unwrap();
        let spawn = frame.submit(noop("spawn").structural()).unwrap();
        let read = frame.submit(noop("read").read_named("clock")).unwrap();
        let also = frame.submit(noop("also").read::<Clock>().read::<A>()).unwrap();

        let graph = frame.build(HintPolicy::Enforce).unwrap();
        assert!(!graph.has_edge(tick, spawn));
        assert!(graph.has_edge(tick, read));
        assert!(graph.has_edge(tick, also));
        assert!(graph.has_edge(spawn, also));
        assert!(!graph.has_edge(read, also));
        assert!(!graph.access(tick).unwrap().can_read(ComponentTypeID::ENTITY));
    }

    #[test]
    fn test_entity_cannot_be_declared() {
        let mut frame = Frame::new(registry());
        let err = frame.submit(noop("bad").write_named("entity")).unwrap_err();
        assert_eq!(err, GraphError::Unregistered { task: "bad".into(), component: "entity".into() });
    }
}

//! Densely packed per-type component storage.
//!
//! A pool keeps its components in one contiguous `Vec`, a parallel list of
//! owning entities, and a sparse table from entity index to slot. Removal
//! swaps the last element into the hole, so a slot index is only meaningful
//! until the next removal from the same pool: look components up by
//! `EntityID` again after any structural change.

use std::any::Any;
use std::fmt::{self, Debug};

use rayon::prelude::*;

use crate::component::Component;
use crate::entity::EntityID;

const NO_SLOT: u32 = u32::MAX;

/// Storage for every instance of one component type.
///
/// Borrowing a pool lets you read and modify the components already in it.
/// Adding and removing components is a structural change and only goes
/// through `Store` or `Structure`, which check that the entity is alive:
///
/// ```compile_fail
/// # use std::sync::Arc;
/// # use taskgraph_ecs::{Store, TypeRegistry};
/// let registry = Arc::new(TypeRegistry::new());
/// registry.register::<u32>("count").unwrap();
/// registry.seal();
///
/// let mut store = Store::new(registry).unwrap();
/// let e = store.create_entity();
/// store.destroy_entity(e);
/// store.pool_mut::<u32>().unwrap().insert(e, 1);
/// ```
pub struct ComponentPool<T> {
    data: Vec<T>,
    owners: Vec<EntityID>,
    slots: Vec<u32>,
}

impl<T: Component> ComponentPool<T> {
    /// Create an empty pool.
    pub fn new() -> ComponentPool<T> {
        ComponentPool {
            data: Vec::new(),
            owners: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Return the number of components stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the pool holds no components.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn slot_of(&self, entity: EntityID) -> Option<usize> {
        let slot = *self.slots.get(entity.index() as usize)?;
        if slot == NO_SLOT {
            return None;
        }

        let slot = slot as usize;
        if self.owners[slot] == entity {
            Some(slot)
        } else {
            None
        }
    }

    /// Returns true if `entity` (at its current generation) has a component here.
    pub fn contains(&self, entity: EntityID) -> bool {
        self.slot_of(entity).is_some()
    }

    /// Fetch the component of an entity.
    pub fn get(&self, entity: EntityID) -> Option<&T> {
        self.slot_of(entity).map(|slot| &self.data[slot])
    }

    /// Fetch the component of an entity mutably.
    pub fn get_mut(&mut self, entity: EntityID) -> Option<&mut T> {
        self.slot_of(entity).map(move |slot| &mut self.data[slot])
    }

    /// Insert or replace the component of an entity.
    ///
    /// The caller is responsible for checking that `entity` is alive.
    pub(crate) fn insert(&mut self, entity: EntityID, value: T) -> Option<T> {
        if let Some(slot) = self.slot_of(entity) {
            return Some(std::mem::replace(&mut self.data[slot], value));
        }

        let index = entity.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, NO_SLOT);
        }

        self.slots[index] = self.data.len() as u32;
        self.data.push(value);
        self.owners.push(entity);
        None
    }

    /// Remove the component of an entity, swapping the last slot into its place.
    pub(crate) fn remove(&mut self, entity: EntityID) -> Option<T> {
        let slot = self.slot_of(entity)?;
        let last = self.data.len() - 1;

        if slot != last {
            let moved = self.owners[last];
            self.slots[moved.index() as usize] = slot as u32;
        }

        self.slots[entity.index() as usize] = NO_SLOT;
        self.owners.swap_remove(slot);
        Some(self.data.swap_remove(slot))
    }

    /// The owning entities, in slot order.
    pub fn entities(&self) -> &[EntityID] {
        &self.owners
    }

    /// The components, in slot order.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The components, in slot order.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Iterate over `(entity, component)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item=(EntityID, &T)> + '_ {
        self.owners.iter().copied().zip(self.data.iter())
    }

    /// Iterate mutably over `(entity, component)` pairs in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item=(EntityID, &mut T)> + '_ {
        self.owners.iter().copied().zip(self.data.iter_mut())
    }

    /// Iterate over `(entity, component)` pairs on the rayon pool.
    pub fn par_iter(&self) -> impl ParallelIterator<Item=(EntityID, &T)> + '_ {
        self.owners.par_iter().copied().zip(self.data.par_iter())
    }

    /// Iterate mutably over `(entity, component)` pairs on the rayon pool.
    pub fn par_iter_mut(&mut self) -> impl ParallelIterator<Item=(EntityID, &mut T)> + '_ {
        self.owners.par_iter().copied().zip(self.data.par_iter_mut())
    }
}

impl<T: Component> Default for ComponentPool<T> {
    fn default() -> Self {
        ComponentPool::new()
    }
}

impl<T> Debug for ComponentPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ComponentPool {} of {}>", self.data.len(), std::any::type_name::<T>())
    }
}

/// The type-erased view of a `ComponentPool` the store keeps.
pub trait AnyPool: Send + Sync + Debug {
    /// Drop the component of `entity`, if any.
    fn remove_entity(&mut self, entity: EntityID) -> bool;

    /// Returns true if `entity` has a component in this pool.
    fn contains_entity(&self, entity: EntityID) -> bool;

    /// The number of stored components.
    fn len(&self) -> usize;

    /// The owning entities, in slot order.
    fn owners(&self) -> &[EntityID];

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> AnyPool for ComponentPool<T> {
    fn remove_entity(&mut self, entity: EntityID) -> bool {
        self.remove(entity).is_some()
    }

    fn contains_entity(&self, entity: EntityID) -> bool {
        self.contains(entity)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn owners(&self) -> &[EntityID] {
        &self.owners
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Construct an empty, boxed pool for `T`. Stored in component registrations.
pub(crate) fn new_pool<T: Component>() -> Box<dyn AnyPool> {
    Box::new(ComponentPool::<T>::new())
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(index: u32, generation: u32) -> EntityID {
        EntityID::new(index, generation)
    }

    #[test]
    fn test_swap_remove_keeps_lookup() {
        let mut pool = ComponentPool::<u32>::new();
        for i in 0..4 {
            pool.insert(id(i, 0), i * 10);
        }

        assert_eq!(pool.remove(id(1, 0)), Some(10));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.get(id(3, 0)), Some(&30));
        assert_eq!(pool.get(id(1, 0)), None);
        assert_eq!(pool.entities(), &[id(0, 0), id(3, 0), id(2, 0)]);
    }

    #[test]
    fn test_generation_checked() {
        let mut pool = ComponentPool::<u8>::new();
        pool.insert(id(2, 0), 1);

        assert!(pool.contains(id(2, 0)));
        assert!(!pool.contains(id(2, 1)));
        assert_eq!(pool.remove(id(2, 1)), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_insert_replaces() {
        let mut pool = ComponentPool::<u8>::new();
        assert_eq!(pool.insert(id(0, 0), 1), None);
        assert_eq!(pool.insert(id(0, 0), 2), Some(1));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(id(0, 0)), Some(&2));
    }

    #[test]
    fn test_remove_last() {
        let mut pool = ComponentPool::<u8>::new();
        pool.insert(id(0, 0), 1);
        pool.insert(id(1, 0), 2);
        assert_eq!(pool.remove(id(1, 0)), Some(2));
        assert_eq!(pool.remove(id(0, 0)), Some(1));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_par_iter() {
        let mut pool = ComponentPool::<u64>::new();
        for i in 0..1000 {
            pool.insert(id(i, 0), i as u64);
        }
        pool.remove(id(10, 0));

        pool.par_iter_mut().for_each(|(entity, value)| {
            assert_eq!(*value, entity.index() as u64);
            *value *= 2;
        });

        let sum: u64 = pool.par_iter().map(|(_, value)| *value).sum();
        assert_eq!(sum, (0..1000u64).filter(|i| *i != 10).map(|i| i * 2).sum::<u64>());
        assert_eq!(pool.par_iter().count(), 999);
        assert_eq!(pool.get(id(999, 0)), Some(&1998));
    }
}

//! Multi-component queries.
//!
//! A query is a tuple of `Read<T>` and `Write<T>` markers. Running it
//! borrows every listed pool and visits the entities that own all of the
//! listed components, in the slot order of the smallest pool.
//!
//! ```
//! use std::sync::Arc;
//! use taskgraph_ecs::{Read, Store, TypeRegistry, Write};
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
//! let mut store = Store::new(registry).unwrap();
//! let e = store.create_entity();
//! store.add_component(e, Position(0.0)).unwrap();
//! store.add_component(e, Velocity(2.0)).unwrap();
//!
//! store.query::<(Write<Position>, Read<Velocity>)>().unwrap()
//!     .for_each(|_, (p, v)| p.0 += v.0);
//! assert_eq!(store.get::<Position>(e).unwrap().0, 2.0);
//! ```

use std::marker::PhantomData;

use crate::component::Component;
use crate::entity::EntityID;
use crate::error::AccessError;
use crate::store::{ErasedPoolRef, PoolMut, PoolRef, Scope};

/// Query marker for shared access to `T`.
pub struct Read<T>(PhantomData<fn() -> T>);

/// Query marker for exclusive access to `T`.
pub struct Write<T>(PhantomData<fn() -> T>);

/// One element of a query.
pub trait Fetch {
    /// The component type fetched.
    type Component: Component;
    /// The pool borrow held while the view is alive.
    type Guard<'a>;
    /// What the visitor receives per entity.
    type Item<'g>;

    /// Whether this fetch needs write access.
    const WRITE: bool;

    #[doc(hidden)]
    fn acquire<'a>(scope: &Scope<'a>) -> Result<Self::Guard<'a>, AccessError>;

    #[doc(hidden)]
    fn owners<'g>(guard: &'g Self::Guard<'_>) -> &'g [EntityID];

    #[doc(hidden)]
    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityID) -> Option<Self::Item<'g>>;
}

impl<T: Component> Fetch for Read<T> {
    type Component = T;
    type Guard<'a> = PoolRef<'a, T>;
    type Item<'g> = &'g T;

    const WRITE: bool = false;

    fn acquire<'a>(scope: &Scope<'a>) -> Result<PoolRef<'a, T>, AccessError> {
        scope.read::<T>()
    }

    fn owners<'g>(guard: &'g PoolRef<'_, T>) -> &'g [EntityID] {
        guard.entities()
    }

    fn fetch<'g>(guard: &'g mut PoolRef<'_, T>, entity: EntityID) -> Option<&'g T> {
        guard.get(entity)
    }
}

impl<T: Component> Fetch for Write<T> {
    type Component = T;
    type Guard<'a> = PoolMut<'a, T>;
    type Item<'g> = &'g mut T;

    const WRITE: bool = true;

    fn acquire<'a>(scope: &Scope<'a>) -> Result<PoolMut<'a, T>, AccessError> {
        scope.write::<T>()
    }

    fn owners<'g>(guard: &'g PoolMut<'_, T>) -> &'g [EntityID] {
        guard.entities()
    }

    fn fetch<'g>(guard: &'g mut PoolMut<'_, T>, entity: EntityID) -> Option<&'g mut T> {
        guard.get_mut(entity)
    }
}

/// A tuple of `Fetch` elements.
///
/// Listing the same component type twice fails with
/// `AccessError::Contended` when a write is involved.
pub trait Query {
    /// The borrows held by the view.
    type Guards<'a>;
    /// What the visitor receives per entity.
    type Item<'g>;

    #[doc(hidden)]
    fn acquire<'a>(scope: &Scope<'a>) -> Result<Self::Guards<'a>, AccessError>;

    #[doc(hidden)]
    fn driver<'g>(guards: &'g Self::Guards<'_>) -> &'g [EntityID];

    #[doc(hidden)]
    fn fetch<'g>(guards: &'g mut Self::Guards<'_>, entity: EntityID) -> Option<Self::Item<'g>>;
}

macro_rules! impl_query {
    ($($name:ident),+) => {
        impl<$($name: Fetch),+> Query for ($($name,)+) {
            type Guards<'a> = ($($name::Guard<'a>,)+);
            type Item<'g> = ($($name::Item<'g>,)+);

            fn acquire<'a>(scope: &Scope<'a>) -> Result<Self::Guards<'a>, AccessError> {
                Ok(($($name::acquire(scope)?,)+))
            }

            #[allow(non_snake_case)]
            fn driver<'g>(guards: &'g Self::Guards<'_>) -> &'g [EntityID] {
                let ($($name,)+) = guards;
                let mut smallest: Option<&'g [EntityID]> = None;
                $(
                    let owners = $name::owners($name);
                    if smallest.map_or(true, |s| owners.len() < s.len()) {
                        smallest = Some(owners);
                    }
                )+
                smallest.unwrap_or(&[])
            }

            #[allow(non_snake_case)]
            fn fetch<'g>(guards: &'g mut Self::Guards<'_>, entity: EntityID) -> Option<Self::Item<'g>> {
                let ($($name,)+) = guards;
                Some(($($name::fetch($name, entity)?,)+))
            }
        }
    };
}

impl_query!(A);
impl_query!(A, B);
impl_query!(A, B, C);
impl_query!(A, B, C, D);

/// The result of running a query: the borrows plus any exclusion filters.
pub struct View<'a, Q: Query> {
    scope: Scope<'a>,
    guards: Q::Guards<'a>,
    excluded: Vec<ErasedPoolRef<'a>>,
}

impl<'a, Q: Query> View<'a, Q> {
    pub(crate) fn new(scope: Scope<'a>) -> Result<View<'a, Q>, AccessError> {
        let guards = Q::acquire(&scope)?;
        Ok(View {
            scope,
            guards,
            excluded: Vec::new(),
        })
    }

    /// Skip entities that have a `T`.
    ///
    /// Inside a task, `T` must be declared as read.
    pub fn without<T: Component>(mut self) -> Result<View<'a, Q>, AccessError> {
        let excluded = self.scope.read_erased::<T>()?;
        self.excluded.push(excluded);
        Ok(self)
    }

    fn candidates(&self) -> Vec<EntityID> {
        Q::driver(&self.guards)
            .iter()
            .copied()
            .filter(|entity| !self.excluded.iter().any(|pool| pool.contains(*entity)))
            .collect()
    }

    /// Call `f` for every matching entity.
    pub fn for_each<F>(&mut self, mut f: F)
        where F: for<'g> FnMut(EntityID, Q::Item<'g>)
    {
        for entity in self.candidates() {
            if let Some(item) = Q::fetch(&mut self.guards, entity) {
                f(entity, item);
            }
        }
    }

    /// Call `f` for every matching entity, stopping at the first error.
    pub fn try_for_each<F, E>(&mut self, mut f: F) -> Result<(), E>
        where F: for<'g> FnMut(EntityID, Q::Item<'g>) -> Result<(), E>
    {
        for entity in self.candidates() {
            if let Some(item) = Q::fetch(&mut self.guards, entity) {
                f(entity, item)?;
            }
        }
        Ok(())
    }

    /// Collect the ids of every matching entity.
    pub fn entities(&mut self) -> Vec<EntityID> {
        let mut entities = self.candidates();
        entities.retain(|entity| Q::fetch(&mut self.guards, *entity).is_some());
        entities
    }

    /// The number of matching entities.
    pub fn count(&mut self) -> usize {
        self.entities().len()
    }

    /// Fetch the components of a single entity, if it matches.
    pub fn get(&mut self, entity: EntityID) -> Option<Q::Item<'_>> {
        if self.excluded.iter().any(|pool| pool.contains(entity)) {
            return None;
        }
        Q::fetch(&mut self.guards, entity)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::component::TypeRegistry;
    use crate::error::StoreError;
    use crate::store::Store;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    struct A(u32);
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    struct B(u32);
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    struct Tag;

    fn store() -> Store {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<A>("a").unwrap();
        registry.register::<B>("b").unwrap();
        registry.register::<Tag>("tag").unwrap();
        registry.seal();
        Store::new(registry).unwrap()
    }

    #[test]
    fn test_intersection() {
        let mut store = store();
        let ids = store.create_entities(10);
        for (i, e) in ids.iter().enumerate() {
            store.add_component(*e, A(i as u32)).unwrap();
            if i % 2 == 0 {
                store.add_component(*e, B(1)).unwrap();
            }
        }

        let mut view = store.query::<(Write<A>, Read<B>)>().unwrap();
        assert_eq!(view.count(), 5);
        view.for_each(|_, (a, b)| a.0 += b.0 * 100);
        drop(view);

        assert_eq!(store.get::<A>(ids[0]).unwrap().0, 100);
        assert_eq!(store.get::<A>(ids[1]).unwrap().0, 1);
    }

    #[test]
    fn test_order_follows_smallest_pool() {
        let mut store = store();
        let ids = store.create_entities(4);
        for e in &ids {
            store.add_component(*e, A(0)).unwrap();
        }
        store.add_component(ids[3], B(0)).unwrap();
        store.add_component(ids[1], B(0)).unwrap();

        let found = store.query::<(Read<A>, Read<B>)>().unwrap().entities();
        assert_eq!(found, vec![ids[3], ids[1]]);
    }

    #[test]
    fn test_without() {
        let mut store = store();
        let ids = store.create_entities(3);
        for e in &ids {
            store.add_component(*e, A(0)).unwrap();
        }
        store.add_component(ids[1], Tag).unwrap();

        let mut view = store.query::<(Read<A>,)>().unwrap().without::<Tag>().unwrap();
        assert_eq!(view.entities(), vec![ids[0], ids[2]]);
        assert!(view.get(ids[1]).is_none());
        assert!(view.get(ids[0]).is_some());
    }

    #[test]
    fn test_same_type_twice_is_contended() {
        let mut store = store();
        match store.query::<(Write<A>, Read<A>)>() {
            Err(StoreError::Access(AccessError::Contended { component })) => assert_eq!(component, "a"),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("query should not succeed"),
        };
    }

    #[test]
    fn test_try_for_each_stops() {
        let mut store = store();
        let ids = store.create_entities(5);
        for e in &ids {
            store.add_component(*e, A(0)).unwrap();
        }

        let mut visited = 0;
        let result = store.query::<(Write<A>,)>().unwrap().try_for_each(|_, (a,)| {
            if visited == 2 {
                return Err("stop");
            }
            a.0 = 1;
            visited += 1;
            Ok(())
        });

        assert_eq!(result, Err("stop"));
        assert_eq!(store.pool::<A>().unwrap().iter().filter(|(_, a)| a.0 == 1).count(), 2);
    }
}

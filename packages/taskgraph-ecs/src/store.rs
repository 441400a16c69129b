//! The component store.
//!
//! A `Store` owns the entity table and one pool per registered component
//! type. Each pool sits behind its own lock so that tasks touching disjoint
//! component types can run side by side. Task code only ever *tries* these
//! locks: a scheduled frame never contends them, so a contended lock is
//! reported as an error instead of blocking.
//!
//! Outside of a frame the store is driven directly through `&mut self`,
//! which needs no locking at all.
//!
//! Resources, single values registered with `TypeRegistry::register_resource`,
//! get one slot each with the same locking rules as pools.

use std::any::{type_name, Any};
use std::fmt::{self, Debug};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{
    MappedRwLockReadGuard,
    MappedRwLockWriteGuard,
    RwLock,
    RwLockReadGuard,
    RwLockWriteGuard,
};

use crate::access::Access;
use crate::component::{Component, ComponentTypeID, StorageKind, TypeRegistry};
use crate::entity::{EntityAllocator, EntityID};
use crate::error::{AccessError, StoreError};
use crate::pool::{AnyPool, ComponentPool};
use crate::query::{Query, View};

type PoolLock = RwLock<Box<dyn AnyPool>>;
type ResourceLock = RwLock<Option<Box<dyn Any + Send + Sync>>>;

/// Holds every entity, component and resource.
pub struct Store {
    registry: Arc<TypeRegistry>,
    entities: RwLock<EntityAllocator>,
    pools: Vec<Option<PoolLock>>,
    resources: Vec<Option<ResourceLock>>,
}

impl Store {
    /// Create an empty store with one pool per registered type.
    ///
    /// The registry must already be sealed.
    pub fn new(registry: Arc<TypeRegistry>) -> Result<Store, StoreError> {
        if !registry.is_sealed() {
            return Err(StoreError::RegistryNotSealed);
        }

        let registrations = registry.registrations();
        let pools = registrations.iter()
            .map(|registration| registration.new_pool().map(RwLock::new))
            .collect();
        let resources = registrations.iter()
            .map(|registration| match registration.kind() {
                StorageKind::Resource => Some(RwLock::new(None)),
                _ => None,
            })
            .collect();

        Ok(Store {
            registry,
            entities: RwLock::new(EntityAllocator::new()),
            pools,
            resources,
        })
    }

    /// The registry this store was built from.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    fn component_id<T: Component>(&self) -> Result<ComponentTypeID, StoreError> {
        self.registry.id_of::<T>()
            .filter(|id| self.pool_lock(*id).is_some())
            .ok_or(StoreError::Unregistered { type_name: type_name::<T>() })
    }

    fn pool_lock(&self, id: ComponentTypeID) -> Option<&PoolLock> {
        self.pools.get(id.id()).and_then(Option::as_ref)
    }

    fn resource_lock<R: Component>(&self) -> Result<(ComponentTypeID, &ResourceLock), StoreError> {
        self.registry.id_of::<R>()
            .and_then(|id| Some((id, self.resources.get(id.id())?.as_ref()?)))
            .ok_or(StoreError::Unregistered { type_name: type_name::<R>() })
    }

    fn missing(&self, id: ComponentTypeID) -> StoreError {
        StoreError::MissingResource { resource: self.registry.name_of(id) }
    }

    /// Create a new, empty entity.
    pub fn create_entity(&mut self) -> EntityID {
        self.entities.get_mut().allocate()
    }

    /// Create `count` empty entities at once.
    pub fn create_entities(&mut self, count: usize) -> Vec<EntityID> {
        let entities = self.entities.get_mut();
        (0..count).map(|_| entities.allocate()).collect()
    }

    /// Destroy an entity and all of its components.
    ///
    /// Returns false if the entity was already dead.
    pub fn destroy_entity(&mut self, entity: EntityID) -> bool {
        let entities = self.entities.get_mut();
        if !entities.is_alive(entity) {
            return false;
        }

        for pool in self.pools.iter_mut().flatten() {
            pool.get_mut().remove_entity(entity);
        }
        entities.free(entity)
    }

    /// Returns true if the entity is alive.
    pub fn is_alive(&self, entity: EntityID) -> bool {
        self.entities.read().is_alive(entity)
    }

    /// The number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    /// Every live entity, in index order.
    pub fn entities(&self) -> Vec<EntityID> {
        self.entities.read().iter().collect()
    }

    /// Attach a component to an entity, returning the value it replaced.
    pub fn add_component<T: Component>(&mut self, entity: EntityID, value: T) -> Result<Option<T>, StoreError> {
        if !self.entities.get_mut().is_alive(entity) {
            return Err(StoreError::StaleEntity(entity));
        }

        Ok(self.pool_mut::<T>()?.insert(entity, value))
    }

    /// Detach a component from an entity.
    ///
    /// This moves the last component of the pool into the freed slot.
    pub fn remove_component<T: Component>(&mut self, entity: EntityID) -> Option<T> {
        self.pool_mut::<T>().ok()?.remove(entity)
    }

    /// Borrow the component of an entity.
    pub fn get<T: Component>(&self, entity: EntityID) -> Option<ComponentRef<'_, T>> {
        let pool = self.pool::<T>().ok()?;
        MappedRwLockReadGuard::try_map(pool.0, |pool| pool.get(entity))
            .ok()
            .map(ComponentRef)
    }

    /// Mutably borrow the component of an entity.
    pub fn get_mut<T: Component>(&mut self, entity: EntityID) -> Option<&mut T> {
        self.pool_mut::<T>().ok()?.get_mut(entity)
    }

    /// Returns true if the entity is alive and has a `T`.
    pub fn has<T: Component>(&self, entity: EntityID) -> bool {
        self.pool::<T>().map_or(false, |pool| pool.contains(entity))
    }

    /// Borrow the whole pool of `T`.
    pub fn pool<T: Component>(&self) -> Result<PoolRef<'_, T>, StoreError> {
        let id = self.component_id::<T>()?;
        let lock = self.pool_lock(id)
            .ok_or(StoreError::Unregistered { type_name: std::any::type_name::<T>() })?;
        PoolRef::from_guard(lock.read()).map_err(Into::into)
    }

    /// Mutably borrow the whole pool of `T`.
    pub fn pool_mut<T: Component>(&mut self) -> Result<&mut ComponentPool<T>, StoreError> {
        let id = self.component_id::<T>()?;
        let unregistered = StoreError::Unregistered { type_name: std::any::type_name::<T>() };
        self.pools.get_mut(id.id())
            .and_then(Option::as_mut)
            .and_then(|pool| pool.get_mut().as_any_mut().downcast_mut::<ComponentPool<T>>())
            .ok_or(unregistered)
    }

    /// Iterate over every entity that has all of the components in `Q`.
    pub fn query<Q: Query>(&mut self) -> Result<View<'_, Q>, StoreError> {
        Scope::unrestricted(self).query::<Q>().map_err(Into::into)
    }

    /// Set the value of resource `R`, returning the value it replaced.
    pub fn insert_resource<R: Component>(&mut self, value: R) -> Result<Option<R>, StoreError> {
        let (_, lock) = self.resource_lock::<R>()?;
        let previous = lock.write().replace(Box::new(value));
        Ok(previous.and_then(|old| old.downcast::<R>().ok()).map(|old| *old))
    }

    /// Take resource `R` out of the store.
    pub fn remove_resource<R: Component>(&mut self) -> Option<R> {
        let (_, lock) = self.resource_lock::<R>().ok()?;
        let value = lock.write().take()?;
        value.downcast::<R>().ok().map(|value| *value)
    }

    /// Returns true if resource `R` has a value.
    pub fn has_resource<R: Component>(&self) -> bool {
        self.resource_lock::<R>().map_or(false, |(_, lock)| lock.read().is_some())
    }

    /// Borrow resource `R`.
    pub fn resource<R: Component>(&self) -> Result<ResourceRef<'_, R>, StoreError> {
        let (id, lock) = self.resource_lock::<R>()?;
        ResourceRef::from_guard(lock.read()).ok_or_else(|| self.missing(id))
    }

    /// Mutably borrow resource `R`.
    pub fn resource_mut<R: Component>(&mut self) -> Result<&mut R, StoreError> {
        let (id, _) = self.resource_lock::<R>()?;
        let missing = self.missing(id);
        self.resources[id.id()].as_mut()
            .and_then(|lock| lock.get_mut().as_mut())
            .and_then(|value| value.downcast_mut::<R>())
            .ok_or(missing)
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Store {} entities, {} pools, {} resources>",
               self.entities.read().len(),
               self.pools.iter().flatten().count(),
               self.resources.iter().flatten().count())
    }
}

/// A shared borrow of a resource.
pub struct ResourceRef<'a, R>(MappedRwLockReadGuard<'a, R>);

impl<'a, R: Component> ResourceRef<'a, R> {
    fn from_guard(guard: RwLockReadGuard<'a, Option<Box<dyn Any + Send + Sync>>>) -> Option<ResourceRef<'a, R>> {
        RwLockReadGuard::try_map(guard, |slot| slot.as_ref()?.downcast_ref::<R>())
            .ok()
            .map(ResourceRef)
    }
}

impl<'a, R> Deref for ResourceRef<'a, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.0
    }
}

impl<'a, R: Debug> Debug for ResourceRef<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// An exclusive borrow of a resource.
pub struct ResourceMut<'a, R>(MappedRwLockWriteGuard<'a, R>);

impl<'a, R: Component> ResourceMut<'a, R> {
    fn from_guard(guard: RwLockWriteGuard<'a, Option<Box<dyn Any + Send + Sync>>>) -> Option<ResourceMut<'a, R>> {
        RwLockWriteGuard::try_map(guard, |slot| slot.as_mut()?.downcast_mut::<R>())
            .ok()
            .map(ResourceMut)
    }
}

impl<'a, R> Deref for ResourceMut<'a, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.0
    }
}

impl<'a, R> DerefMut for ResourceMut<'a, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.0
    }
}

impl<'a, R: Debug> Debug for ResourceMut<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// A shared borrow of a single component.
pub struct ComponentRef<'a, T>(MappedRwLockReadGuard<'a, T>);

impl<'a, T> Deref for ComponentRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<'a, T: Debug> Debug for ComponentRef<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// A shared borrow of a component pool.
pub struct PoolRef<'a, T>(MappedRwLockReadGuard<'a, ComponentPool<T>>);

impl<'a, T: Component> PoolRef<'a, T> {
    fn from_guard(guard: RwLockReadGuard<'a, Box<dyn AnyPool>>) -> Result<PoolRef<'a, T>, AccessError> {
        RwLockReadGuard::try_map(guard, |pool| pool.as_any().downcast_ref::<ComponentPool<T>>())
            .map(PoolRef)
            .map_err(|_| AccessError::Unregistered { type_name: std::any::type_name::<T>() })
    }
}

impl<'a, T> Deref for PoolRef<'a, T> {
    type Target = ComponentPool<T>;

    fn deref(&self) -> &ComponentPool<T> {
        &self.0
    }
}

/// An exclusive borrow of a component pool.
pub struct PoolMut<'a, T>(MappedRwLockWriteGuard<'a, ComponentPool<T>>);

impl<'a, T: Component> PoolMut<'a, T> {
    fn from_guard(guard: RwLockWriteGuard<'a, Box<dyn AnyPool>>) -> Result<PoolMut<'a, T>, AccessError> {
        RwLockWriteGuard::try_map(guard, |pool| pool.as_any_mut().downcast_mut::<ComponentPool<T>>())
            .map(PoolMut)
            .map_err(|_| AccessError::Unregistered { type_name: std::any::type_name::<T>() })
    }
}

impl<'a, T> Deref for PoolMut<'a, T> {
    type Target = ComponentPool<T>;

    fn deref(&self) -> &ComponentPool<T> {
        &self.0
    }
}

impl<'a, T> DerefMut for PoolMut<'a, T> {
    fn deref_mut(&mut self) -> &mut ComponentPool<T> {
        &mut self.0
    }
}

/// A type-erased shared borrow of a pool, used for exclusion filters.
pub(crate) struct ErasedPoolRef<'a>(RwLockReadGuard<'a, Box<dyn AnyPool>>);

impl<'a> ErasedPoolRef<'a> {
    pub(crate) fn contains(&self, entity: EntityID) -> bool {
        self.0.contains_entity(entity)
    }
}

/// The rules under which pools are handed out.
///
/// Task code gets a scope restricted to its declared access. The
/// unrestricted scope is only built from `&mut Store`.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'a> {
    store: &'a Store,
    permit: Option<(&'a str, &'a Access)>,
}

impl<'a> Scope<'a> {
    pub(crate) fn unrestricted(store: &'a mut Store) -> Scope<'a> {
        Scope { store, permit: None }
    }

    pub(crate) fn restricted(store: &'a Store, task: &'a str, access: &'a Access) -> Scope<'a> {
        Scope { store, permit: Some((task, access)) }
    }

    pub(crate) fn store(&self) -> &'a Store {
        self.store
    }

    pub(crate) fn id_of<T: Component>(&self) -> Result<ComponentTypeID, AccessError> {
        self.store.component_id::<T>()
            .map_err(|_| AccessError::Unregistered { type_name: std::any::type_name::<T>() })
    }

    fn check(&self, id: ComponentTypeID, write: bool) -> Result<(), AccessError> {
        let (task, access) = match self.permit {
            Some(permit) => permit,
            None => return Ok(()),
        };

        let allowed = if write { access.can_write(id) } else { access.can_read(id) };
        if allowed {
            Ok(())
        } else {
            Err(AccessError::Undeclared {
                task: task.to_owned(),
                component: self.store.registry.name_of(id),
                mode: if write { "write" } else { "read" },
            })
        }
    }

    fn lock(&self, id: ComponentTypeID) -> Result<&'a PoolLock, AccessError> {
        self.store.pool_lock(id)
            .ok_or_else(|| AccessError::Unregistered { type_name: "entity" })
    }

    fn contended(&self, id: ComponentTypeID) -> AccessError {
        AccessError::Contended { component: self.store.registry.name_of(id) }
    }

    /// Borrow the pool of `T` for reading.
    pub(crate) fn read<T: Component>(&self) -> Result<PoolRef<'a, T>, AccessError> {
        let id = self.id_of::<T>()?;
        self.check(id, false)?;
        let guard = self.lock(id)?.try_read().ok_or_else(|| self.contended(id))?;
        PoolRef::from_guard(guard)
    }

    /// Borrow the pool of `T` for writing.
    pub(crate) fn write<T: Component>(&self) -> Result<PoolMut<'a, T>, AccessError> {
        let id = self.id_of::<T>()?;
        self.check(id, true)?;
        let guard = self.lock(id)?.try_write().ok_or_else(|| self.contended(id))?;
        PoolMut::from_guard(guard)
    }

    /// Borrow the pool of `T` for membership checks only.
    pub(crate) fn read_erased<T: Component>(&self) -> Result<ErasedPoolRef<'a>, AccessError> {
        let id = self.id_of::<T>()?;
        self.check(id, false)?;
        let guard = self.lock(id)?.try_read().ok_or_else(|| self.contended(id))?;
        Ok(ErasedPoolRef(guard))
    }

    /// Lock the entity table for structural changes.
    pub(crate) fn structure(&self) -> Result<Structure<'a>, AccessError> {
        if let Some((task, access)) = self.permit {
            if !access.is_structural() {
                return Err(AccessError::NotStructural { task: task.to_owned() });
            }
        }

        let entities = self.store.entities.try_write()
            .ok_or_else(|| self.contended(ComponentTypeID::ENTITY))?;
        Ok(Structure { store: self.store, entities })
    }

    pub(crate) fn query<Q: Query>(&self) -> Result<View<'a, Q>, AccessError> {
        View::new(*self)
    }

    fn resource_lock<R: Component>(&self) -> Result<(ComponentTypeID, &'a ResourceLock), AccessError> {
        self.store.resource_lock::<R>()
            .map_err(|_| AccessError::Unregistered { type_name: type_name::<R>() })
    }

    fn missing(&self, id: ComponentTypeID) -> AccessError {
        AccessError::MissingResource { resource: self.store.registry.name_of(id) }
    }

    /// Borrow resource `R` for reading.
    pub(crate) fn resource<R: Component>(&self) -> Result<ResourceRef<'a, R>, AccessError> {
        let (id, lock) = self.resource_lock::<R>()?;
        self.check(id, false)?;
        let guard = lock.try_read().ok_or_else(|| self.contended(id))?;
        ResourceRef::from_guard(guard).ok_or_else(|| self.missing(id))
    }

    /// Borrow resource `R` for writing.
    pub(crate) fn resource_mut<R: Component>(&self) -> Result<ResourceMut<'a, R>, AccessError> {
        let (id, lock) = self.resource_lock::<R>()?;
        self.check(id, true)?;
        let guard = lock.try_write().ok_or_else(|| self.contended(id))?;
        ResourceMut::from_guard(guard).ok_or_else(|| self.missing(id))
    }
}

/// Exclusive access to the entity table from inside a structural task.
///
/// Creating and destroying entities, and adding or removing components,
/// all go through here while a frame is running.
pub struct Structure<'a> {
    store: &'a Store,
    entities: RwLockWriteGuard<'a, EntityAllocator>,
}

impl<'a> Structure<'a> {
    fn write_pool<T: Component>(&self) -> Result<PoolMut<'a, T>, StoreError> {
        let id = self.store.component_id::<T>()?;
        let lock = self.store.pool_lock(id)
            .ok_or(StoreError::Unregistered { type_name: std::any::type_name::<T>() })?;
        let guard = lock.try_write()
            .ok_or_else(|| AccessError::Contended { component: self.store.registry.name_of(id) })?;
        Ok(PoolMut::from_guard(guard)?)
    }

    /// Create a new, empty entity.
    pub fn create_entity(&mut self) -> EntityID {
        self.entities.allocate()
    }

    /// Create `count` empty entities at once.
    pub fn create_entities(&mut self, count: usize) -> Vec<EntityID> {
        (0..count).map(|_| self.entities.allocate()).collect()
    }

    /// Destroy an entity and all of its components.
    ///
    /// Fails without destroying anything if the task itself still holds a
    /// borrow of one of the pools.
    pub fn destroy_entity(&mut self, entity: EntityID) -> Result<bool, AccessError> {
        if !self.entities.is_alive(entity) {
            return Ok(false);
        }

        let mut guards = Vec::with_capacity(self.store.pools.len());
        for (idx, pool) in self.store.pools.iter().enumerate() {
            if let Some(pool) = pool {
                let guard = pool.try_write().ok_or_else(|| AccessError::Contended {
                    component: self.store.registry.name_of(ComponentTypeID::new(idx)),
                })?;
                guards.push(guard);
            }
        }

        for guard in guards.iter_mut() {
            guard.remove_entity(entity);
        }
        Ok(self.entities.free(entity))
    }

    /// Returns true if the entity is alive.
    pub fn is_alive(&self, entity: EntityID) -> bool {
        self.entities.is_alive(entity)
    }

    /// Attach a component to an entity, returning the value it replaced.
    pub fn add_component<T: Component>(&mut self, entity: EntityID, value: T) -> Result<Option<T>, StoreError> {
        if !self.entities.is_alive(entity) {
            return Err(StoreError::StaleEntity(entity));
        }

        Ok(self.write_pool::<T>()?.insert(entity, value))
    }

    /// Detach a component from an entity.
    pub fn remove_component<T: Component>(&mut self, entity: EntityID) -> Result<Option<T>, StoreError> {
        Ok(self.write_pool::<T>()?.remove(entity))
    }
}

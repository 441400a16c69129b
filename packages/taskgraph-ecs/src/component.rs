//! Base definitions for components and the type registry.
//!
//! All entities in this library are built out of components. There is no
//! intrinsic value to an entity. Component types are registered once, at
//! startup, with a `TypeRegistry`, which hands out a compact
//! `ComponentTypeID` per type. Once every type is registered the registry is
//! sealed; from then on it is immutable and can be read from any thread
//! without taking a lock.
//!
//! Resources, single shared values that are not attached to any entity,
//! are registered with the same registry and share the id space, so tasks
//! declare and conflict over them exactly like components.
//!
//! ```
//! use std::sync::Arc;
//! use taskgraph_ecs::TypeRegistry;
//!
//! #[derive(Debug, Clone, Copy, Default)]
//! struct Position(f32, f32);
//!
//! let registry = Arc::new(TypeRegistry::new());
//! let id = registry.register::<Position>("position").unwrap();
//! registry.seal();
//! assert_eq!(registry.lookup("position"), Some(id));
//! ```

use std::alloc::Layout;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::entity::EntityID;
use crate::error::RegistryError;
use crate::pool::{new_pool, AnyPool};

/// Anything that can be stored in a component pool.
///
/// Components are shared between worker threads, so they must be
/// `Send + Sync`.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// A component type ID which is unique for a specific component type within
/// one registry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeID(usize);

impl ComponentTypeID {
    /// The pseudo-component standing for the entity table itself.
    ///
    /// Every task touching components implicitly reads it, and structural
    /// tasks write it.
    pub const ENTITY: ComponentTypeID = ComponentTypeID(0);

    /// Construct a new `ComponentTypeID` from the inner value.
    pub(crate) fn new(inner: usize) -> ComponentTypeID {
        ComponentTypeID(inner)
    }

    /// Return the inner unique ID.
    pub fn id(&self) -> usize {
        self.0
    }
}

impl Debug for ComponentTypeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeID(#{})", self.0)
    }
}

/// What a registered type id stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// The entity table itself.
    Entity,
    /// A per-entity component stored in a pool.
    Component,
    /// A single shared value held by the store.
    Resource,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Entity => "entity table",
            StorageKind::Component => "component",
            StorageKind::Resource => "resource",
        })
    }
}

type PoolFactory = fn() -> Box<dyn AnyPool>;

/// A ComponentRegistration is the dynamic description of a registered type.
#[derive(Clone)]
pub struct ComponentRegistration {
    type_id: ComponentTypeID,
    rust_type: TypeId,
    layout: Layout,
    name: String,
    type_name: &'static str,
    kind: StorageKind,
    new_pool: Option<PoolFactory>,
}

impl ComponentRegistration {
    fn new<T: 'static>(type_id: ComponentTypeID, name: String, kind: StorageKind, new_pool: Option<PoolFactory>) -> ComponentRegistration {
        ComponentRegistration {
            type_id,
            rust_type: TypeId::of::<T>(),
            layout: Layout::new::<T>(),
            name,
            type_name: type_name::<T>(),
            kind,
            new_pool,
        }
    }

    /// Return the unique type ID for this registration.
    pub fn type_id(&self) -> ComponentTypeID {
        self.type_id
    }

    /// Return the `TypeId` of the registered Rust type.
    pub fn rust_type(&self) -> TypeId {
        self.rust_type
    }

    /// Return the memory layout of a single instance of this component.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Size of one instance in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Alignment of one instance in bytes.
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Get the registered name of this component type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the Rust type name of this component type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether this id names a component, a resource or the entity table.
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Create empty storage for this component type.
    ///
    /// The entity pseudo-component has no pool.
    pub(crate) fn new_pool(&self) -> Option<Box<dyn AnyPool>> {
        self.new_pool.map(|f| f())
    }
}

impl Debug for ComponentRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<ComponentRegistration #{} {} {} ({} bytes, align {})>",
               self.type_id.0, self.kind, self.name, self.size(), self.align())
    }
}

#[derive(Default)]
struct Registrations {
    by_id: Vec<Arc<ComponentRegistration>>,
    by_type: HashMap<TypeId, ComponentTypeID>,
    by_name: HashMap<String, ComponentTypeID>,
}

impl Registrations {
    fn with_entity() -> Registrations {
        let mut r = Registrations::default();
        let registration = ComponentRegistration::new::<EntityID>(
            ComponentTypeID::ENTITY, "entity".to_owned(), StorageKind::Entity, None);
        r.by_type.insert(registration.rust_type, ComponentTypeID::ENTITY);
        r.by_name.insert(registration.name.clone(), ComponentTypeID::ENTITY);
        r.by_id.push(Arc::new(registration));
        r
    }
}

/// The registry of component types.
///
/// Registration happens behind a lock during startup. `seal()` moves the
/// registrations into an immutable snapshot; every read after that is
/// lock-free and registration is refused.
pub struct TypeRegistry {
    building: RwLock<Registrations>,
    sealed: OnceCell<Registrations>,
}

impl TypeRegistry {
    /// Create a new registry containing only the entity pseudo-component.
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            building: RwLock::new(Registrations::with_entity()),
            sealed: OnceCell::new(),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Registrations) -> R) -> R {
        if let Some(sealed) = self.sealed.get() {
            return f(sealed);
        }

        let building = self.building.read();
        match self.sealed.get() {
            Some(sealed) => f(sealed),
            None => f(&building),
        }
    }

    /// Register component type `T` under `name`.
    ///
    /// Registering a type twice returns the id it already has, before or
    /// after the seal.
    pub fn register<T: Component>(&self, name: impl Into<String>) -> Result<ComponentTypeID, RegistryError> {
        self.register_as::<T>(name.into(), StorageKind::Component)
    }

    /// Register resource type `R` under `name`.
    ///
    /// Resources live in the same id space as components, so tasks declare
    /// them with `Task::read` and `Task::write` too.
    pub fn register_resource<R: Component>(&self, name: impl Into<String>) -> Result<ComponentTypeID, RegistryError> {
        self.register_as::<R>(name.into(), StorageKind::Resource)
    }

    fn existing<T: 'static>(r: &Registrations, kind: StorageKind) -> Option<Result<ComponentTypeID, RegistryError>> {
        let id = *r.by_type.get(&TypeId::of::<T>())?;
        let registered = r.by_id[id.0].kind;
        Some(if id == ComponentTypeID::ENTITY {
            Err(RegistryError::Reserved { type_name: type_name::<T>() })
        } else if registered != kind {
            Err(RegistryError::WrongKind { type_name: type_name::<T>(), registered })
        } else {
            Ok(id)
        })
    }

    fn register_as<T: Component>(&self, name: String, kind: StorageKind) -> Result<ComponentTypeID, RegistryError> {
        if let Some(sealed) = self.sealed.get() {
            return TypeRegistry::existing::<T>(sealed, kind)
                .unwrap_or(Err(RegistryError::Sealed { name }));
        }

        let mut building = self.building.write();
        // Sealing may have happened while waiting for the lock.
        if let Some(sealed) = self.sealed.get() {
            return TypeRegistry::existing::<T>(sealed, kind)
                .unwrap_or(Err(RegistryError::Sealed { name }));
        }

        if let Some(existing) = TypeRegistry::existing::<T>(&building, kind) {
            return existing;
        }

        if let Some(existing) = building.by_name.get(&name) {
            return Err(RegistryError::DuplicateName {
                existing: building.by_id[existing.0].type_name,
                requested: type_name::<T>(),
                name,
            });
        }

        let id = ComponentTypeID(building.by_id.len());
        let new_pool = match kind {
            StorageKind::Component => Some(new_pool::<T> as PoolFactory),
            _ => None,
        };
        let registration = ComponentRegistration::new::<T>(id, name.clone(), kind, new_pool);
        building.by_type.insert(TypeId::of::<T>(), id);
        building.by_name.insert(name, id);
        building.by_id.push(Arc::new(registration));
        tracing::trace!(name = %building.by_id[id.0].name, id = id.0, %kind, "registered type");
        Ok(id)
    }

    /// Freeze the registry. Registering a new type afterwards fails with
    /// `RegistryError::Sealed`.
    ///
    /// Sealing twice is harmless.
    pub fn seal(&self) {
        let mut building = self.building.write();
        if self.sealed.get().is_some() {
            return;
        }

        let registrations = std::mem::take(&mut *building);
        tracing::debug!(components = registrations.by_id.len(), "sealed type registry");
        // The write lock serialises sealing, so the cell is still empty here.
        let _ = self.sealed.set(registrations);
    }

    /// Returns true once `seal()` has been called.
    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Find a component type by registered name.
    pub fn lookup(&self, name: &str) -> Option<ComponentTypeID> {
        self.read(|r| r.by_name.get(name).copied())
    }

    /// Find the id of Rust type `T`, if registered.
    pub fn id_of<T: 'static>(&self) -> Option<ComponentTypeID> {
        self.id_of_type(TypeId::of::<T>())
    }

    /// Find the id of a Rust `TypeId`, if registered.
    pub fn id_of_type(&self, type_id: TypeId) -> Option<ComponentTypeID> {
        self.read(|r| r.by_type.get(&type_id).copied())
    }

    /// Fetch the registration of a component type.
    pub fn describe(&self, id: ComponentTypeID) -> Option<Arc<ComponentRegistration>> {
        self.read(|r| r.by_id.get(id.0).cloned())
    }

    /// What kind of storage an id stands for.
    pub fn kind_of(&self, id: ComponentTypeID) -> Option<StorageKind> {
        self.read(|r| r.by_id.get(id.0).map(|registration| registration.kind))
    }

    /// Registered name of a component type, or a placeholder if unknown.
    pub fn name_of(&self, id: ComponentTypeID) -> String {
        self.read(|r| match r.by_id.get(id.0) {
            Some(registration) => registration.name.clone(),
            None => format!("#{} missing", id.0),
        })
    }

    /// The number of registered types, the entity pseudo-component included.
    pub fn len(&self) -> usize {
        self.read(|r| r.by_id.len())
    }

    /// Returns true if only the entity pseudo-component is registered.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Every registration in id order.
    pub fn registrations(&self) -> Vec<Arc<ComponentRegistration>> {
        self.read(|r| r.by_id.clone())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

impl Debug for TypeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<TypeRegistry {} types{}>", self.len(), if self.is_sealed() { ", sealed" } else { "" })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    struct A(u64);
    #[derive(Debug, Clone, Copy, Default)]
    struct B(u8);

    #[test]
    fn test_uniqueness() {
        let registry = TypeRegistry::new();
        let a = registry.register::<A>("a").unwrap();
        let b = registry.register::<B>("b").unwrap();

        assert_ne!(ComponentTypeID::ENTITY, a);
        assert_ne!(ComponentTypeID::ENTITY, b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reregister_is_noop() {
        let registry = TypeRegistry::new();
        let a = registry.register::<A>("a").unwrap();
        assert_eq!(registry.register::<A>("a").unwrap(), a);
        assert_eq!(registry.register::<A>("other").unwrap(), a);
        assert_eq!(registry.lookup("other"), None);
    }

    #[test]
    fn test_duplicate_name() {
        let registry = TypeRegistry::new();
        registry.register::<A>("thing").unwrap();
        match registry.register::<B>("thing") {
            Err(RegistryError::DuplicateName { name, .. }) => assert_eq!(name, "thing"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_seal() {
        let registry = TypeRegistry::new();
        let a = registry.register::<A>("a").unwrap();
        registry.seal();
        registry.seal();

        assert!(registry.is_sealed());
        assert_eq!(registry.lookup("a"), Some(a));
        assert_eq!(registry.id_of::<A>(), Some(a));
        assert_eq!(registry.register::<B>("b"), Err(RegistryError::Sealed { name: "b".into() }));
        assert_eq!(registry.register::<A>("a"), Ok(a));
        assert_eq!(registry.register::<A>("renamed"), Ok(a));
        assert_eq!(registry.lookup("renamed"), None);
    }

    #[test]
    fn test_entity_is_reserved() {
        let registry = TypeRegistry::new();
        assert!(matches!(registry.register::<EntityID>("x"), Err(RegistryError::Reserved { .. })));
        assert!(matches!(registry.register_resource::<EntityID>("x"), Err(RegistryError::Reserved { .. })));
        assert_eq!(registry.lookup("x"), None);

        registry.seal();
        assert!(matches!(registry.register::<EntityID>("x"), Err(RegistryError::Reserved { .. })));
    }

    #[test]
    fn test_resources_share_the_id_space() {
        let registry = TypeRegistry::new();
        let a = registry.register::<A>("a").unwrap();
        let b = registry.register_resource::<B>("b").unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.kind_of(a), Some(StorageKind::Component));
        assert_eq!(registry.kind_of(b), Some(StorageKind::Resource));
        assert_eq!(registry.kind_of(ComponentTypeID::ENTITY), Some(StorageKind::Entity));
        assert!(registry.describe(b).unwrap().new_pool().is_none());

        assert_eq!(registry.register_resource::<B>("b"), Ok(b));
        assert_eq!(
            registry.register::<B>("b"),
            Err(RegistryError::WrongKind { type_name: std::any::type_name::<B>(), registered: StorageKind::Resource }),
        );
    }

    #[test]
    fn test_describe() {
        let registry = TypeRegistry::new();
        let a = registry.register::<A>("a").unwrap();
        let desc = registry.describe(a).unwrap();

        assert_eq!(desc.name(), "a");
        assert_eq!(desc.size(), std::mem::size_of::<A>());
        assert_eq!(desc.align(), std::mem::align_of::<A>());
        assert!(desc.new_pool().is_some());
        assert!(registry.describe(ComponentTypeID::ENTITY).unwrap().new_pool().is_none());
    }
}

//! Component sets and declared access.
//!
//! A task's access is two bitsets over component type ids: what it reads and
//! what it writes. Two accesses conflict when either one writes a type the
//! other touches at all. Resources share the id space and follow the same
//! rule.

use std::fmt::{self, Debug};

use bit_vec::BitVec;

use crate::component::{ComponentTypeID, TypeRegistry};

/// A set of component types, stored as a bitset indexed by `ComponentTypeID`.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ComponentSet(BitVec);

impl ComponentSet {
    /// Create an empty set sized for `len` component types.
    pub fn with_capacity(len: usize) -> ComponentSet {
        ComponentSet(BitVec::from_elem(len, false))
    }

    /// Insert a component type into this set.
    pub fn insert(&mut self, component_type: ComponentTypeID) {
        let idx = component_type.id();
        if idx >= self.0.len() {
            let grow = idx + 1 - self.0.len();
            self.0.grow(grow, false);
        }
        self.0.set(idx, true);
    }

    /// Remove a component type from this set.
    pub fn remove(&mut self, component_type: ComponentTypeID) {
        if component_type.id() < self.0.len() {
            self.0.set(component_type.id(), false);
        }
    }

    /// Returns true if this set contains the given component type.
    pub fn includes(&self, component_type: ComponentTypeID) -> bool {
        self.0.get(component_type.id()).unwrap_or(false)
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.0.none()
    }

    /// The number of members.
    pub fn len(&self) -> usize {
        self.0.iter().filter(|x| *x).count()
    }

    /// Returns true if the sets share at least one member.
    pub fn intersects(&self, other: &ComponentSet) -> bool {
        self.0.blocks()
            .zip(other.0.blocks())
            .any(|(a, b)| a & b != 0)
    }

    /// Iterate over the members in id order.
    pub fn iter(&self) -> impl Iterator<Item=ComponentTypeID> + '_ {
        self.0.iter()
            .enumerate()
            .filter(|(_, set)| *set)
            .map(|(idx, _)| ComponentTypeID::new(idx))
    }
}

impl Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.id())).finish()
    }
}

impl FromIterator<ComponentTypeID> for ComponentSet {
    fn from_iter<I: IntoIterator<Item=ComponentTypeID>>(iter: I) -> Self {
        let mut set = ComponentSet::default();
        for component_type in iter {
            set.insert(component_type);
        }
        set
    }
}

/// The data a task may touch while it runs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Access {
    read: ComponentSet,
    write: ComponentSet,
}

impl Access {
    /// Build an access declaration.
    ///
    /// A type listed as both read and written is treated as written. Any
    /// component access also reads the entity table, and structural access
    /// writes it.
    pub fn new(
        reads: impl IntoIterator<Item=ComponentTypeID>,
        writes: impl IntoIterator<Item=ComponentTypeID>,
        structural: bool,
    ) -> Access {
        let mut read: ComponentSet = reads.into_iter().collect();
        let write: ComponentSet = writes.into_iter().collect();

        for component_type in write.iter() {
            read.remove(component_type);
        }

        let mut access = Access { read, write };
        if structural {
            access.read.remove(ComponentTypeID::ENTITY);
            access.write.insert(ComponentTypeID::ENTITY);
        } else if !access.read.is_empty() || !access.write.is_empty() {
            access.write.remove(ComponentTypeID::ENTITY);
            access.read.insert(ComponentTypeID::ENTITY);
        }

        access
    }

    /// Add resource access. Unlike components, resources do not touch the
    /// entity table.
    pub fn with_resources(
        mut self,
        reads: impl IntoIterator<Item=ComponentTypeID>,
        writes: impl IntoIterator<Item=ComponentTypeID>,
    ) -> Access {
        for resource in writes {
            self.read.remove(resource);
            self.write.insert(resource);
        }
        for resource in reads {
            if !self.write.includes(resource) {
                self.read.insert(resource);
            }
        }
        self
    }

    /// The first type this access touches in a way `bound` does not allow.
    pub fn excess_over(&self, bound: &Access) -> Option<ComponentTypeID> {
        self.write.iter()
            .find(|c| !bound.can_write(*c))
            .or_else(|| self.read.iter().find(|c| !bound.can_read(*c)))
    }

    /// Types read but not written.
    pub fn reads(&self) -> &ComponentSet {
        &self.read
    }

    /// Types written.
    pub fn writes(&self) -> &ComponentSet {
        &self.write
    }

    /// Returns true if the component type may be read (written types may also be read).
    pub fn can_read(&self, component_type: ComponentTypeID) -> bool {
        self.read.includes(component_type) || self.write.includes(component_type)
    }

    /// Returns true if the component type may be written.
    pub fn can_write(&self, component_type: ComponentTypeID) -> bool {
        self.write.includes(component_type)
    }

    /// Returns true if this access may create and destroy entities.
    pub fn is_structural(&self) -> bool {
        self.write.includes(ComponentTypeID::ENTITY)
    }

    /// Returns true if this access touches no component data at all.
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    /// Returns true if the two accesses may not run at the same time.
    pub fn conflicts_with(&self, other: &Access) -> bool {
        self.write.intersects(&other.write)
            || self.write.intersects(&other.read)
            || self.read.intersects(&other.write)
    }

    /// Render the access with registered names, e.g. `read [velocity] write [position]`.
    pub fn describe(&self, registry: &TypeRegistry) -> String {
        let names = |set: &ComponentSet| set.iter()
            .map(|c| registry.name_of(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!("read [{}] write [{}]", names(&self.read), names(&self.write))
    }
}

impl Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Access")
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

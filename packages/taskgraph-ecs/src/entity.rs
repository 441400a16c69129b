//! Entity identifiers and their allocator.
//!
//! An entity has no data of its own. It is an index into the allocator's
//! slot table plus the generation that slot had when the entity was created.
//! Destroying an entity bumps the slot's generation, so any copy of the old
//! id is detectably stale from then on.

use std::fmt;

/// A generation-checked entity handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityID {
    index: u32,
    generation: u32,
}

impl EntityID {
    /// Construct an id from its raw parts.
    pub(crate) fn new(index: u32, generation: u32) -> EntityID {
        EntityID { index, generation }
    }

    /// The slot index of this entity.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The generation of the slot when this id was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack the id into a single integer, generation in the high bits.
    pub fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack an id produced by `to_bits`.
    pub fn from_bits(bits: u64) -> EntityID {
        EntityID {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for EntityID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityID({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for EntityID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: u32,
    alive: bool,
}

/// Hands out entity ids and tracks which are alive.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl EntityAllocator {
    /// Create an empty allocator.
    pub fn new() -> EntityAllocator {
        EntityAllocator::default()
    }

    /// Allocate a new entity, reusing a freed slot where possible.
    pub fn allocate(&mut self) -> EntityID {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            return EntityID::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, alive: true });
        EntityID::new(index, 0)
    }

    /// Release an entity. Returns false if the id was already stale.
    pub fn free(&mut self, entity: EntityID) -> bool {
        match self.slots.get_mut(entity.index as usize) {
            Some(slot) if slot.alive && slot.generation == entity.generation => {
                slot.alive = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(entity.index);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns true if the id refers to a live entity of the right generation.
    pub fn is_alive(&self, entity: EntityID) -> bool {
        self.slots.get(entity.index as usize)
            .map_or(false, |slot| slot.alive && slot.generation == entity.generation)
    }

    /// The number of live entities.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if no entities are alive.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over every live entity in index order.
    pub fn iter(&self) -> impl Iterator<Item=EntityID> + '_ {
        self.slots.iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(index, slot)| EntityID::new(index as u32, slot.generation))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reuse_bumps_generation() {
        let mut entities = EntityAllocator::new();
        let a = entities.allocate();
        assert!(entities.free(a));
        let b = entities.allocate();

        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(!entities.is_alive(a));
        assert!(entities.is_alive(b));
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut entities = EntityAllocator::new();
        let a = entities.allocate();
        assert!(entities.free(a));
        assert!(!entities.free(a));
        assert_eq!(entities.len(), 0);
    }

    #[test]
    fn test_bits() {
        let id = EntityID::new(7, 3);
        assert_eq!(EntityID::from_bits(id.to_bits()), id);
        assert_eq!(id.to_string(), "#7v3");
    }
}

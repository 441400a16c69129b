//! Runtime check of declared access.
//!
//! The graph is supposed to make conflicting tasks run one after the other.
//! When access checks are on, each task claims its whole declared access in
//! this table before its body runs. A claim that collides with a task that
//! is still running means the graph let two conflicting tasks overlap, and
//! the late task is failed instead of run.
//!
//! Each component type maps to one `AtomicUsize`:
//!
//! | State  | Meaning                            |
//! |-------:|------------------------------------|
//! | `0`    | Unclaimed                          |
//! | `1`    | Claimed by one writer              |
//! | `>= 2` | Claimed by `state - 1` readers     |
//!
//! Claims never wait. There is nothing to wait for: a collision is a bug.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::access::Access;
use crate::component::ComponentTypeID;

const FREE: usize = 0;
const WRITER: usize = 1;

/// The claim table.
pub(crate) struct AccessGuard {
    states: Vec<AtomicUsize>,
}

impl AccessGuard {
    /// Create a table for `len` component types.
    pub fn new(len: usize) -> AccessGuard {
        AccessGuard {
            states: (0..len).map(|_| AtomicUsize::new(FREE)).collect(),
        }
    }

    fn state(&self, component_type: ComponentTypeID) -> Option<&AtomicUsize> {
        self.states.get(component_type.id())
    }

    fn try_read(&self, component_type: ComponentTypeID) -> bool {
        let state = match self.state(component_type) {
            Some(state) => state,
            None => return false,
        };

        let mut current = state.load(Ordering::Acquire);
        loop {
            if current == WRITER {
                return false;
            }

            let next = if current == FREE { 2 } else { current + 1 };
            match state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_read(&self, component_type: ComponentTypeID) {
        if let Some(state) = self.state(component_type) {
            let mut current = state.load(Ordering::Acquire);
            loop {
                debug_assert!(current >= 2);
                let next = if current == 2 { FREE } else { current - 1 };
                match state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    fn try_write(&self, component_type: ComponentTypeID) -> bool {
        self.state(component_type).map_or(false, |state| {
            state.compare_exchange(FREE, WRITER, Ordering::AcqRel, Ordering::Acquire).is_ok()
        })
    }

    fn release_write(&self, component_type: ComponentTypeID) {
        if let Some(state) = self.state(component_type) {
            let previous = state.swap(FREE, Ordering::AcqRel);
            debug_assert_eq!(previous, WRITER);
        }
    }

    /// Claim every type in `access`.
    ///
    /// On a collision nothing stays claimed and the colliding type is
    /// returned.
    pub fn claim<'g>(&'g self, access: &'g Access) -> Result<Claim<'g>, ComponentTypeID> {
        let mut reads = 0;
        for component_type in access.reads().iter() {
            if !self.try_read(component_type) {
                self.rollback(access, reads, 0);
                return Err(component_type);
            }
            reads += 1;
        }

        let mut writes = 0;
        for component_type in access.writes().iter() {
            if !self.try_write(component_type) {
                self.rollback(access, reads, writes);
                return Err(component_type);
            }
            writes += 1;
        }

        Ok(Claim { guard: self, access })
    }

    fn rollback(&self, access: &Access, reads: usize, writes: usize) {
        for component_type in access.reads().iter().take(reads) {
            self.release_read(component_type);
        }
        for component_type in access.writes().iter().take(writes) {
            self.release_write(component_type);
        }
    }
}

/// A held claim. Released on drop.
pub(crate) struct Claim<'g> {
    guard: &'g AccessGuard,
    access: &'g Access,
}

impl<'g> Drop for Claim<'g> {
    fn drop(&mut self) {
        for component_type in self.access.reads().iter() {
            self.guard.release_read(component_type);
        }
        for component_type in self.access.writes().iter() {
            self.guard.release_write(component_type);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn c(id: usize) -> ComponentTypeID {
        ComponentTypeID::new(id)
    }

    #[test]
    fn test_readers_share() {
        let guard = AccessGuard::new(4);
        let a = Access::new([c(1)], [], false);
        let b = Access::new([c(1)], [], false);

        let _first = guard.claim(&a).unwrap();
        let _second = guard.claim(&b).unwrap();
    }

    #[test]
    fn test_writer_excludes() {
        let guard = AccessGuard::new(4);
        let writer = Access::new([], [c(2)], false);
        let reader = Access::new([c(2)], [], false);

        let held = guard.claim(&writer).unwrap();
        assert_eq!(guard.claim(&reader).err(), Some(c(2)));
        drop(held);
        assert!(guard.claim(&reader).is_ok());
    }

    #[test]
    fn test_rollback() {
        let guard = AccessGuard::new(4);
        let blocker = Access::new([], [c(3)], false);
        let greedy = Access::new([c(1)], [c(2), c(3)], false);
        let other = Access::new([], [c(2)], false);

        let _held = guard.claim(&blocker).unwrap();
        assert_eq!(guard.claim(&greedy).err(), Some(c(3)));
        // The failed claim must not have left c(2) claimed.
        assert!(guard.claim(&other).is_ok());
    }

    #[test]
    fn test_structural_excludes_everyone() {
        let guard = AccessGuard::new(4);
        let structural = Access::new([], [], true);
        let reader = Access::new([c(1)], [], false);

        let _held = guard.claim(&structural).unwrap();
        assert_eq!(guard.claim(&reader).err(), Some(ComponentTypeID::ENTITY));
    }
}

//! Generational arena backing backend resource handles
//!
//! Freed slots are reused through a free list. Each reuse bumps the slot's
//! generation so stale handles are rejected instead of aliasing a new
//! resource.

use crate::core::{Error, Result};

/// Index plus generation of an arena entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with free-list reuse
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_slots: Vec<u32>,
    live: usize,
    /// Names the resource type in error messages
    kind: &'static str,
}

impl<T> Arena<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            live: 0,
            kind,
        }
    }

    pub fn insert(&mut self, value: T) -> Key {
        self.live += 1;
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return Key::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, value: Some(value) });
        Key::new(index, 0)
    }

    pub fn get(&self, key: Key) -> Result<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| self.stale(key))
    }

    pub fn get_mut(&mut self, key: Key) -> Result<&mut T> {
        let kind = self.kind;
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or_else(|| Error::InvalidHandle(format!("{kind} {key:?}")))
    }

    pub fn remove(&mut self, key: Key) -> Result<T> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .ok_or_else(|| Error::InvalidHandle(format!("{} {key:?}", self.kind)))?;
        let value = slot
            .value
            .take()
            .ok_or_else(|| Error::InvalidHandle(format!("{} {key:?} already freed", self.kind)))?;
        self.free_slots.push(key.index);
        self.live -= 1;
        Ok(value)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn stale(&self, key: Key) -> Error {
        Error::InvalidHandle(format!("{} {key:?}", self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new("buffer");
        let a = arena.insert(1u32);
        let b = arena.insert(2u32);
        assert_eq!(*arena.get(a).unwrap(), 1);
        assert_eq!(*arena.get(b).unwrap(), 2);
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.remove(a).unwrap(), 1);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(a).is_err());
        assert!(arena.remove(a).is_err());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new("volume");
        let a = arena.insert("first");
        arena.remove(a).unwrap();
        let b = arena.insert("second");

        assert_eq!(a.index(), b.index());
        assert!(matches!(arena.get(a), Err(Error::InvalidHandle(_))));
        assert_eq!(*arena.get(b).unwrap(), "second");
    }
}

//! A generation checked map with a capacity fixed at construction.
use alloc::vec::Vec;

/// A fixed capacity map handing out stable, generation checked keys.
///
/// A slotmap provides a `Vec`-like interface where each entry is associated with a stable
/// index-like key. Lookup with the key will detect if an entry has been removed, even if the slot
/// where the element was stored has been reused since.
///
/// ```
/// # use emnet::managed::SlotMap;
/// let mut map = SlotMap::with_capacity(16);
/// let key = map.insert(42).unwrap();
/// assert_eq!(map.get(key).cloned(), Some(42));
/// ```
pub struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    /// Head of the list of free slots, `slots.len()` when it is empty.
    free_top: usize,
    generation: Generation,
    len: usize,
}

/// An index into a slotmap.
///
/// The index remains valid until the entry is removed. Accessing the slotmap with the index again
/// after the entry was removed will fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    idx: usize,
    generation: Generation,
}

struct Slot<T> {
    generation: Generation,
    state: State<T>,
}

enum State<T> {
    Occupied(T),
    /// Links to the next free slot.
    Free(usize),
}

/// The generation counter.
///
/// Has strictly positive values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Generation(u32);

impl<T> SlotMap<T> {
    /// Create a map that can hold up to `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|idx| Slot {
                generation: Generation::default(),
                state: State::Free(idx + 1),
            })
            .collect();

        SlotMap {
            slots,
            free_top: 0,
            generation: Generation::default(),
            len: 0,
        }
    }

    /// The maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of occupied entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no entry is occupied.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The key that the next insertion will return, if there is room.
    ///
    /// Lets an entry learn its own key before it is constructed.
    pub fn vacant_key(&self) -> Option<Key> {
        if self.free_top < self.slots.len() {
            Some(Key { idx: self.free_top, generation: self.generation })
        } else {
            None
        }
    }

    /// Retrieve a value by key.
    pub fn get(&self, key: Key) -> Option<&T> {
        let slot = self.slots.get(key.idx)?;
        match &slot.state {
            State::Occupied(value) if slot.generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Retrieve a mutable value by key.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.idx)?;
        match &mut slot.state {
            State::Occupied(value) if slot.generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Insert a value, returning its key.
    ///
    /// Gives the value back when the map is full.
    pub fn try_insert(&mut self, value: T) -> Result<Key, T> {
        let idx = self.free_top;
        let slot = match self.slots.get_mut(idx) {
            Some(slot) => slot,
            None => return Err(value),
        };

        self.free_top = match slot.state {
            State::Free(next) => next,
            // The free list only ever links free slots.
            State::Occupied(_) => return Err(value),
        };

        slot.generation = self.generation;
        slot.state = State::Occupied(value);
        self.generation.advance();
        self.len += 1;

        Ok(Key { idx, generation: slot.generation })
    }

    /// Sugar wrapper around `try_insert` when the value is not needed on failure.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        self.try_insert(value).ok()
    }

    /// Remove an entry, returning its value.
    ///
    /// Returns `None` if the key did not refer to an element that could be freed.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        self.get(key)?;
        let slot = &mut self.slots[key.idx];
        let state = core::mem::replace(&mut slot.state, State::Free(self.free_top));
        self.free_top = key.idx;
        self.len -= 1;

        match state {
            State::Occupied(value) => Some(value),
            State::Free(_) => None,
        }
    }

    /// Iterate over all occupied entries.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| match &slot.state {
            State::Occupied(value) => Some((Key { idx, generation: slot.generation }, value)),
            State::Free(_) => None,
        })
    }

    /// Iterate mutably over all occupied entries.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Key, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(idx, slot)| {
            let generation = slot.generation;
            match &mut slot.state {
                State::Occupied(value) => Some((Key { idx, generation }, value)),
                State::Free(_) => None,
            }
        })
    }

    /// The keys of all occupied entries.
    pub fn keys(&self) -> Vec<Key> {
        self.iter().map(|(key, _)| key).collect()
    }
}

impl Generation {
    fn advance(&mut self) {
        assert!(self.0 > 0);
        self.0 = self.0.wrapping_add(1).max(1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple() {
        let mut map = SlotMap::with_capacity(2);
        let key42 = map.insert(42u32).unwrap();
        let keylo = map.insert('K' as _).unwrap();

        assert_eq!(map.insert(0x9999), None);
        assert_eq!(map.try_insert(0x9999), Err(0x9999));
        assert_eq!(map.get(key42).cloned(), Some(42));
        assert_eq!(map.get(keylo).cloned(), Some('K' as _));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn retained() {
        let mut map = SlotMap::with_capacity(1);
        let key = map.insert(0xdeu32).unwrap();
        assert_eq!(map.remove(key), Some(0xde));
        assert_eq!(map.get(key), None);

        let new_key = map.insert(0xad).unwrap();

        assert_eq!(map.get(key), None);
        assert_eq!(map.get(new_key).cloned(), Some(0xad));

        assert_eq!(map.remove(key), None);
        map.remove(new_key).unwrap();

        assert_eq!(map.get(key), None);
        assert_eq!(map.get(new_key), None);
        assert!(map.is_empty());
    }

    #[test]
    fn vacant_key_predicts_insert() {
        let mut map = SlotMap::with_capacity(2);
        let first = map.insert(1u8).unwrap();
        map.remove(first);
        let predicted = map.vacant_key().unwrap();
        assert_ne!(predicted, first);
        assert_eq!(map.insert(2), Some(predicted));
        map.insert(3).unwrap();
        assert_eq!(map.vacant_key(), None);
    }

    #[test]
    fn iteration_skips_free_slots() {
        let mut map = SlotMap::with_capacity(4);
        let a = map.insert('a').unwrap();
        let b = map.insert('b').unwrap();
        let c = map.insert('c').unwrap();
        map.remove(b);

        let seen: Vec<_> = map.iter().map(|(_, &v)| v).collect();
        assert_eq!(seen, ['a', 'c']);
        assert_eq!(map.keys(), [a, c]);

        for (_, value) in map.iter_mut() {
            *value = value.to_ascii_uppercase();
        }
        assert_eq!(map.get(c), Some(&'C'));
    }
}

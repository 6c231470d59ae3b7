//! Instance id agreement between peers.
//!
//! A producer picks instance ids freely (a finger index, a MIDI note
//! number); remote peers must nevertheless agree on which stream an update
//! belongs to. The id-map table relates the producer's local 32-bit id to a
//! globally unique 64-bit id, reference-counted from both sides so an entry
//! survives as long as either end still refers to it.
//!
//! Signals of one device share a single table (the device group), so an
//! instance born on one signal keeps its identity when forwarded on
//! another.

use std::fmt;

#[derive(Clone, Debug)]
pub struct IdMapEntry {
    pub local: u32,
    pub global: u64,
    refs_local: i32,
    refs_global: i32,
    /// Forwarding link to the entry that superseded this one.
    indirect: Option<usize>,
}

impl IdMapEntry {
    pub fn refs_local(&self) -> i32 {
        self.refs_local
    }

    pub fn refs_global(&self) -> i32 {
        self.refs_global
    }
}

/// Stable-handle table of id-map entries.
///
/// Handles are slot indices; freed slots are recycled, so a handle is only
/// valid while its entry is alive.
#[derive(Default)]
pub struct IdMapTable {
    slots: Vec<Option<IdMapEntry>>,
    free: Vec<usize>,
}

impl IdMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a mapping with one local and one global reference.
    pub fn add(&mut self, local: u32, global: u64) -> usize {
        let entry = IdMapEntry {
            local,
            global,
            refs_local: 1,
            refs_global: 1,
            indirect: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, handle: usize) -> Option<&IdMapEntry> {
        self.slots.get(handle).and_then(|s| s.as_ref())
    }

    /// Follows indirect links to the live entry for `handle`.
    pub fn resolve(&self, handle: usize) -> Option<usize> {
        let mut h = handle;
        let mut hops = 0;
        while let Some(entry) = self.get(h) {
            match entry.indirect {
                Some(next) if hops < self.slots.len() => {
                    h = next;
                    hops += 1;
                }
                Some(_) => return None,
                None => return Some(h),
            }
        }
        None
    }

    pub fn find_by_local(&self, local: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(e) if e.local == local && e.indirect.is_none()))
    }

    pub fn find_by_global(&self, global: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(e) if e.global == global && e.indirect.is_none()))
    }

    /// Re-points `old` at `new`; lookups through the stale handle resolve
    /// to the new entry.
    pub fn set_indirect(&mut self, old: usize, new: usize) {
        if old == new {
            return;
        }
        if let Some(Some(e)) = self.slots.get_mut(old) {
            e.indirect = Some(new);
        }
    }

    pub fn incr_local(&mut self, handle: usize) {
        if let Some(Some(e)) = self.slots.get_mut(handle) {
            e.refs_local += 1;
        }
    }

    pub fn incr_global(&mut self, handle: usize) {
        if let Some(Some(e)) = self.slots.get_mut(handle) {
            e.refs_global += 1;
        }
    }

    /// Drops a local reference; frees the entry when both counts reach
    /// zero. Returns true if the entry was freed.
    pub fn decr_local(&mut self, handle: usize) -> bool {
        self.decr(handle, true)
    }

    /// Drops a global reference; frees the entry when both counts reach
    /// zero. Returns true if the entry was freed.
    pub fn decr_global(&mut self, handle: usize) -> bool {
        self.decr(handle, false)
    }

    fn decr(&mut self, handle: usize, local: bool) -> bool {
        let Some(Some(e)) = self.slots.get_mut(handle) else {
            return false;
        };
        if local {
            e.refs_local -= 1;
        } else {
            e.refs_global -= 1;
        }
        if e.refs_local <= 0 && e.refs_global <= 0 {
            self.slots[handle] = None;
            self.free.push(handle);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for IdMapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().flatten())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_either_id() {
        let mut table = IdMapTable::new();
        let h = table.add(3, 0xABCD_0000_0000_0003);
        assert_eq!(table.find_by_local(3), Some(h));
        assert_eq!(table.find_by_global(0xABCD_0000_0000_0003), Some(h));
        assert_eq!(table.find_by_local(4), None);
    }

    #[test]
    fn entry_survives_until_both_refcounts_drop() {
        let mut table = IdMapTable::new();
        let h = table.add(1, 100);
        table.incr_global(h);
        assert!(!table.decr_local(h));
        assert!(!table.decr_global(h));
        assert!(table.get(h).is_some());
        assert!(table.decr_global(h));
        assert!(table.get(h).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut table = IdMapTable::new();
        let a = table.add(1, 100);
        table.decr_local(a);
        table.decr_global(a);
        let b = table.add(2, 200);
        assert_eq!(a, b);
        assert_eq!(table.get(b).unwrap().local, 2);
    }

    #[test]
    fn indirect_entries_resolve_and_hide_from_lookup() {
        let mut table = IdMapTable::new();
        let old = table.add(1, 100);
        let new = table.add(1, 101);
        table.set_indirect(old, new);
        assert_eq!(table.resolve(old), Some(new));
        // stale entry no longer answers lookups
        assert_eq!(table.find_by_global(100), None);
        assert_eq!(table.find_by_local(1), Some(new));
    }
}

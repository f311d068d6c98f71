// src/pool.rs
//! # Generation-checked resource pool
//!
//! Arena used for the short-lived objects the world churns through every step
//! (arbiters and islands):
//!
//! * **Reuse** – freed slots keep their allocation and are `reset` before reuse.
//! * **Stale-handle safety** – every handle carries the slot generation; giving
//!   a slot back bumps it, so old handles can never observe the new occupant.
//! * **Backpressure** – an optional capacity limit turns exhaustion into a
//!   recoverable `PhysicsError::PoolExhausted`.
//! * **Statistics** – allocation hits / misses for diagnostics.

use crate::error::{PhysicsError, PhysicsResult};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

// -----------------------------------------------------------------------------
// Public types
// -----------------------------------------------------------------------------

/// Types that can be wiped back to their initial state for reuse.
pub trait Reset {
    fn reset(&mut self);
}

/// Opaque handle into a `ResourcePool<T>`.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline(always)]
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

// Manual impls: derives would put bounds on `T`.
impl<T> Clone for Handle<T> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Pool statistics.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// `get_new` calls served from a freed slot.
    pub allocation_hits: u64,
    /// `get_new` calls that had to grow the arena.
    pub allocation_misses: u64,
    pub live: usize,
    pub slots: usize,
}

// -----------------------------------------------------------------------------
// Pool
// -----------------------------------------------------------------------------

struct Entry<T> {
    generation: u32,
    live: bool,
    value: Option<T>,
}

pub struct ResourcePool<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
    limit: Option<usize>,
    hits: u64,
    misses: u64,
}

impl<T: Reset + Default> Default for ResourcePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reset + Default> ResourcePool<T> {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Pool that refuses to hold more than `limit` live instances.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit,
            hits: 0,
            misses: 0,
        }
    }

    /// Hands out a fresh instance, reusing a freed slot when one exists.
    pub fn get_new(&mut self) -> PhysicsResult<Handle<T>> {
        if let Some(capacity) = self.limit {
            if self.live >= capacity {
                return Err(PhysicsError::PoolExhausted { capacity });
            }
        }

        // Lowest free index first keeps iteration order stable.
        let reuse = self
            .free
            .iter()
            .enumerate()
            .min_by_key(|(_, index)| **index)
            .map(|(pos, _)| pos);

        let index = match reuse {
            Some(pos) => {
                let index = self.free.swap_remove(pos);
                let entry = &mut self.entries[index as usize];
                match entry.value.as_mut() {
                    Some(value) => value.reset(),
                    None => entry.value = Some(T::default()),
                }
                entry.live = true;
                self.hits += 1;
                index
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    live: true,
                    value: Some(T::default()),
                });
                self.misses += 1;
                index
            }
        };

        self.live += 1;
        Ok(Handle::new(index, self.entries[index as usize].generation))
    }

    /// Returns the slot to the pool. Stale handles are ignored and yield `false`.
    pub fn give_back(&mut self, handle: Handle<T>) -> bool {
        let Some(entry) = self.entries.get_mut(handle.index as usize) else {
            return false;
        };
        if !entry.live || entry.generation != handle.generation {
            return false;
        }
        entry.live = false;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        true
    }

    /// Drops every pooled instance. All outstanding handles become stale.
    pub fn reset_resource_pool(&mut self) {
        self.free.clear();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.live {
                entry.generation = entry.generation.wrapping_add(1);
            }
            entry.live = false;
            entry.value = None;
            self.free.push(index as u32);
        }
        self.live = 0;
    }
}

impl<T> ResourcePool<T> {
    #[inline]
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.live && e.generation == handle.generation)
            .and_then(|e| e.value.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|e| e.live && e.generation == handle.generation)
            .and_then(|e| e.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live instances.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Live instances in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            if !e.live {
                return None;
            }
            e.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, e.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        self.entries.iter_mut().enumerate().filter_map(|(i, e)| {
            if !e.live {
                return None;
            }
            let generation = e.generation;
            e.value
                .as_mut()
                .map(|v| (Handle::new(i as u32, generation), v))
        })
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocation_hits: self.hits,
            allocation_misses: self.misses,
            live: self.live,
            slots: self.entries.len(),
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::rand::{
    rngs::SmallRng,
    RngCore,
    SeedableRng,
};
use ::std::{
    collections::HashMap,
    hash::Hash,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Pre-allocated capacity for the backing map. Sized for the expected number of live tasks on a busy processor.
const DEFAULT_SIZE: usize = 1024;

/// Seed for the random number generator used to generate identifiers.
/// This value was chosen arbitrarily.
const ID_MAP_SEED: u64 = 42;
const MAX_RETRIES_ID_ALLOC: usize = 500;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A map keyed by randomized identifiers handed out to external modules. Identifiers are allocated by the map itself,
/// so callers never learn anything about internal layout from them. The key type must convert back and forth to u64.
pub struct IdMap<K: Eq + Hash + From<u64> + Into<u64> + Copy, V> {
    /// Map between identifiers and entries.
    entries: HashMap<K, V>,
    /// Small random number generator for identifiers.
    rng: SmallRng,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<K: Eq + Hash + From<u64> + Into<u64> + Copy, V> IdMap<K, V> {
    /// Retrieve the entry for this identifier if it exists.
    pub fn get(&self, id: &K) -> Option<&V> {
        self.entries.get(id)
    }

    /// Generate a new identifier and insert the entry under it. If the identifier is currently in use, keep generating
    /// until we find an unused one (up to a maximum number of tries). Zero is reserved and never handed out.
    pub fn insert_with_new_id(&mut self, entry: V) -> K {
        for _ in 0..MAX_RETRIES_ID_ALLOC {
            let raw: u64 = self.rng.next_u64();
            if raw == 0 {
                continue;
            }
            let id: K = K::from(raw);
            if !self.entries.contains_key(&id) {
                self.entries.insert(id, entry);
                return id;
            }
        }
        panic!("could not allocate a valid id");
    }

    /// Insert an entry under this identifier. If a mapping already exists, then return the old entry stored under it.
    pub fn insert(&mut self, id: K, entry: V) -> Option<V> {
        self.entries.insert(id, entry)
    }

    /// Remove the entry for this identifier. If the mapping exists, then return the entry stored under it.
    pub fn remove(&mut self, id: &K) -> Option<V> {
        self.entries.remove(id)
    }

    /// Iterate over all entries.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// A default implementation for the identifier map.
impl<K: Eq + Hash + From<u64> + Into<u64> + Copy, V> Default for IdMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::<K, V>::with_capacity(DEFAULT_SIZE),
            rng: SmallRng::seed_from_u64(ID_MAP_SEED),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

//! Maglev-style consistent hashing.
//!
//! A [`ConsistentHashTable`] maps opaque keys onto a bounded set of named
//! members through a fixed-size lookup table. Each member derives a
//! permutation of the table slots from two hashes of its name, and the
//! table is populated by letting members claim their next preferred free
//! slot in turn, so every member ends up with `capacity / n` slots (±1).
//!
//! The lookup array is a pure function of the member set: members are kept
//! sorted by name and the table is rebuilt from scratch on every change.
//! Two tables with the same membership are identical regardless of the
//! order in which members joined or left.
//!
//! ## Usage
//!
//! ```
//! use fluxlb_maglev::ConsistentHashTable;
//!
//! let mut table = ConsistentHashTable::new(53)?;
//! table.add("b1")?;
//! table.add("b2")?;
//!
//! let owner = table.get("10.0.0.7:41000")?;
//! assert!(owner == "b1" || owner == "b2");
//! # Ok::<(), fluxlb_maglev::TableError>(())
//! ```

use std::hash::Hasher;
use std::sync::Arc;

use siphasher::sip::SipHasher24;
use thiserror::Error;

/// Seed for a member's starting offset.
const OFFSET_SEED: u64 = 0xdead_babe;

/// Seed for a member's skip stride.
const SKIP_SEED: u64 = 0xdead_beef;

/// Seed for lookup keys.
const KEY_SEED: u64 = 0x0b5e_55ed;

/// Consistent hash table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// Capacity is not a prime number.
    #[error("table capacity {0} is not prime")]
    NotPrime(usize),

    /// Every slot is owned; no further member fits.
    #[error("table is full ({capacity} members)")]
    Full { capacity: usize },

    /// A member with this name is already present.
    #[error("member already present: {0}")]
    Duplicate(String),

    /// No member with this name.
    #[error("member not found: {0}")]
    NotFound(String),

    /// Lookup against a table without members.
    #[error("table has no members")]
    Empty,
}

/// A member and its slot permutation parameters.
#[derive(Debug, Clone)]
struct Member {
    name: Arc<str>,
    offset: u64,
    skip: u64,
}

impl Member {
    fn new(name: &str, capacity: u64) -> Self {
        let bytes = name.as_bytes();
        Self {
            name: Arc::from(name),
            offset: sip(OFFSET_SEED, bytes) % capacity,
            // capacity is prime, so any skip in 1..capacity is coprime with it
            skip: sip(SKIP_SEED, bytes) % (capacity - 1) + 1,
        }
    }

    /// The `j`-th slot in this member's preference list.
    fn slot(&self, j: u64, capacity: u64) -> usize {
        let slot = (u128::from(self.offset) + u128::from(j) * u128::from(self.skip))
            % u128::from(capacity);
        slot as usize
    }
}

/// Fixed-capacity consistent hash table.
#[derive(Debug, Clone)]
pub struct ConsistentHashTable {
    /// Number of slots. Always prime.
    capacity: usize,
    /// Members, sorted by name.
    members: Vec<Member>,
    /// Slot -> index into `members`.
    lookup: Vec<Option<usize>>,
}

impl ConsistentHashTable {
    /// Create an empty table with `capacity` slots.
    ///
    /// The capacity must be prime so that every member's permutation visits
    /// each slot exactly once per cycle.
    pub fn new(capacity: usize) -> Result<Self, TableError> {
        if !is_prime(capacity) {
            return Err(TableError::NotPrime(capacity));
        }

        Ok(Self {
            capacity,
            members: Vec::new(),
            lookup: vec![None; capacity],
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the table has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a member is present.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Member names in table order (sorted).
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_ref())
    }

    /// Add a member and rebuild the table.
    pub fn add(&mut self, name: &str) -> Result<(), TableError> {
        let idx = match self.position(name) {
            Ok(_) => return Err(TableError::Duplicate(name.to_string())),
            Err(idx) => idx,
        };

        if self.members.len() >= self.capacity {
            return Err(TableError::Full {
                capacity: self.capacity,
            });
        }

        self.members.insert(idx, Member::new(name, self.capacity as u64));
        self.populate();
        Ok(())
    }

    /// Remove a member and rebuild the table from the remaining members.
    pub fn remove(&mut self, name: &str) -> Result<(), TableError> {
        let idx = self
            .position(name)
            .map_err(|_| TableError::NotFound(name.to_string()))?;

        self.members.remove(idx);
        self.populate();
        Ok(())
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.members.clear();
        self.lookup.fill(None);
    }

    /// Resolve a key to the member owning its slot.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<&str, TableError> {
        if self.members.is_empty() {
            return Err(TableError::Empty);
        }

        let slot = (sip(KEY_SEED, key.as_ref()) % self.capacity as u64) as usize;
        match self.lookup[slot] {
            Some(idx) => Ok(self.members[idx].name.as_ref()),
            None => Err(TableError::Empty),
        }
    }

    /// Owner of every slot, in slot order.
    pub fn slots(&self) -> impl Iterator<Item = Option<&str>> {
        self.lookup
            .iter()
            .map(|entry| entry.map(|idx| self.members[idx].name.as_ref()))
    }

    /// Slot indices owned by `name`.
    pub fn slots_of(&self, name: &str) -> Vec<usize> {
        match self.position(name) {
            Ok(idx) => self
                .lookup
                .iter()
                .enumerate()
                .filter(|(_, entry)| **entry == Some(idx))
                .map(|(slot, _)| slot)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn position(&self, name: &str) -> Result<usize, usize> {
        self.members.binary_search_by(|m| m.name.as_ref().cmp(name))
    }

    /// Rebuild the lookup array from the current member set.
    fn populate(&mut self) {
        self.lookup.fill(None);
        if self.members.is_empty() {
            return;
        }

        let capacity = self.capacity as u64;
        let mut next = vec![0u64; self.members.len()];
        let mut filled = 0;

        loop {
            for (idx, member) in self.members.iter().enumerate() {
                let mut slot = member.slot(next[idx], capacity);
                while self.lookup[slot].is_some() {
                    next[idx] += 1;
                    slot = member.slot(next[idx], capacity);
                }

                self.lookup[slot] = Some(idx);
                next[idx] += 1;
                filled += 1;

                if filled == self.capacity {
                    return;
                }
            }
        }
    }
}

fn sip(seed: u64, bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(seed, 0);
    hasher.write(bytes);
    hasher.finish()
}

/// Trial-division primality check.
pub fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }

    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

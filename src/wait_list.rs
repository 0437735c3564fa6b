//! Wait-lists for distributed deadlock detection
//!
//! Every client publishes the set of client ids it is, transitively, waiting
//! behind. Waiters union the wait-lists of the holders that block them into
//! their own, so a wait-list that comes back around to contain its owner
//! signals a cycle.

use std::fmt;

use parking_lot::RwLock;

use crate::common::ClientId;

const WORD_BITS: usize = 64;

/// Growable set of client ids backed by 64-bit words
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn position(id: ClientId) -> (usize, u64) {
        let id = id as usize;
        (id / WORD_BITS, 1u64 << (id % WORD_BITS))
    }

    pub fn insert(&mut self, id: ClientId) {
        let (word, mask) = Self::position(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= mask;
    }

    #[inline]
    pub fn contains(&self, id: ClientId) -> bool {
        let (word, mask) = Self::position(id);
        self.words.get(word).is_some_and(|bits| bits & mask != 0)
    }

    pub fn union_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Clear all bits, keeping the allocation
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| (index * WORD_BITS + bit) as ClientId)
        })
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, id) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", id)?;
        }
        f.write_str("]")
    }
}

/// The wait-list a client publishes for others to read.
///
/// Only the owning client writes it. Other clients read it while walking the
/// holders of a lock; those reads are snapshots and may be stale by the time
/// they are used. The owner's own id is always a member.
#[derive(Debug)]
pub struct WaitList {
    owner: ClientId,
    bits: RwLock<BitSet>,
}

impl WaitList {
    pub fn new(owner: ClientId) -> Self {
        let mut bits = BitSet::new();
        bits.insert(owner);
        Self {
            owner,
            bits: RwLock::new(bits),
        }
    }

    /// Reset to contain only the owner
    pub fn reset(&self) {
        let mut bits = self.bits.write();
        bits.clear();
        bits.insert(self.owner);
    }

    /// Replace the published set with `snapshot` (plus the owner)
    pub fn publish(&self, snapshot: &BitSet) {
        let mut bits = self.bits.write();
        bits.clear();
        bits.union_with(snapshot);
        bits.insert(self.owner);
    }

    /// Union this wait-list into `target`
    pub fn copy_into(&self, target: &mut BitSet) {
        target.union_with(&self.bits.read());
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.bits.read().contains(id)
    }

    pub fn size(&self) -> usize {
        self.bits.read().len()
    }
}

impl fmt::Display for WaitList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits.read())
    }
}

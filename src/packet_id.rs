//! Packet identifier bookkeeping.
//!
//! The 16-bit identifier space is tracked with a fixed bitmap, so membership checks,
//! claims and releases are O(1) and the memory cost is bounded (8 KiB) no matter how many
//! identifiers are live.

use alloc::boxed::Box;
use alloc::vec;

const WORDS: usize = 65_536 / 32;

/// A set of packet identifiers backed by a bitmap.
#[derive(Debug, Clone)]
pub struct IdSet {
    words: Box<[u32]>,
    len: usize,
}

impl IdSet {
    pub fn new() -> Self {
        Self {
            words: vec![0u32; WORDS].into_boxed_slice(),
            len: 0,
        }
    }

    fn locate(id: u16) -> (usize, u32) {
        ((id as usize) / 32, 1u32 << (id % 32))
    }

    pub fn contains(&self, id: u16) -> bool {
        let (word, bit) = Self::locate(id);
        self.words[word] & bit != 0
    }

    /// Returns `false` if the identifier was already present.
    pub fn insert(&mut self, id: u16) -> bool {
        let (word, bit) = Self::locate(id);
        if self.words[word] & bit != 0 {
            return false;
        }
        self.words[word] |= bit;
        self.len += 1;
        true
    }

    /// Returns `false` if the identifier was not present.
    pub fn remove(&mut self, id: u16) -> bool {
        let (word, bit) = Self::locate(id);
        if self.words[word] & bit == 0 {
            return false;
        }
        self.words[word] &= !bit;
        self.len -= 1;
        true
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for IdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator for outbound packet identifiers (1..=65535).
///
/// Identifiers are handed out round-robin so a recently released value is not reused
/// immediately; an identifier stays claimed until [`PacketIds::release`].
#[derive(Debug, Clone)]
pub struct PacketIds {
    used: IdSet,
    next: u16,
}

impl PacketIds {
    pub fn new() -> Self {
        Self {
            used: IdSet::new(),
            next: 1,
        }
    }

    /// The next identifier in round-robin order, claimed or not.
    pub fn next_candidate(&mut self) -> u16 {
        let id = self.next;
        self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
        id
    }

    /// Claims `id`, returning `false` if it is already in use.
    pub fn claim(&mut self, id: u16) -> bool {
        id != 0 && self.used.insert(id)
    }

    /// Claims the next free identifier.
    pub fn alloc(&mut self) -> Option<u16> {
        if self.used.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            let id = self.next_candidate();
            if self.claim(id) {
                return Some(id);
            }
        }
    }

    pub fn release(&mut self, id: u16) {
        self.used.remove(id);
    }

    pub fn is_used(&self, id: u16) -> bool {
        self.used.contains(id)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}

impl Default for PacketIds {
    fn default() -> Self {
        Self::new()
    }
}

//! Identifier allocation
//!
//! Signaling command identifiers (per connection) and dynamic channel
//! identifiers (per node) share one policy: scan forward from the last
//! value handed out, wrap inside the valid range, take the first value that
//! is not in use. The spaces are small and collisions rare, so a linear scan
//! is good enough.

use super::constants::*;

/// Cursor-based allocator over an inclusive range of identifiers
#[derive(Debug, Clone)]
pub struct IdAllocator {
    first: u16,
    last: u16,
    cursor: u16,
}

impl IdAllocator {
    /// Allocator over `first..=last`; the first scan starts at `first`.
    pub(crate) fn new(first: u16, last: u16) -> Self {
        debug_assert!(first <= last, "empty identifier range");
        Self {
            first,
            last,
            cursor: last,
        }
    }

    /// Allocator for signaling command identifiers (1..=255)
    pub fn command_idents() -> Self {
        Self::new(L2CAP_FIRST_IDENT as u16, L2CAP_LAST_IDENT as u16)
    }

    /// Allocator for dynamically assigned channel identifiers
    pub fn channel_ids() -> Self {
        Self::new(L2CAP_DYNAMIC_CID_MIN, L2CAP_DYNAMIC_CID_MAX)
    }

    /// The value handed out most recently
    pub fn last_used(&self) -> u16 {
        self.cursor
    }

    fn advance(&self, value: u16) -> u16 {
        if value >= self.last || value < self.first {
            self.first
        } else {
            value + 1
        }
    }

    /// Find the next free identifier.
    ///
    /// Every value of the range is visited at most once, the current cursor
    /// last. Returns `None` when all of them are in use; the cursor only
    /// moves on success.
    pub fn next(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let span = (self.last - self.first) as u32 + 1;
        let mut candidate = self.advance(self.cursor);

        for _ in 0..span {
            if !in_use(candidate) {
                self.cursor = candidate;
                return Some(candidate);
            }
            candidate = self.advance(candidate);
        }

        None
    }
}

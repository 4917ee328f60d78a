//! Risk-Ordered Index: an intrusive doubly-linked list over the slab,
//! ordered by ascending nominal ratio from the head (riskiest first).
//!
//! Links live in the position records themselves (`prev`/`next`), so insert
//! and remove are O(1) once the neighbors are known. Callers pass neighbor
//! hints computed off-chain; a stale hint is walked a bounded number of steps
//! and then abandoned for a scan from the head.

use super::{CdpEngine, MAX_HINT_WALK, MAX_POSITIONS, NONE};

impl CdpEngine {
    // ========================================
    // Traversal
    // ========================================

    pub fn list_head(&self) -> u16 {
        self.head
    }

    pub fn list_tail(&self) -> u16 {
        self.tail
    }

    pub fn list_next(&self, idx: u16) -> u16 {
        if !self.list_contains(idx) {
            return NONE;
        }
        self.positions[idx as usize].next
    }

    pub fn list_prev(&self, idx: u16) -> u16 {
        if !self.list_contains(idx) {
            return NONE;
        }
        self.positions[idx as usize].prev
    }

    pub fn list_contains(&self, idx: u16) -> bool {
        if idx == NONE || !self.is_active(idx) {
            return false;
        }
        let p = &self.positions[idx as usize];
        p.prev != NONE || p.next != NONE || self.head == idx
    }

    #[inline]
    fn key(&self, idx: u16) -> u128 {
        self.positions[idx as usize].nicr
    }

    // ========================================
    // Hint Resolution
    // ========================================

    /// True when a node with `nicr` can sit between `prev` and `next`
    /// without breaking the ordering.
    pub fn valid_insert_position(&self, nicr: u128, prev: u16, next: u16) -> bool {
        match (prev == NONE, next == NONE) {
            (true, true) => self.list_size == 0,
            (true, false) => {
                self.head == next && self.list_contains(next) && nicr <= self.key(next)
            }
            (false, true) => {
                self.tail == prev && self.list_contains(prev) && self.key(prev) <= nicr
            }
            (false, false) => {
                self.list_contains(prev)
                    && self.positions[prev as usize].next == next
                    && self.key(prev) <= nicr
                    && nicr <= self.key(next)
            }
        }
    }

    /// Resolve `(prev, next)` neighbors for `nicr`.
    ///
    /// `lower_hint` should have a nominal ratio at or below `nicr` and
    /// `upper_hint` one at or above it. Hints that are missing, inactive or
    /// on the wrong side are dropped.
    pub fn find_insert_position(&self, nicr: u128, lower_hint: u16, upper_hint: u16) -> (u16, u16) {
        let lower = if self.list_contains(lower_hint) && self.key(lower_hint) <= nicr {
            lower_hint
        } else {
            NONE
        };
        let upper = if self.list_contains(upper_hint) && nicr <= self.key(upper_hint) {
            upper_hint
        } else {
            NONE
        };

        if lower != NONE {
            let mut prev = lower;
            let mut next = self.positions[lower as usize].next;
            let mut steps = 0;
            while next != NONE && self.key(next) < nicr && steps < MAX_HINT_WALK {
                prev = next;
                next = self.positions[next as usize].next;
                steps += 1;
            }
            if self.valid_insert_position(nicr, prev, next) {
                return (prev, next);
            }
        }

        if upper != NONE {
            let mut next = upper;
            let mut prev = self.positions[upper as usize].prev;
            let mut steps = 0;
            while prev != NONE && self.key(prev) > nicr && steps < MAX_HINT_WALK {
                next = prev;
                prev = self.positions[prev as usize].prev;
                steps += 1;
            }
            if self.valid_insert_position(nicr, prev, next) {
                return (prev, next);
            }
        }

        self.scan_from_head(nicr)
    }

    fn scan_from_head(&self, nicr: u128) -> (u16, u16) {
        let mut prev = NONE;
        let mut next = self.head;
        while next != NONE && self.key(next) < nicr {
            prev = next;
            next = self.positions[next as usize].next;
        }
        (prev, next)
    }

    // ========================================
    // Mutation
    // ========================================

    /// Link `idx` into the list with ordering key `nicr`.
    pub(crate) fn list_insert(&mut self, idx: u16, nicr: u128, lower_hint: u16, upper_hint: u16) {
        let (prev, next) = self.find_insert_position(nicr, lower_hint, upper_hint);

        {
            let p = &mut self.positions[idx as usize];
            p.nicr = nicr;
            p.prev = prev;
            p.next = next;
        }
        if prev == NONE {
            self.head = idx;
        } else {
            self.positions[prev as usize].next = idx;
        }
        if next == NONE {
            self.tail = idx;
        } else {
            self.positions[next as usize].prev = idx;
        }
        self.list_size = self.list_size.saturating_add(1);
    }

    /// Unlink `idx`. No-op when it is not in the list.
    pub(crate) fn list_remove(&mut self, idx: u16) {
        if !self.list_contains(idx) {
            return;
        }
        let (prev, next) = {
            let p = &self.positions[idx as usize];
            (p.prev, p.next)
        };
        if prev == NONE {
            self.head = next;
        } else {
            self.positions[prev as usize].next = next;
        }
        if next == NONE {
            self.tail = prev;
        } else {
            self.positions[next as usize].prev = prev;
        }
        let p = &mut self.positions[idx as usize];
        p.prev = NONE;
        p.next = NONE;
        self.list_size = self.list_size.saturating_sub(1);
    }

    pub(crate) fn list_reinsert(&mut self, idx: u16, nicr: u128, lower_hint: u16, upper_hint: u16) {
        self.list_remove(idx);
        self.list_insert(idx, nicr, lower_hint, upper_hint);
    }

    /// Walk the list and check links, membership and key order.
    pub fn check_ordering(&self) -> bool {
        let mut count = 0usize;
        let mut prev = NONE;
        let mut cur = self.head;
        let mut last_key = 0u128;

        while cur != NONE {
            if count >= MAX_POSITIONS || (cur as usize) >= MAX_POSITIONS {
                return false;
            }
            if !self.is_active(cur) {
                return false;
            }
            let p = &self.positions[cur as usize];
            if p.prev != prev || p.nicr < last_key {
                return false;
            }
            last_key = p.nicr;
            prev = cur;
            cur = p.next;
            count += 1;
        }

        prev == self.tail && count == self.list_size as usize
    }
}

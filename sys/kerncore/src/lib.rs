// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Target-independent algorithms used by the kernel.
//!
//! Nothing in here knows about tasks or partitions; everything is plain
//! integer arithmetic or operates on slices, so it can be tested exhaustively
//! on the host.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

/// Two-level priority bitmap.
///
/// `fine` holds one bit per priority, `WORDS` words of 32 bits each; bit `n`
/// of `coarse` is set iff `fine[n]` is non-zero. Finding the highest set
/// priority therefore takes two leading-zero counts regardless of how many
/// priorities are populated.
///
/// # Invariants
///
/// `coarse & (1 << w) != 0` iff `fine[w] != 0`, for all `w < WORDS`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrioBitmap<const WORDS: usize> {
    coarse: u32,
    fine: [u32; WORDS],
}

impl<const WORDS: usize> Default for PrioBitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> PrioBitmap<WORDS> {
    /// Number of priorities representable.
    pub const BITS: usize = WORDS * 32;

    pub const fn new() -> Self {
        assert!(WORDS > 0 && WORDS <= 32);
        Self {
            coarse: 0,
            fine: [0; WORDS],
        }
    }

    pub fn set(&mut self, prio: usize) {
        let (w, b) = (prio / 32, prio % 32);
        self.fine[w] |= 1 << b;
        self.coarse |= 1 << w;
    }

    pub fn clear(&mut self, prio: usize) {
        let (w, b) = (prio / 32, prio % 32);
        self.fine[w] &= !(1 << b);
        if self.fine[w] == 0 {
            self.coarse &= !(1 << w);
        }
    }

    pub fn is_set(&self, prio: usize) -> bool {
        self.fine[prio / 32] & (1 << (prio % 32)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.coarse == 0
    }

    /// Returns the highest set priority, if any.
    pub fn highest(&self) -> Option<usize> {
        if self.coarse == 0 {
            return None;
        }
        let w = 31 - self.coarse.leading_zeros() as usize;
        let b = 31 - self.fine[w].leading_zeros() as usize;
        Some(w * 32 + b)
    }
}

/// Computes `(a - b) mod (max + 1)` for counter values in `0..=max`.
///
/// This is the number of ticks a counter needs to advance from `b` to reach
/// `a`, and is robust against the counter wrapping in between.
pub fn tick_diff(a: u32, b: u32, max: u32) -> u32 {
    if a >= b {
        a - b
    } else {
        // The distance across the wrap point. Computed in u64 so that
        // max == u32::MAX works.
        (u64::from(max) + 1 - u64::from(b) + u64::from(a)) as u32
    }
}

/// Computes `(v + inc) mod (max + 1)`; `inc` must not exceed `max`.
pub fn tick_add(v: u32, inc: u32, max: u32) -> u32 {
    let sum = u64::from(v) + u64::from(inc);
    let modulus = u64::from(max) + 1;
    (sum % modulus) as u32
}

/// Number of ticks until a counter currently at `now` reaches `expiry`.
///
/// An expiry equal to the current value is a full wrap away, so the result is
/// always in `1..=max+1`.
pub fn ticks_remaining(expiry: u32, now: u32, max: u32) -> u64 {
    match tick_diff(expiry, now, max) {
        0 => u64::from(max) + 1,
        d => u64::from(d),
    }
}

/// Finds the insertion point for `key` in a slice already sorted by
/// `key_of`, placing it *after* any elements with an equal key so that
/// insertion order breaks ties.
pub fn upper_bound<T, K: Ord>(
    items: &[T],
    key: &K,
    mut key_of: impl FnMut(&T) -> K,
) -> usize {
    items.partition_point(|x| key_of(x) <= *key)
}

/// Correction to apply to a wait at a synchronization point.
///
/// `deviation` is positive when the table runs ahead of its reference (and
/// must wait longer), negative when it runs behind. The returned correction
/// has the sign of `deviation` and magnitude `min(|deviation|, budget)`, where
/// the budget is `max_lengthen` or `max_shorten` depending on direction.
pub fn deviation_correction(
    deviation: i64,
    max_shorten: u32,
    max_lengthen: u32,
) -> i64 {
    if deviation > 0 {
        deviation.min(i64::from(max_lengthen))
    } else {
        -(deviation.unsigned_abs().min(u64::from(max_shorten)) as i64)
    }
}

/// Signed deviation between a table position and an external reference, both
/// taken modulo `duration`, folded into `(-duration/2, duration/2]`.
pub fn wrap_deviation(position: u32, reference: u32, duration: u32) -> i64 {
    let duration = i64::from(duration);
    let mut d = (i64::from(position) - i64::from(reference)) % duration;
    if d > duration / 2 {
        d -= duration;
    } else if d <= -((duration + 1) / 2) {
        d += duration;
    }
    d
}

/// Returns the first multiple of `period` at or after `now`. A zero period
/// means "no periodic grid" and yields `now`.
pub fn align_up(now: u64, period: u64) -> u64 {
    if period == 0 {
        return now;
    }
    now.div_ceil(period).saturating_mul(period)
}

/// Returns the first release point `base + k * period` (for `k >= 0`) at or
/// after `now`.
pub fn next_release(now: u64, base: u64, period: u64) -> u64 {
    if period == 0 || now <= base {
        return base.max(now);
    }
    base + align_up(now - base, period)
}

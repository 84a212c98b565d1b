// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event trace.
//!
//! A small ring of recent scheduling and health-monitoring decisions, kept in
//! the `Kernel` so a debugger (or a test) can see how the system got where it
//! is. Entries are tagged with the source line that recorded them; recording
//! the same event from the same line twice in a row bumps `count` instead of
//! using a new slot.

use abi::{ErrorCode, HmErrorId, HmPartAction, HmSysAction, PartMode};

/// Records `$event` in `$k`'s trace ring.
macro_rules! ktrace {
    ($k:expr, $event:expr) => {
        $k.trace.entry(line!() as u16, $event)
    };
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Activate { task: u16 },
    Switch { cpu: u8, task: Option<u16> },
    TpSwitch { cpu: u8, old: u8, new: u8 },
    ModeChange { part: u8, mode: PartMode },
    /// Error record handed to a partition's error hook.
    HmTask { task: u16, error: HmErrorId },
    HmPartition { part: u8, error: HmErrorId, action: HmPartAction },
    HmSystem { error: HmErrorId, action: HmSysAction },
    /// A request forwarded to another CPU failed there.
    RemoteFailed { cpu: u8, code: ErrorCode },
}

#[derive(Copy, Clone, Debug)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(empty: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: empty,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // An absent `last` is treated as out of range, so the first entry
        // lands in slot 0 and never merges with the blank one there.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let split = self.last.map_or(0, |l| l + 1);
        let (newer, older) = self.buffer.split_at(split.min(N));
        older.iter().chain(newer.iter()).filter(|e| e.count != 0)
    }

    pub fn contains(&self, payload: &T) -> bool {
        self.iter().any(|e| e.payload == *payload)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is cleared to zero (false)
//!   before entry to kernel main, and set to one (true) if the kernel reaches
//!   the `die` function (either explicitly or as a result of a `panic!`).
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   possible, truncating if the buffer fills. For printing, trim off any
//!   trailing NUL bytes.
//!
//! On the host there is no debugger to find these, so each thread keeps its
//! own epitaph (readable through `epitaph`) and `die` ends in a panic that a
//! test can catch.

use core::fmt::{Display, Write};

const EPITAPH_LEN: usize = 128;

#[cfg(target_os = "none")]
mod target {
    use core::sync::atomic::Ordering;

    use super::EPITAPH_LEN;

    /// Flag that gets set to `true` by all failure reporting functions, giving
    /// tools a one-stop-shop for doing kernel triage.
    #[used]
    static mut KERNEL_HAS_FAILED: bool = false;

    /// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description
    /// of the event that caused the kernel to fail, padded with NULs.
    #[used]
    static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

    pub(super) fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
        // Safety: only reached from `die`, never concurrently.
        let previous_fail = unsafe {
            core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
        };
        if previous_fail {
            // Recursive failure; panicking again would only make it worse.
            loop {
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        // Safety: only one execution of this function gets past the flag.
        unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
    }

    pub(super) fn rest_in_peace() -> ! {
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        super::die(info)
    }
}

#[cfg(not(target_os = "none"))]
mod host {
    use std::cell::RefCell;

    use super::EPITAPH_LEN;

    thread_local! {
        pub(super) static EPITAPH: RefCell<Option<[u8; EPITAPH_LEN]>> =
            const { RefCell::new(None) };
    }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = target::begin_epitaph();
    let mut writer = Eulogist { dest: &mut buf[..] };
    write!(writer, "{msg}").ok();
    target::rest_in_peace()
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let mut buf = [0u8; EPITAPH_LEN];
    let mut writer = Eulogist { dest: &mut buf[..] };
    write!(writer, "{msg}").ok();
    host::EPITAPH.with(|e| *e.borrow_mut() = Some(buf));
    panic!("kernel died: {msg}");
}

/// Returns the recorded failure reason of this thread's kernel, if it died.
#[cfg(not(target_os = "none"))]
pub fn epitaph() -> Option<std::string::String> {
    host::EPITAPH.with(|e| {
        e.borrow().map(|buf| {
            let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            std::string::String::from_utf8_lossy(&buf[..end]).into_owned()
        })
    })
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn die_records_truncated_epitaph() {
        let long = "x".repeat(EPITAPH_LEN * 2);
        let r = std::panic::catch_unwind(|| die(&long));
        assert!(r.is_err());
        let e = epitaph().unwrap();
        assert_eq!(e.len(), EPITAPH_LEN);
    }

    #[test]
    fn uassert_failure_names_condition() {
        let r = std::panic::catch_unwind(|| {
            let x = 3;
            uassert!(x == 4);
        });
        assert!(r.is_err());
        assert_eq!(epitaph().unwrap(), "assertion failed: x == 4");
    }
}

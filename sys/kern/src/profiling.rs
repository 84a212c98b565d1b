// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events, duration of
//! syscalls, and the like, as an aid to debugging or optimization work.
//!
//! The kernel does not assume any particular way of getting profiling
//! information out. A board that wants it populates an `EventsTable` and
//! hands it to `configure_events_table` during startup. A typical
//! implementation toggles GPIOs that a logic analyzer watches; keep the
//! handlers fast.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants to enable
/// kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook. To omit
/// one, stub it out:
///
/// ```ignore
///   isr_enter: |_| (),
/// ```
pub struct EventsTable {
    /// Called on entry to the syscall dispatcher, with the syscall number.
    pub syscall_enter: fn(u32),
    /// Called on exit from the syscall dispatcher.
    pub syscall_exit: fn(),
    /// Called on entry to a kernel-managed interrupt, with its IRQ number.
    pub isr_enter: fn(u32),
    pub isr_exit: fn(),
    /// Called on entry to the timer tick, with the CPU number.
    pub timer_isr_enter: fn(usize),
    pub timer_isr_exit: fn(),
    /// Called whenever the current task of a CPU changes, with the index of
    /// the task or `None` for the idle task.
    pub context_switch: fn(usize, Option<usize>),
    /// Called at every time-partition window boundary that changes the
    /// active time partition.
    pub tp_switch: fn(usize, usize),
}

/// Supplies the kernel with an events table.
///
/// You can call this more than once if you need to, though that seems odd at
/// first glance.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table` and read by `table`. If
/// this is null, no event table has been provided.
///
/// Any non-null pointed-to table is guaranteed (by the other code in this
/// module) to have static scope.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're handing
        // out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_syscall_enter(nr: u32) {
    if let Some(t) = table() {
        (t.syscall_enter)(nr)
    }
}

pub(crate) fn event_syscall_exit() {
    if let Some(t) = table() {
        (t.syscall_exit)()
    }
}

/// Signals entry to an ISR. This is `pub` so that board interrupt glue
/// outside the kernel's own dispatch can report too.
pub fn event_isr_enter(irq: u32) {
    if let Some(t) = table() {
        (t.isr_enter)(irq)
    }
}

pub fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}

pub(crate) fn event_timer_isr_enter(cpu: usize) {
    if let Some(t) = table() {
        (t.timer_isr_enter)(cpu)
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

pub(crate) fn event_context_switch(cpu: usize, task: Option<usize>) {
    if let Some(t) = table() {
        (t.context_switch)(cpu, task)
    }
}

pub(crate) fn event_tp_switch(cpu: usize, tp: usize) {
    if let Some(t) = table() {
        (t.tp_switch)(cpu, tp)
    }
}

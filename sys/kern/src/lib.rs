// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partitioned real-time kernel.
//!
//! This is the application-independent portion of the operating system: the
//! scheduler, the partition and task state machines, health monitoring, and
//! the time-triggered machinery (counters, alarms, schedule tables) that
//! drives them. Partitions reach all of it through the system call surface
//! in `syscalls`.
//!
//! Code outside of the `arch` module is portable. The only `arch` backend in
//! this tree is the host fake, which stands in for the board layer in tests
//! and simulation.
//!
//! # Design principles
//!
//! 1. Static configuration. The system takes a single shape, described by an
//!    `AppDesc`, and every kernel object is addressed by a dense index into
//!    it.
//! 2. No allocation. All dynamic state lives in fixed-capacity containers
//!    sized by the constants in `app`.
//! 3. One writer per core. Each CPU only mutates the state of objects it
//!    owns; anything aimed at another CPU goes through that CPU's IPI mailbox.
//! 4. Fail fast. A broken kernel invariant is a `uassert!` and takes the
//!    system down rather than continuing with state that can't be trusted.
//! 5. A preference for simple and clear algorithms over fast and clever
//!    algorithms. Configured object counts are small; a linear walk is fine.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;
#[macro_use]
pub mod trace;

pub mod alarm;
pub mod app;
pub mod err;
pub mod ev;
pub mod fail;
pub mod hm;
pub mod ipi;
pub mod isr;
pub mod part;
pub mod profiling;
pub mod rpc;
pub mod sched;
pub mod schedtab;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod wq;

#[cfg(test)]
mod testutil;

pub use startup::Kernel;

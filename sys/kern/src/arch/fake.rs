// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the board and architecture layers.
//!
//! Everything the kernel would poke on real hardware is recorded in a
//! thread-local `Board`, so each test thread sees its own machine. Tests
//! drive the clock with `set_now` and inspect what the kernel asked of the
//! board through `with_board`.

use std::cell::RefCell;

use abi::HmErrorId;

use crate::task::Task;
use crate::time::Timestamp;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            $crate::fail::die(concat!("assertion failed: ", stringify!($cond)))
        }
    };
}

macro_rules! uassert_eq {
    ($a:expr, $b:expr) => {
        match (&$a, &$b) {
            (a, b) => {
                if a != b {
                    $crate::fail::die(format_args!(
                        "assertion failed: {} == {} ({:?} != {:?})",
                        stringify!($a),
                        stringify!($b),
                        a,
                        b,
                    ))
                }
            }
        }
    };
}

macro_rules! klog {
    ($($tt:tt)*) => {
        std::eprintln!($($tt)*)
    };
}

/// Saved register file of a task.
///
/// Only the registers the kernel reads or writes are modeled: six argument
/// registers, the syscall descriptor, three return registers, and the initial
/// program counter and stack pointer set by `reinitialize`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedState {
    pub pc: u32,
    pub sp: u32,
    args: [u32; 6],
    descriptor: u32,
    rets: [u32; 3],
}

impl SavedState {
    /// Loads a system call into the register file, as a trap from user mode
    /// would.
    pub fn load_syscall(&mut self, nr: u32, args: &[u32]) {
        self.descriptor = nr;
        self.args = [0; 6];
        self.args[..args.len()].copy_from_slice(args);
        self.rets = [0; 3];
    }

    pub fn rets(&self) -> [u32; 3] {
        self.rets
    }

    pub fn args(&self) -> [u32; 6] {
        self.args
    }
}

impl crate::task::ArchState for SavedState {
    fn arg0(&self) -> u32 {
        self.args[0]
    }
    fn arg1(&self) -> u32 {
        self.args[1]
    }
    fn arg2(&self) -> u32 {
        self.args[2]
    }
    fn arg3(&self) -> u32 {
        self.args[3]
    }
    fn arg4(&self) -> u32 {
        self.args[4]
    }
    fn arg5(&self) -> u32 {
        self.args[5]
    }

    fn syscall_descriptor(&self) -> u32 {
        self.descriptor
    }

    fn ret0(&mut self, x: u32) {
        self.rets[0] = x;
    }
    fn ret1(&mut self, x: u32) {
        self.rets[1] = x;
    }
    fn ret2(&mut self, x: u32) {
        self.rets[2] = x;
    }
}

/// How `board_halt` should leave the machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HaltMode {
    Shutdown,
    Reset,
}

/// Everything the kernel has asked of the fake board.
#[derive(Debug, Default)]
pub struct Board {
    pub now: u64,
    pub enabled_irqs: Vec<u32>,
    /// When set, `board_hm_exception` claims every exception.
    pub resolve_exceptions: bool,
    /// `(cpu, error, addr, fatal)` per exception offered to the board.
    pub exceptions: Vec<(usize, HmErrorId, u32, bool)>,
    /// `(cpu, old_tp, new_tp)` per time-partition switch.
    pub tp_switches: Vec<(usize, usize, usize)>,
    /// Target CPU per IPI raised.
    pub ipis: Vec<usize>,
    pub callbacks: Vec<u32>,
    /// `(cpu, task index)` per context switch; `None` is the idle task.
    pub switches: Vec<(usize, Option<usize>)>,
    pub halted: Option<HaltMode>,
}

thread_local! {
    static BOARD: RefCell<Board> = RefCell::new(Board::default());
}

/// Runs `f` with the calling thread's board.
pub fn with_board<R>(f: impl FnOnce(&mut Board) -> R) -> R {
    BOARD.with(|b| f(&mut b.borrow_mut()))
}

pub fn now() -> Timestamp {
    with_board(|b| b.now).into()
}

pub fn set_now(ns: u64) {
    with_board(|b| b.now = ns);
}

pub fn enable_irq(irq: u32) {
    with_board(|b| {
        if !b.enabled_irqs.contains(&irq) {
            b.enabled_irqs.push(irq);
        }
    });
}

pub fn disable_irq(irq: u32) {
    with_board(|b| b.enabled_irqs.retain(|&i| i != irq));
}

pub fn irq_enabled(irq: u32) -> bool {
    with_board(|b| b.enabled_irqs.contains(&irq))
}

pub fn board_halt(mode: HaltMode) -> ! {
    with_board(|b| b.halted = Some(mode));
    klog!("board halt requested: {mode:?}");
    panic!("board halt: {mode:?}");
}

/// Offers an exception to the board before the kernel handles it. Returns
/// `true` if the board resolved it.
pub fn board_hm_exception(
    cpu: usize,
    error: HmErrorId,
    addr: u32,
    fatal: bool,
) -> bool {
    with_board(|b| {
        b.exceptions.push((cpu, error, addr, fatal));
        b.resolve_exceptions
    })
}

pub fn board_tp_switch(cpu: usize, old: usize, new: usize) {
    with_board(|b| b.tp_switches.push((cpu, old, new)));
}

pub fn send_ipi(cpu: usize) {
    with_board(|b| b.ipis.push(cpu));
}

pub fn alarm_callback(id: u32) {
    with_board(|b| b.callbacks.push(id));
}

/// Resets a task's register file so that it starts at its entry point on the
/// next switch.
pub fn reinitialize(task: &mut Task) {
    let (pc, sp, arg) = task.initial_context();
    let save = task.save_mut();
    *save = SavedState {
        pc,
        sp,
        ..SavedState::default()
    };
    save.args[0] = arg;
}

pub fn switch_to(cpu: usize, task: Option<&Task>) {
    let index = task.map(|t| t.id().index());
    with_board(|b| b.switches.push((cpu, index)));
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers shared by the kernel's unit tests.

use abi::{ErrorCode, Sysnum, TaskId, TaskState};

pub use crate::arch::{set_now, with_board, Board};
use crate::startup::Kernel;
use crate::task::SysResult;

/// Name lookups for a test application; unknown names are test bugs.
pub struct TestApp(build_kconfig::App);

impl TestApp {
    pub fn task(&self, name: &str) -> TaskId {
        self.0.task(name).unwrap_or_else(|| panic!("no task {name}"))
    }

    pub fn counter(&self, name: &str) -> u32 {
        self.0.counter(name).unwrap_or_else(|| panic!("no counter {name}"))
    }

    pub fn alarm(&self, name: &str) -> u32 {
        self.0.alarm(name).unwrap_or_else(|| panic!("no alarm {name}"))
    }

    pub fn schedtab(&self, name: &str) -> u32 {
        self.0
            .schedtab(name)
            .unwrap_or_else(|| panic!("no schedule table {name}"))
    }

    pub fn wq(&self, name: &str) -> u32 {
        self.0.wq(name).unwrap_or_else(|| panic!("no wait queue {name}"))
    }
}

/// Boots a kernel for the application in `toml` on a fresh board.
pub fn boot(toml: &str) -> (Kernel, TestApp) {
    with_board(|b| *b = Board::default());
    let app = build_kconfig::load_str(toml).unwrap();
    (Kernel::new(app.desc), TestApp(app))
}

/// Activates `task` if needed and schedules until it is current on `cpu`.
pub fn run(k: &mut Kernel, cpu: usize, task: TaskId) {
    if k.task(task).state() == TaskState::Suspended {
        k.task_do_activate(task.index());
    }
    k.schedule(cpu);
    assert_eq!(k.current(cpu), Some(task), "{task:?} did not get the CPU");
}

/// Advances time to `t` and takes a timer interrupt on `cpu`.
pub fn tick_to(k: &mut Kernel, cpu: usize, t: u64) {
    set_now(t);
    k.timer_tick(cpu);
    k.schedule(cpu);
}

/// Decodes syscall return registers.
pub fn result(rets: [u32; 3]) -> SysResult {
    match rets[0] {
        0 => Ok([rets[1], rets[2]]),
        e => Err(ErrorCode::try_from(e).unwrap()),
    }
}

/// Makes the task current on `cpu` trap with system call `nr`, and returns
/// what it was answered. A caller that blocked reads as `Ok([0, 0])`.
pub fn call(k: &mut Kernel, cpu: usize, nr: Sysnum, args: &[u32]) -> SysResult {
    let me = k.current(cpu).unwrap();
    k.task_mut(me).save_mut().load_syscall(nr as u32, args);
    k.syscall_entry(cpu);
    result(k.task(me).save().rets())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Health monitoring.
//!
//! Errors are handled at the lowest level that can deal with them:
//!
//! - Task level: a record goes into the partition's error ring and the
//!   partition's error hook is activated to look at it.
//! - Partition level: the partition is idled or restarted, through the
//!   deferred mode change machinery.
//! - System level: the board is shut down or reset.
//!
//! Which level applies is looked up in the partition's HM table, or for
//! system errors in the selected system table. Any failure to handle an
//! error at one level escalates it to the next.

use abi::{
    ErrorCode, ErrorRecord, ExceptionRecord, HmErrorId, HmLevel, HmPartAction,
    HmSysAction, PartMode, StartCondition, TaskId, TaskState,
};

use crate::arch::{self, HaltMode};
use crate::startup::Kernel;
use crate::trace::Trace;

impl Kernel {
    /// Raises an asynchronous error on behalf of `task`, which is never told.
    pub(crate) fn hm_async_task_error(
        &mut self,
        cpu: usize,
        task: usize,
        error: HmErrorId,
        extra: u32,
    ) {
        let part = self.task_part(task);
        let p = &self.parts[part];
        let entry =
            self.app.hm_part_tables[usize::from(p.desc.hm_table)].entry(error);
        if p.mode == PartMode::Normal && entry.level == HmLevel::Partition {
            if let (Some(code), Some(hook)) = (entry.code, p.desc.error_hook) {
                let h = hook.index();
                let room = p.errors.len()
                    < usize::from(self.tasks[h].desc.max_activations);
                if room && self.task_check_activate(h).is_ok() {
                    let rec = ErrorRecord {
                        task: TaskId::from(task),
                        code,
                        error,
                        extra,
                        time: arch::now().into(),
                    };
                    if self.parts[part].errors.push_back(rec).is_ok() {
                        self.task_do_activate(h);
                        ktrace!(
                            self,
                            Trace::HmTask {
                                task: task as u16,
                                error,
                            }
                        );
                        return;
                    }
                }
            }
        }
        self.hm_part_error(cpu, part, error, extra);
    }

    /// Synchronous exception raised by `task` in user mode.
    pub fn hm_exception_user(
        &mut self,
        cpu: usize,
        task: usize,
        error: HmErrorId,
        addr: u32,
        fatal: bool,
    ) {
        if arch::board_hm_exception(cpu, error, addr, fatal) {
            return;
        }
        if fatal {
            self.hm_system_error(cpu, error, addr);
            return;
        }
        let part = self.task_part(task);
        if let Some(h) = self.parts[part].desc.exception_hook {
            let h = h.index();
            if self.tasks[h].state == TaskState::Suspended && h != task {
                self.parts[part].exception = Some(ExceptionRecord {
                    task: TaskId::from(task),
                    error,
                    addr,
                });
                // The faulting task must not run again before the hook.
                if self.cpus[cpu].current == Some(task) {
                    self.insert_current_head(cpu);
                }
                self.task_do_activate(h);
                self.task_boost_head(h);
                self.cpus[cpu].reschedule = true;
                return;
            }
        }
        self.hm_part_error(cpu, part, error, addr);
    }

    /// Exception taken in kernel mode. Nothing below the system level can
    /// handle it.
    pub fn hm_exception(&mut self, cpu: usize, error: HmErrorId, addr: u32) {
        if arch::board_hm_exception(cpu, error, addr, true) {
            return;
        }
        self.hm_system_error(cpu, error, addr);
    }

    pub(crate) fn hm_part_error(
        &mut self,
        cpu: usize,
        part: usize,
        error: HmErrorId,
        extra: u32,
    ) {
        let p = &self.parts[part];
        let entry =
            self.app.hm_part_tables[usize::from(p.desc.hm_table)].entry(error);
        if entry.level == HmLevel::System {
            self.hm_system_error(cpu, error, extra);
            return;
        }
        let warm = p.warm_eligible;
        let action = match entry.action {
            HmPartAction::WarmStart if !warm => HmPartAction::ColdStart,
            a => a,
        };
        ktrace!(
            self,
            Trace::HmPartition {
                part: part as u8,
                error,
                action,
            }
        );
        let mode = match action {
            HmPartAction::Ignore => return,
            HmPartAction::Idle => PartMode::Idle,
            HmPartAction::WarmStart => PartMode::WarmStart,
            HmPartAction::ColdStart => PartMode::ColdStart,
        };
        self.part_delayed_state_change(
            cpu,
            part,
            mode,
            StartCondition::HmPartitionRestart,
        );
    }

    pub(crate) fn hm_system_error(
        &mut self,
        cpu: usize,
        error: HmErrorId,
        extra: u32,
    ) {
        let action =
            self.app.hm_system_tables[self.hm_system_table].action(error);
        ktrace!(self, Trace::HmSystem { error, action });
        match action {
            HmSysAction::Ignore => {}
            HmSysAction::Shutdown => {
                klog!("cpu {cpu}: {error:?} ({extra:#x}), shutting down");
                arch::board_halt(HaltMode::Shutdown)
            }
            HmSysAction::Reset => {
                klog!("cpu {cpu}: {error:?} ({extra:#x}), resetting");
                arch::board_halt(HaltMode::Reset)
            }
        }
    }

    /// Selects the system HM table. Only a privileged partition on CPU 0
    /// may do this.
    pub fn sys_hm_change_table(
        &mut self,
        cpu: usize,
        table: u32,
    ) -> Result<(), ErrorCode> {
        let part = self.task_part(self.caller(cpu));
        if !self.part_privileged(part) {
            return Err(ErrorCode::Access);
        }
        if cpu != 0 {
            return Err(ErrorCode::Core);
        }
        let t = table as usize;
        if t >= self.app.hm_system_tables.len() {
            return Err(ErrorCode::Id);
        }
        self.hm_system_table = t;
        Ok(())
    }

    pub fn sys_hm_inject(&mut self, cpu: usize, error: HmErrorId, extra: u32) {
        let me = self.caller(cpu);
        self.hm_async_task_error(cpu, me, error, extra);
    }

    /// Takes the oldest record from the caller's error ring. Only the error
    /// hook may call this.
    pub fn sys_hm_get_error(
        &mut self,
        cpu: usize,
    ) -> Result<ErrorRecord, ErrorCode> {
        let me = self.caller(cpu);
        let part = self.task_part(me);
        if self.parts[part].desc.error_hook != Some(TaskId::from(me)) {
            return Err(ErrorCode::Access);
        }
        self.parts[part].errors.pop_front().ok_or(ErrorCode::NoFunc)
    }

    pub fn sys_hm_get_exception(
        &mut self,
        cpu: usize,
    ) -> Result<ExceptionRecord, ErrorCode> {
        let me = self.caller(cpu);
        let part = self.task_part(me);
        if self.parts[part].desc.exception_hook != Some(TaskId::from(me)) {
            return Err(ErrorCode::Access);
        }
        self.parts[part].exception.take().ok_or(ErrorCode::NoFunc)
    }

    /// The caller gives up; handled like an exception it raised.
    pub fn sys_abort(&mut self, cpu: usize, extra: u32) {
        let me = self.caller(cpu);
        self.hm_exception_user(cpu, me, HmErrorId::Abort, extra, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{set_now, with_board};
    use crate::testutil::*;
    use abi::TaskErrorCode;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        error_hook = "eh"
        exception_hook = "xh"
        hm_table = "t"
        [[partition]]
        name = "boss"
        privileged = true
        initial_mode = "normal"
        [[hm_partition_table]]
        name = "t"
        entries = { UserError = { code = 1 }, StateError = { action = "warm_start" }, PowerFail = { level = "system" }, IllegalInstruction = { action = "idle" } }
        [[hm_system_table]]
        entries = { PowerFail = "shutdown" }
        [[hm_system_table]]
        entries = { PowerFail = "reset" }
        [[task]]
        name = "eh"
        partition = "p"
        kind = "error_hook"
        priority = 40
        max_activations = 2
        [[task]]
        name = "xh"
        partition = "p"
        kind = "exception_hook"
        priority = 41
        [[task]]
        name = "main"
        partition = "p"
        priority = 3
        [[task]]
        name = "boss"
        partition = "boss"
        priority = 2
    "#;

    #[test]
    fn records_are_capped_by_hook_activations() {
        set_now(0);
        let (mut k, app) = boot(APP);
        let (main, eh) = (app.task("main"), app.task("eh"));
        run(&mut k, 0, main);
        set_now(7);
        k.sys_hm_inject(0, HmErrorId::UserError, 11);
        k.sys_hm_inject(0, HmErrorId::UserError, 12);
        assert_eq!(k.part(0).error_records().count(), 2);
        // Third: no room in the ring, escalates to the partition level,
        // where UserError is ignored.
        k.sys_hm_inject(0, HmErrorId::UserError, 13);
        assert_eq!(k.part(0).error_records().count(), 2);
        assert_eq!(k.part(0).pending_mode(), None);

        assert_eq!(k.sys_hm_get_error(0), Err(ErrorCode::Access));
        k.schedule(0);
        assert_eq!(k.current(0), Some(eh));
        let rec = k.sys_hm_get_error(0).unwrap();
        assert_eq!(rec.task, main);
        assert_eq!(rec.code, TaskErrorCode(1));
        assert_eq!(rec.extra, 11);
        assert_eq!(rec.time, 7);
        assert_eq!(k.sys_hm_get_error(0).map(|r| r.extra), Ok(12));
        assert_eq!(k.sys_hm_get_error(0), Err(ErrorCode::NoFunc));
    }

    #[test]
    fn warm_start_action_becomes_cold_when_not_eligible() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        k.sys_hm_inject(0, HmErrorId::StateError, 0);
        assert_eq!(k.part(0).pending_mode(), Some(PartMode::WarmStart));
        k.schedule(0);
        assert_eq!(k.part(0).start_condition(), StartCondition::HmPartitionRestart);

        // The partition has no init hook and went straight back to NORMAL,
        // so it stays warm-eligible.
        assert!(k.part(0).warm_eligible());
        k.parts[0].warm_eligible = false;
        run(&mut k, 0, app.task("main"));
        k.sys_hm_inject(0, HmErrorId::StateError, 0);
        assert_eq!(k.part(0).pending_mode(), Some(PartMode::ColdStart));
    }

    #[test]
    fn exception_activates_hook_ahead_of_faulting_task() {
        let (mut k, app) = boot(APP);
        let (main, xh) = (app.task("main"), app.task("xh"));
        run(&mut k, 0, main);
        k.hm_exception_user(0, main.index(), HmErrorId::MpuErrorWrite, 0x100, false);
        k.schedule(0);
        assert_eq!(k.current(0), Some(xh));
        assert_eq!(k.task(main).state(), TaskState::Ready);
        let rec = k.sys_hm_get_exception(0).unwrap();
        assert_eq!(rec.task, main);
        assert_eq!(rec.addr, 0x100);
        assert_eq!(k.sys_hm_get_exception(0), Err(ErrorCode::NoFunc));

        // Busy hook: the second exception goes to the partition table.
        k.hm_exception_user(0, main.index(), HmErrorId::IllegalInstruction, 0, false);
        assert_eq!(k.part(0).pending_mode(), Some(PartMode::Idle));
    }

    #[test]
    fn exception_hook_preempts_regardless_of_priority() {
        let (mut k, app) = boot(&APP.replace("priority = 41", "priority = 1"));
        let (main, xh) = (app.task("main"), app.task("xh"));
        run(&mut k, 0, main);
        k.hm_exception_user(0, main.index(), HmErrorId::IllegalInstruction, 8, false);
        k.schedule(0);
        assert_eq!(k.current(0), Some(xh));
        assert_eq!(k.task(main).state(), TaskState::Ready);

        // A more important task made ready meanwhile waits for the hook too.
        k.task_do_activate(app.task("eh").index());
        k.schedule(0);
        assert_eq!(k.current(0), Some(xh));

        k.sys_task_terminate(0).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0), Some(app.task("eh")));
    }

    #[test]
    fn board_may_resolve_exceptions() {
        let (mut k, app) = boot(APP);
        let main = app.task("main");
        run(&mut k, 0, main);
        with_board(|b| b.resolve_exceptions = true);
        k.hm_exception_user(0, main.index(), HmErrorId::IllegalInstruction, 4, false);
        assert_eq!(k.part(0).pending_mode(), None);
        assert_eq!(
            with_board(|b| b.exceptions.clone()),
            [(0, HmErrorId::IllegalInstruction, 4, false)]
        );
    }

    #[test]
    #[should_panic(expected = "board halt: Reset")]
    fn system_table_selection_picks_halt_mode() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("boss"));
        assert_eq!(k.sys_hm_change_table(0, 5), Err(ErrorCode::Id));
        k.sys_hm_change_table(0, 1).unwrap();
        k.hm_system_error(0, HmErrorId::PowerFail, 0);
    }

    #[test]
    fn system_level_entry_escalates() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        assert_eq!(k.sys_hm_change_table(0, 0), Err(ErrorCode::Access));
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            k.sys_hm_inject(0, HmErrorId::PowerFail, 0)
        }));
        assert!(r.is_err());
        assert_eq!(with_board(|b| b.halted), Some(HaltMode::Shutdown));
    }

    #[test]
    fn abort_is_handled_like_an_exception() {
        let (mut k, app) = boot(APP);
        let main = app.task("main");
        run(&mut k, 0, main);
        k.sys_abort(0, 3);
        assert_eq!(k.part(0).exception().map(|e| e.error), Some(HmErrorId::Abort));
    }
}

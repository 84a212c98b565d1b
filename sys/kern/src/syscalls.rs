// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall dispatch.
//!
//! The typed `sys_*` operations live next to the objects they act on. This
//! module decodes a trapped system call from the caller's saved registers,
//! routes it to the right operation, and writes the outcome back.
//!
//! # Register conventions
//!
//! Arguments arrive in argument registers 0 to 5; 64-bit quantities (times
//! and timeouts) take two consecutive registers, low word first. On return,
//! register 0 holds zero or an `ErrorCode`, and registers 1 and 2 hold the
//! values, if any.
//!
//! A call that blocks gets no result now. The operation that later wakes the
//! caller writes it, using the same convention.

use abi::{
    ErrorCode, HmErrorId, PartMode, Priority, Sysnum, TaskId, WqDiscipline,
};

use crate::err::UserError;
use crate::profiling;
use crate::startup::Kernel;
use crate::task::{ArchState, Blocking};

/// Values for the return registers, or `None` if the caller must not be
/// answered now.
type Reply = Option<[u32; 2]>;

fn task_arg(x: u32) -> Result<TaskId, ErrorCode> {
    u16::try_from(x).map(TaskId).map_err(|_| ErrorCode::Id)
}

fn prio_arg(x: u32) -> Result<Priority, ErrorCode> {
    u8::try_from(x).map(Priority).map_err(|_| ErrorCode::Value)
}

fn mode_arg(x: u32) -> Result<PartMode, ErrorCode> {
    PartMode::try_from(x).map_err(|_| ErrorCode::Value)
}

fn done(v: [u32; 2]) -> Result<Reply, UserError> {
    Ok(Some(v))
}

fn unit(r: Result<(), ErrorCode>) -> Result<Reply, UserError> {
    r?;
    done([0, 0])
}

fn one(r: Result<u32, ErrorCode>) -> Result<Reply, UserError> {
    done([r?, 0])
}

fn blocking<T>(
    r: Result<Blocking<T>, ErrorCode>,
    f: impl FnOnce(T) -> [u32; 2],
) -> Result<Reply, UserError> {
    match r? {
        Blocking::Done(v) => done(f(v)),
        Blocking::Blocked => Ok(None),
    }
}

impl Kernel {
    /// Entry point for a system call trapped on `cpu`, from the task
    /// currently running there.
    ///
    /// Before calling this, the caller's registers must be stored in its
    /// `SavedState`. On return, the task to resume is `current(cpu)`.
    pub fn syscall_entry(&mut self, cpu: usize) {
        let caller = self.caller(cpu);
        let save = self.tasks[caller].save().clone();
        let nr = save.syscall_descriptor();
        profiling::event_syscall_enter(nr);
        let incarnation = self.tasks[caller].incarnation;

        let r = match Sysnum::try_from(nr) {
            Ok(sysnum) => self.dispatch(cpu, sysnum, &save),
            Err(()) => Err(UserError::Fault(HmErrorId::IllegalSyscall)),
        };
        let answer = match r {
            Ok(reply) => reply.map(Ok),
            Err(UserError::Recoverable(code)) => Some(Err(code)),
            Err(UserError::Fault(error)) => {
                self.hm_exception_user(cpu, caller, error, save.pc, false);
                None
            }
        };
        if let Some(result) = answer {
            // Calls that end or restart the caller leave nobody to answer.
            let t = &mut self.tasks[caller];
            if t.incarnation == incarnation
                && t.state != abi::TaskState::Suspended
            {
                t.save_mut().set_result(result);
            }
        }

        if self.cpus[cpu].reschedule {
            self.schedule(cpu);
        }
        profiling::event_syscall_exit();
    }

    fn dispatch(
        &mut self,
        cpu: usize,
        nr: Sysnum,
        save: &crate::arch::SavedState,
    ) -> Result<Reply, UserError> {
        let a = save.syscall_args();
        match nr {
            Sysnum::TaskSelf => done([u32::from(self.sys_task_self(cpu).0), 0]),
            Sysnum::TaskActivate => {
                unit(self.sys_task_activate(cpu, task_arg(a[0])?))
            }
            Sysnum::TaskDelayedActivate => unit(self.sys_task_delayed_activate(
                cpu,
                task_arg(a[0])?,
                save.arg64(1),
            )),
            Sysnum::TaskCreate => unit(self.sys_task_create(
                cpu,
                task_arg(a[0])?,
                prio_arg(a[1])?,
                a[2],
                a[3],
            )),
            Sysnum::TaskTerminate => unit(self.sys_task_terminate(cpu)),
            Sysnum::TaskTerminateOther => {
                unit(self.sys_task_terminate_other(cpu, task_arg(a[0])?))
            }
            Sysnum::TaskChain => unit(self.sys_task_chain(cpu, task_arg(a[0])?)),
            Sysnum::TaskGetState => {
                let s = self.sys_task_get_state(cpu, task_arg(a[0])?)?;
                done([s as u32, 0])
            }
            Sysnum::TaskGetPrio => {
                let p = self.sys_task_get_prio(cpu, task_arg(a[0])?)?;
                done([u32::from(p.0), 0])
            }
            Sysnum::TaskSetPrio => unit(self.sys_task_set_prio(
                cpu,
                task_arg(a[0])?,
                prio_arg(a[1])?,
            )),
            Sysnum::PrioRaise => {
                let old = self.sys_prio_raise(cpu, prio_arg(a[0])?)?;
                done([u32::from(old.0), 0])
            }
            Sysnum::PrioRestore => {
                unit(self.sys_prio_restore(cpu, prio_arg(a[0])?))
            }
            Sysnum::Yield => {
                self.sys_yield(cpu);
                done([0, 0])
            }
            Sysnum::Sleep => {
                blocking(self.sys_sleep(cpu, save.arg64(0)), |()| [0, 0])
            }
            Sysnum::WaitPeriodic => {
                blocking(self.sys_task_wait_periodic(cpu), |()| [0, 0])
            }
            Sysnum::Unblock => unit(self.sys_unblock(cpu, task_arg(a[0])?)),

            Sysnum::EvSet => {
                unit(self.sys_ev_set(cpu, task_arg(a[0])?, a[1]))
            }
            Sysnum::EvGet => one(self.sys_ev_get(cpu, task_arg(a[0])?)),
            Sysnum::EvClear => unit(self.sys_ev_clear(cpu, a[0])),
            Sysnum::EvWait => blocking(
                self.sys_ev_wait(cpu, a[0], save.arg64(1)),
                |m| [m, 0],
            ),

            Sysnum::AlarmBase => {
                // Ticks per base unit is static configuration the partition
                // was built with; the registers carry the run-time limits.
                let b = self.sys_alarm_base(cpu, a[0])?;
                done([b.max_allowed_value, b.min_cycle])
            }
            Sysnum::AlarmGet => one(self.sys_alarm_get(cpu, a[0])),
            Sysnum::AlarmSetRel => {
                unit(self.sys_alarm_set_rel(cpu, a[0], a[1], a[2]))
            }
            Sysnum::AlarmSetAbs => {
                unit(self.sys_alarm_set_abs(cpu, a[0], a[1], a[2]))
            }
            Sysnum::AlarmCancel => unit(self.sys_alarm_cancel(cpu, a[0])),
            Sysnum::CounterIncrement => {
                unit(self.sys_counter_increment(cpu, a[0]))
            }
            Sysnum::CounterGet => one(self.sys_counter_get(a[0])),
            Sysnum::CounterElapsed => {
                let (value, elapsed) = self.sys_counter_elapsed(a[0], a[1])?;
                done([value, elapsed])
            }

            Sysnum::SchedTabStartRel => {
                unit(self.sys_schedtab_start_rel(cpu, a[0], a[1]))
            }
            Sysnum::SchedTabStartAbs => {
                unit(self.sys_schedtab_start_abs(cpu, a[0], a[1]))
            }
            Sysnum::SchedTabStartSync => {
                unit(self.sys_schedtab_start_sync(cpu, a[0]))
            }
            Sysnum::SchedTabStop => unit(self.sys_schedtab_stop(cpu, a[0])),
            Sysnum::SchedTabNext => {
                unit(self.sys_schedtab_next(cpu, a[0], a[1]))
            }
            Sysnum::SchedTabSync => {
                unit(self.sys_schedtab_sync(cpu, a[0], a[1]))
            }
            Sysnum::SchedTabSetAsync => {
                unit(self.sys_schedtab_set_async(cpu, a[0]))
            }
            Sysnum::SchedTabGetStatus => {
                let s = self.sys_schedtab_get_status(cpu, a[0])?;
                done([s as u32, 0])
            }

            Sysnum::WqSetDiscipline => {
                let d = WqDiscipline::try_from(a[1])
                    .map_err(|_| ErrorCode::Value)?;
                unit(self.sys_wq_set_discipline(cpu, a[0], d))
            }
            Sysnum::WqWait => {
                blocking(self.sys_wq_wait(cpu, a[0], save.arg64(1)), |()| {
                    [0, 0]
                })
            }
            Sysnum::WqWake => one(self.sys_wq_wake(cpu, a[0], a[1])),

            Sysnum::PartSelf => done([u32::from(self.sys_part_self(cpu)), 0]),
            Sysnum::PartGetMode => {
                done([self.sys_part_get_operating_mode(cpu) as u32, 0])
            }
            Sysnum::PartSetMode => {
                unit(self.sys_part_set_operating_mode(cpu, mode_arg(a[0])?))
            }
            Sysnum::PartGetStartCondition => {
                done([self.sys_part_get_start_condition(cpu) as u32, 0])
            }
            Sysnum::PartGetModeExt => {
                let m = self.sys_part_get_operating_mode_ext(cpu, a[0])?;
                done([m as u32, 0])
            }
            Sysnum::PartSetModeExt => unit(self.sys_part_set_operating_mode_ext(
                cpu,
                a[0],
                mode_arg(a[1])?,
            )),

            Sysnum::HmChangeTable => unit(self.sys_hm_change_table(cpu, a[0])),
            Sysnum::HmInject => {
                let error =
                    HmErrorId::try_from(a[0]).map_err(|_| ErrorCode::Value)?;
                self.sys_hm_inject(cpu, error, a[1]);
                done([0, 0])
            }
            Sysnum::HmGetError => {
                let r = self.sys_hm_get_error(cpu)?;
                done([
                    u32::from(r.task.0)
                        | (r.error as u32) << 16
                        | u32::from(r.code.0) << 24,
                    r.extra,
                ])
            }
            Sysnum::HmGetException => {
                let r = self.sys_hm_get_exception(cpu)?;
                done([u32::from(r.task.0) | (r.error as u32) << 16, r.addr])
            }
            Sysnum::Abort => {
                self.sys_abort(cpu, a[0]);
                Ok(None)
            }

            Sysnum::RpcCall => blocking(
                self.sys_rpc_call(cpu, task_arg(a[0])?, a[1], save.arg64(2)),
                |v| [v, 0],
            ),
            Sysnum::RpcRecv => blocking(
                self.sys_rpc_recv(cpu, save.arg64(0)),
                |(client, arg)| [u32::from(client.0), arg],
            ),
            Sysnum::RpcReply => {
                unit(self.sys_rpc_reply(cpu, task_arg(a[0])?, a[1]))
            }

            Sysnum::IsrMask => unit(self.sys_isr_mask(cpu, task_arg(a[0])?)),
            Sysnum::IsrUnmask => {
                unit(self.sys_isr_unmask(cpu, task_arg(a[0])?))
            }

            Sysnum::TpScheduleSwitch => {
                unit(self.sys_tp_schedule_switch(cpu, a[0], a[1]))
            }
            Sysnum::TpScheduleGet => {
                let (cur, next) = self.sys_tp_schedule_get(a[0])?;
                done([cur, next])
            }
            Sysnum::GetTime => done(self.sys_get_time().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use abi::TaskState;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        exception_hook = "xh"
        [[task]]
        name = "xh"
        partition = "p"
        kind = "exception_hook"
        priority = 30
        [[task]]
        name = "main"
        partition = "p"
        priority = 3
        events = 3
        [[task]]
        name = "other"
        partition = "p"
        priority = 2
    "#;

    #[test]
    fn results_come_back_in_registers() {
        let (mut k, app) = boot(APP);
        let main = app.task("main");
        run(&mut k, 0, main);
        assert_eq!(
            call(&mut k, 0, Sysnum::TaskSelf, &[]),
            Ok([u32::from(main.0), 0])
        );
        set_now(0x1_0000_0002);
        assert_eq!(call(&mut k, 0, Sysnum::GetTime, &[]), Ok([2, 1]));
        assert_eq!(
            call(&mut k, 0, Sysnum::TaskGetState, &[99]),
            Err(ErrorCode::Id)
        );
        assert_eq!(
            call(&mut k, 0, Sysnum::PartSetMode, &[9]),
            Err(ErrorCode::Value)
        );
    }

    #[test]
    fn blocked_caller_is_answered_on_wake() {
        let (mut k, app) = boot(APP);
        let (main, other) = (app.task("main"), app.task("other"));
        run(&mut k, 0, main);
        // Wait for event 2 forever: both timeout words all ones.
        call(&mut k, 0, Sysnum::EvWait, &[2, u32::MAX, u32::MAX]).unwrap();
        assert_eq!(k.task(main).state(), TaskState::WaitEv);
        assert_eq!(k.current(0), None);

        run(&mut k, 0, other);
        call(&mut k, 0, Sysnum::EvSet, &[u32::from(main.0), 2]).unwrap();
        assert_eq!(k.current(0), Some(main));
        assert_eq!(result(k.task(main).save().rets()), Ok([2, 0]));
    }

    #[test]
    fn terminate_leaves_no_answer() {
        let (mut k, app) = boot(APP);
        let main = app.task("main");
        run(&mut k, 0, main);
        call(&mut k, 0, Sysnum::TaskTerminate, &[]).unwrap();
        assert_eq!(k.task(main).state(), TaskState::Suspended);
        assert_eq!(k.task(main).save().rets(), [0; 3]);
    }

    #[test]
    fn bad_syscall_number_is_an_exception() {
        let (mut k, app) = boot(APP);
        let (main, xh) = (app.task("main"), app.task("xh"));
        run(&mut k, 0, main);
        k.task_mut(main).save_mut().load_syscall(1000, &[]);
        k.syscall_entry(0);
        assert_eq!(k.current(0), Some(xh));
        let e = k.part(0).exception().unwrap();
        assert_eq!((e.task, e.error), (main, HmErrorId::IllegalSyscall));
    }
}

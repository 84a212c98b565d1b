// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inter-processor requests.
//!
//! A CPU never mutates objects owned by another CPU. Instead it queues an
//! `IpiMsg` in the owner's mailbox and raises an IPI; the owner drains its
//! mailbox at the start of its next scheduler pass. The sender has already
//! validated what it could, so the request is reported as successful; a
//! failure on the owning CPU is traced there and, for activations, raised as
//! an `ActivationError`.

use abi::{ErrorCode, HmErrorId, PartMode, StartCondition};

use crate::arch;
use crate::startup::Kernel;
use crate::trace::Trace;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpiMsg {
    Activate { task: u16 },
    SetEvent { task: u16, mask: u32 },
    IncrementCounter { counter: u16 },
    PartMode { part: u8, mode: PartMode },
    TpSchedule { schedule: u8 },
}

impl Kernel {
    /// Queues `msg` for CPU `dst`.
    pub(crate) fn ipi_send(
        &mut self,
        dst: usize,
        msg: IpiMsg,
    ) -> Result<(), ErrorCode> {
        self.mailboxes[dst]
            .push_back(msg)
            .map_err(|_| ErrorCode::Limit)?;
        arch::send_ipi(dst);
        Ok(())
    }

    /// Applies every request queued for `cpu`.
    pub fn ipi_handle(&mut self, cpu: usize) {
        while let Some(msg) = self.mailboxes[cpu].pop_front() {
            if let Err(code) = self.ipi_apply(cpu, msg) {
                ktrace!(
                    self,
                    Trace::RemoteFailed {
                        cpu: cpu as u8,
                        code,
                    }
                );
            }
        }
    }

    fn ipi_apply(&mut self, cpu: usize, msg: IpiMsg) -> Result<(), ErrorCode> {
        match msg {
            IpiMsg::Activate { task } => {
                let t = usize::from(task);
                uassert_eq!(self.task_cpu(t), cpu);
                self.task_activate_local(t).inspect_err(|&e| {
                    self.hm_async_task_error(
                        cpu,
                        t,
                        HmErrorId::ActivationError,
                        e as u32,
                    )
                })
            }
            IpiMsg::SetEvent { task, mask } => {
                let t = usize::from(task);
                uassert_eq!(self.task_cpu(t), cpu);
                self.ev_set_local(t, mask)
            }
            IpiMsg::IncrementCounter { counter } => {
                self.counter_increment(cpu, usize::from(counter));
                Ok(())
            }
            IpiMsg::PartMode { part, mode } => self.part_set_mode(
                cpu,
                usize::from(part),
                mode,
                StartCondition::PartitionRestart,
            ),
            IpiMsg::TpSchedule { schedule } => {
                self.tp_schedule_select(cpu, usize::from(schedule));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::IPI_QUEUE_LEN;
    use crate::arch::with_board;
    use crate::task::Blocking;
    use crate::testutil::*;
    use abi::TaskState;

    const APP: &str = r#"
        [[cpu]]
        [[cpu]]
        schedules = [
            [{ tp = 0, duration = 100 }],
            [{ tp = 0, duration = 50 }],
        ]
        [[partition]]
        name = "boss"
        privileged = true
        initial_mode = "normal"
        [[partition]]
        name = "far"
        cpu = 1
        initial_mode = "normal"
        [[counter]]
        name = "local"
        max_allowed_value = 99
        [[counter]]
        name = "far_ticks"
        cpu = 1
        max_allowed_value = 99
        [[alarm]]
        name = "chain"
        counter = "local"
        partition = "boss"
        action = { increment_counter = "far_ticks" }
        [[task]]
        name = "main"
        partition = "boss"
        priority = 3
        [[task]]
        name = "remote"
        partition = "far"
        priority = 3
        [[task]]
        name = "listener"
        partition = "far"
        priority = 4
        events = 0x3
    "#;

    const FAR: u32 = 1;

    #[test]
    fn activation_is_applied_on_owning_cpu() {
        let (mut k, app) = boot(APP);
        let remote = app.task("remote");
        run(&mut k, 0, app.task("main"));
        assert_eq!(k.sys_task_activate(0, remote), Ok(()));
        assert_eq!(k.task(remote).state(), TaskState::Suspended);
        assert_eq!(with_board(|b| b.ipis.clone()), [1]);

        k.schedule(1);
        assert_eq!(k.current(1), Some(remote));
    }

    #[test]
    fn remote_failure_is_traced() {
        let (mut k, app) = boot(APP);
        let remote = app.task("remote");
        run(&mut k, 0, app.task("main"));
        k.sys_task_activate(0, remote).unwrap();
        k.sys_task_activate(0, remote).unwrap();
        k.schedule(1);
        assert!(k.trace().contains(&Trace::RemoteFailed {
            cpu: 1,
            code: ErrorCode::Limit,
        }));
    }

    #[test]
    fn event_is_set_by_owning_cpu() {
        let (mut k, app) = boot(APP);
        let listener = app.task("listener");
        run(&mut k, 0, app.task("main"));
        k.sys_task_activate(0, listener).unwrap();
        k.schedule(1);
        assert_eq!(k.current(1), Some(listener));
        assert_eq!(k.sys_ev_wait(1, 0x1, abi::INFINITE), Ok(Blocking::Blocked));

        // The mask is checked before anything is sent.
        assert_eq!(k.sys_ev_set(0, listener, 0x4), Err(ErrorCode::Value));
        k.sys_ev_set(0, listener, 0x3).unwrap();
        assert_eq!(k.task(listener).state(), TaskState::WaitEv);
        assert_eq!(k.task(listener).events_pending(), 0);

        k.schedule(1);
        assert_eq!(k.current(1), Some(listener));
        assert_eq!(k.task(listener).events_pending(), 0x3);
        assert_eq!(result(k.task(listener).save().rets()), Ok([0x1, 0]));
    }

    #[test]
    fn counter_is_advanced_by_owning_cpu() {
        let (mut k, app) = boot(APP);
        let far_ticks = app.counter("far_ticks");
        run(&mut k, 0, app.task("main"));
        k.sys_counter_increment(0, far_ticks).unwrap();
        assert_eq!(k.sys_counter_get(far_ticks), Ok(0));
        k.ipi_handle(1);
        assert_eq!(k.sys_counter_get(far_ticks), Ok(1));

        // An alarm on this CPU driving the remote counter.
        k.sys_alarm_set_rel(0, app.alarm("chain"), 2, 0).unwrap();
        k.sys_counter_increment(0, app.counter("local")).unwrap();
        k.sys_counter_increment(0, app.counter("local")).unwrap();
        assert_eq!(with_board(|b| b.ipis.clone()), [1, 1]);
        k.ipi_handle(1);
        assert_eq!(k.sys_counter_get(far_ticks), Ok(2));
    }

    #[test]
    fn mode_change_is_applied_by_owning_cpu() {
        let (mut k, app) = boot(APP);
        let remote = app.task("remote");
        run(&mut k, 0, app.task("main"));
        k.sys_task_activate(0, remote).unwrap();
        k.schedule(1);
        assert_eq!(k.current(1), Some(remote));

        assert_eq!(
            k.sys_part_set_operating_mode_ext(0, FAR, PartMode::Normal),
            Err(ErrorCode::NoFunc)
        );
        k.sys_part_set_operating_mode_ext(0, FAR, PartMode::Idle).unwrap();
        assert_eq!(k.part(FAR as usize).mode(), PartMode::Normal);
        assert_eq!(k.part(FAR as usize).pending_mode(), None);

        k.schedule(1);
        assert_eq!(k.part(FAR as usize).mode(), PartMode::Idle);
        assert!(k.trace().contains(&Trace::ModeChange {
            part: FAR as u8,
            mode: PartMode::Idle,
        }));
        assert_eq!(k.task(remote).state(), TaskState::Suspended);
        assert_eq!(k.current(1), None);
    }

    #[test]
    fn schedule_selector_is_changed_by_owning_cpu() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        assert_eq!(k.sys_tp_schedule_switch(0, 1, 2), Err(ErrorCode::Value));
        k.sys_tp_schedule_switch(0, 1, 1).unwrap();
        assert_eq!(k.sys_tp_schedule_get(1), Ok((0, 0)));
        assert_eq!(with_board(|b| b.ipis.clone()), [1]);
        k.ipi_handle(1);
        assert_eq!(k.sys_tp_schedule_get(1), Ok((0, 1)));
    }

    #[test]
    fn full_mailbox_reports_limit() {
        let (mut k, app) = boot(APP);
        let remote = app.task("remote");
        run(&mut k, 0, app.task("main"));
        for _ in 0..IPI_QUEUE_LEN {
            k.sys_task_activate(0, remote).unwrap();
        }
        assert_eq!(k.sys_task_activate(0, remote), Err(ErrorCode::Limit));
    }
}

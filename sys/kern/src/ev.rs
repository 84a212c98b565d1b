// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Events of extended tasks.
//!
//! Only tasks configured with a non-zero event mask ("extended" tasks) own
//! events. Pending events are cleared whenever the task is (re)started.

use abi::{ErrorCode, HmErrorId, TaskId, TaskState};

use crate::ipi::IpiMsg;
use crate::startup::Kernel;
use crate::task::{Blocking, WaitObj};

impl Kernel {
    /// Sets `mask` on a task of this CPU, waking it if it waits for any of
    /// those events.
    pub(crate) fn ev_set_local(
        &mut self,
        task: usize,
        mask: u32,
    ) -> Result<(), ErrorCode> {
        let t = &mut self.tasks[task];
        ev_check_mask(t.desc.events, mask)?;
        if t.state == TaskState::Suspended {
            return Err(ErrorCode::State);
        }
        t.ev_pending |= mask;
        let got = t.ev_pending & t.ev_wait;
        if t.state == TaskState::WaitEv && got != 0 {
            self.task_wake(task, Ok([got, 0]));
        }
        Ok(())
    }

    /// Event set with nobody to report failure to.
    pub(crate) fn ev_set_async(&mut self, cpu: usize, task: usize, mask: u32) {
        if let Err(e) = self.ev_set_local(task, mask) {
            self.hm_async_task_error(cpu, task, HmErrorId::StateError, e as u32);
        }
    }

    pub fn sys_ev_set(
        &mut self,
        cpu: usize,
        id: TaskId,
        mask: u32,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        let dst = self.task_cpu(t);
        if dst != cpu {
            ev_check_mask(self.tasks[t].desc.events, mask)?;
            return self
                .ipi_send(dst, IpiMsg::SetEvent { task: t as u16, mask });
        }
        self.ev_set_local(t, mask)
    }

    pub fn sys_ev_get(&self, cpu: usize, id: TaskId) -> Result<u32, ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        let task = &self.tasks[t];
        if !task.desc.is_extended() {
            return Err(ErrorCode::Access);
        }
        if task.state == TaskState::Suspended {
            return Err(ErrorCode::State);
        }
        Ok(task.ev_pending)
    }

    pub fn sys_ev_clear(&mut self, cpu: usize, mask: u32) -> Result<(), ErrorCode> {
        let me = self.caller(cpu);
        let t = &mut self.tasks[me];
        if !t.desc.is_extended() {
            return Err(ErrorCode::Access);
        }
        t.ev_pending &= !mask;
        Ok(())
    }

    /// Waits until any event in `mask` is pending and returns the pending
    /// subset of `mask`. Events are not consumed; use `sys_ev_clear`.
    pub fn sys_ev_wait(
        &mut self,
        cpu: usize,
        mask: u32,
        timeout: u64,
    ) -> Result<Blocking<u32>, ErrorCode> {
        let me = self.caller(cpu);
        let t = &mut self.tasks[me];
        ev_check_mask(t.desc.events, mask)?;
        if t.prio != t.base_prio {
            return Err(ErrorCode::Resource);
        }
        let got = t.ev_pending & mask;
        if got != 0 {
            return Ok(Blocking::Done(got));
        }
        if timeout == 0 {
            return Err(ErrorCode::Timeout);
        }
        t.ev_wait = mask;
        self.task_block(me, TaskState::WaitEv, WaitObj::None, timeout);
        Ok(Blocking::Blocked)
    }
}

fn ev_check_mask(events: u32, mask: u32) -> Result<(), ErrorCode> {
    if events == 0 {
        Err(ErrorCode::Access)
    } else if mask == 0 || mask & !events != 0 {
        Err(ErrorCode::Value)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::INFINITE;
    use crate::arch::set_now;
    use crate::testutil::*;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        [[task]]
        name = "waiter"
        partition = "p"
        priority = 8
        events = 0xf
        [[task]]
        name = "setter"
        partition = "p"
        priority = 4
        [[task]]
        name = "idle_ext"
        partition = "p"
        priority = 2
        events = 1
    "#;

    #[test]
    fn basic_task_cannot_wait() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("setter"));
        assert_eq!(k.sys_ev_wait(0, 1, INFINITE), Err(ErrorCode::Access));
        assert_eq!(k.sys_ev_clear(0, 1), Err(ErrorCode::Access));
    }

    #[test]
    fn set_wakes_waiter_with_matching_subset() {
        let (mut k, app) = boot(APP);
        let (waiter, setter) = (app.task("waiter"), app.task("setter"));
        run(&mut k, 0, waiter);
        assert_eq!(k.sys_ev_wait(0, 0b0110, INFINITE), Ok(Blocking::Blocked));
        k.schedule(0);
        run(&mut k, 0, setter);

        k.sys_ev_set(0, waiter, 0b0001).unwrap();
        assert_eq!(k.task(waiter).state(), TaskState::WaitEv);
        k.sys_ev_set(0, waiter, 0b0100).unwrap();
        assert_eq!(k.task(waiter).state(), TaskState::Ready);
        assert_eq!(result(k.task(waiter).save().rets()), Ok([0b0100, 0]));
        assert_eq!(k.sys_ev_get(0, waiter), Ok(0b0101));

        k.schedule(0);
        assert_eq!(k.current(0), Some(waiter));
        assert_eq!(k.sys_ev_wait(0, 0b0001, 0), Ok(Blocking::Done(1)));
        k.sys_ev_clear(0, 0b0101).unwrap();
        assert_eq!(k.sys_ev_wait(0, 0b0001, 0), Err(ErrorCode::Timeout));
    }

    #[test]
    fn set_rejects_suspended_and_foreign_bits() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("setter"));
        let ext = app.task("idle_ext");
        assert_eq!(k.sys_ev_set(0, ext, 1), Err(ErrorCode::State));
        assert_eq!(k.sys_ev_get(0, ext), Err(ErrorCode::State));
        k.sys_task_activate(0, ext).unwrap();
        assert_eq!(k.sys_ev_set(0, ext, 2), Err(ErrorCode::Value));
        assert_eq!(
            k.sys_ev_set(0, app.task("setter"), 1),
            Err(ErrorCode::Access)
        );
    }

    #[test]
    fn wait_times_out() {
        let (mut k, app) = boot(APP);
        let waiter = app.task("waiter");
        set_now(0);
        run(&mut k, 0, waiter);
        assert_eq!(k.sys_ev_wait(0, 1, 40), Ok(Blocking::Blocked));
        tick_to(&mut k, 0, 40);
        assert_eq!(k.current(0), Some(waiter));
        assert_eq!(
            result(k.task(waiter).save().rets()),
            Err(ErrorCode::Timeout)
        );
    }
}

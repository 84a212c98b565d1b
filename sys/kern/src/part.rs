// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partitions and their operating modes.
//!
//! A partition is IDLE, COLD_START, WARM_START or NORMAL. Entering NORMAL
//! happens immediately, from inside the requesting call. Every other change
//! tears down the partition's tasks (possibly including the caller), so it
//! is only recorded here and applied by the scheduler at its next pass on
//! the partition's CPU.

use abi::{
    ErrorCode, ErrorRecord, ExceptionRecord, PartDesc, PartFlags, PartMode,
    SchedTabAutostart, StartCondition, TaskKind, TaskState,
};
use heapless::Deque;

use crate::app::MAX_ERROR_RECORDS;
use crate::arch;
use crate::fail;
use crate::startup::Kernel;
use crate::task::WAIT_FOR_NORMAL;
use crate::time::Timestamp;
use crate::trace::Trace;

#[derive(Debug)]
pub struct Partition {
    pub(crate) desc: &'static PartDesc,
    pub(crate) mode: PartMode,
    pub(crate) start_condition: StartCondition,
    /// Set once the partition reached NORMAL; cleared by a cold start.
    pub(crate) warm_eligible: bool,
    /// Deferred mode change, applied by the scheduler.
    pub(crate) pending: Option<(PartMode, StartCondition)>,
    pub(crate) errors: Deque<ErrorRecord, MAX_ERROR_RECORDS>,
    pub(crate) exception: Option<ExceptionRecord>,
    /// Origin of the periodic release grid of the current NORMAL phase.
    pub(crate) first_release: Timestamp,
}

impl Partition {
    pub(crate) fn new(desc: &'static PartDesc) -> Self {
        Self {
            desc,
            mode: PartMode::Idle,
            start_condition: StartCondition::NormalStart,
            warm_eligible: false,
            pending: None,
            errors: Deque::new(),
            exception: None,
            first_release: Timestamp::ZERO,
        }
    }

    pub fn mode(&self) -> PartMode {
        self.mode
    }

    pub fn start_condition(&self) -> StartCondition {
        self.start_condition
    }

    pub fn warm_eligible(&self) -> bool {
        self.warm_eligible
    }

    pub fn pending_mode(&self) -> Option<PartMode> {
        self.pending.map(|(m, _)| m)
    }

    /// Error records not yet retrieved by the error hook, oldest first.
    pub fn error_records(&self) -> impl Iterator<Item = &ErrorRecord> + '_ {
        self.errors.iter()
    }

    pub fn exception(&self) -> Option<ExceptionRecord> {
        self.exception
    }

    pub fn first_release(&self) -> Timestamp {
        self.first_release
    }
}

/// Checks whether a partition in mode `from` may be switched to `to`.
pub fn check_transition(
    from: PartMode,
    to: PartMode,
    warm_eligible: bool,
) -> Result<(), ErrorCode> {
    use PartMode::*;
    match (from, to) {
        (Normal, Normal) | (Idle, Idle) => Err(ErrorCode::NoFunc),
        (_, ColdStart) => Ok(()),
        (ColdStart | WarmStart | Normal, Idle) => Ok(()),
        (Normal, WarmStart) => Ok(()),
        (Idle, WarmStart) if warm_eligible => Ok(()),
        (ColdStart | WarmStart, Normal) => Ok(()),
        _ => Err(ErrorCode::State),
    }
}

impl Kernel {
    pub(crate) fn part_privileged(&self, part: usize) -> bool {
        self.parts[part].desc.flags.contains(PartFlags::PRIVILEGED)
    }

    pub(crate) fn part_cpu(&self, part: usize) -> usize {
        usize::from(self.parts[part].desc.cpu)
    }

    /// Switches a partition of `cpu` to `mode` after validating the request.
    pub(crate) fn part_set_mode(
        &mut self,
        cpu: usize,
        part: usize,
        mode: PartMode,
        cond: StartCondition,
    ) -> Result<(), ErrorCode> {
        let p = &self.parts[part];
        check_transition(p.mode, mode, p.warm_eligible)?;
        if mode == PartMode::Normal {
            self.part_enter_normal(cpu, part);
        } else {
            self.part_delayed_state_change(cpu, part, mode, cond);
        }
        Ok(())
    }

    /// Records a mode change for the next scheduler pass on `cpu`. A later
    /// request for the same partition replaces an earlier one.
    pub(crate) fn part_delayed_state_change(
        &mut self,
        cpu: usize,
        part: usize,
        mode: PartMode,
        cond: StartCondition,
    ) {
        uassert_eq!(self.part_cpu(part), cpu);
        if self.parts[part].pending.is_none()
            && self.cpus[cpu].pending_parts.push_back(part as u8).is_err()
        {
            fail::die("pending partition list overflow");
        }
        self.parts[part].pending = Some((mode, cond));
        self.cpus[cpu].reschedule = true;
    }

    /// Carries out a deferred mode change.
    pub(crate) fn part_apply_mode(
        &mut self,
        cpu: usize,
        part: usize,
        mode: PartMode,
        cond: StartCondition,
    ) {
        match mode {
            PartMode::Idle => {
                self.part_shutdown(part);
                self.parts[part].mode = PartMode::Idle;
                ktrace!(
                    self,
                    Trace::ModeChange {
                        part: part as u8,
                        mode,
                    }
                );
            }
            PartMode::ColdStart | PartMode::WarmStart => {
                self.part_shutdown(part);
                if mode == PartMode::ColdStart {
                    self.parts[part].warm_eligible = false;
                }
                self.part_start(cpu, part, mode, cond);
            }
            PartMode::Normal => self.part_enter_normal(cpu, part),
        }
    }

    /// Stops everything the partition owns.
    pub(crate) fn part_shutdown(&mut self, part: usize) {
        for t in 0..self.tasks.len() {
            if self.task_part(t) != part {
                continue;
            }
            if self.tasks[t].state != TaskState::Suspended {
                self.task_stop(t);
            }
            if let TaskKind::Isr { irq } = self.tasks[t].desc.kind {
                arch::disable_irq(irq);
            }
        }
        for a in 0..self.alarms.len() {
            if usize::from(self.alarms[a].desc.partition) == part {
                self.alarm_cancel(a);
            }
        }
        for s in 0..self.schedtabs.len() {
            if usize::from(self.schedtabs[s].desc.partition) == part {
                self.schedtab_reset(s);
            }
        }
        for w in 0..self.wqs.len() {
            if usize::from(self.wqs[w].desc.partition) == part {
                self.wq_close(w);
            }
        }
        let p = &mut self.parts[part];
        while p.errors.pop_front().is_some() {}
        p.exception = None;
    }

    /// Starts a partition in COLD_START or WARM_START. Runtime task
    /// parameters revert to their configured values. A partition without an
    /// init hook has nothing to initialize and goes straight to NORMAL.
    pub(crate) fn part_start(
        &mut self,
        cpu: usize,
        part: usize,
        mode: PartMode,
        cond: StartCondition,
    ) {
        uassert!(matches!(mode, PartMode::ColdStart | PartMode::WarmStart));
        let p = &mut self.parts[part];
        p.mode = mode;
        p.start_condition = cond;
        ktrace!(
            self,
            Trace::ModeChange {
                part: part as u8,
                mode,
            }
        );
        for t in 0..self.tasks.len() {
            if self.task_part(t) == part {
                let task = &mut self.tasks[t];
                task.start_prio = task.desc.priority;
                task.entry = task.desc.entry_point;
                task.arg = 0;
                task.irq_enabled = true;
            }
        }
        match self.parts[part].desc.init_hook {
            Some(h) => self.task_do_activate(h.index()),
            None => self.part_enter_normal(cpu, part),
        }
    }

    /// Enters NORMAL: releases tasks that were activated during
    /// initialization, opens ISR lines, and starts autostart alarms and
    /// schedule tables.
    pub(crate) fn part_enter_normal(&mut self, cpu: usize, part: usize) {
        uassert_eq!(self.part_cpu(part), cpu);
        let now = arch::now();
        let first_release = Timestamp::from(kerncore::align_up(
            u64::from(now),
            self.parts[part].desc.period,
        ));
        let p = &mut self.parts[part];
        p.mode = PartMode::Normal;
        p.warm_eligible = true;
        p.first_release = first_release;
        ktrace!(
            self,
            Trace::ModeChange {
                part: part as u8,
                mode: PartMode::Normal,
            }
        );

        if let Some(h) = self.parts[part].desc.init_hook {
            if self.tasks[h.index()].state != TaskState::Suspended {
                self.task_stop(h.index());
            }
        }

        for t in 0..self.tasks.len() {
            if self.task_part(t) != part {
                continue;
            }
            match self.tasks[t].timeout {
                Some(at) if self.tasks[t].state == TaskState::WaitAct => {
                    let at = u64::from(at);
                    if at & WAIT_FOR_NORMAL != 0 {
                        let delay = at & !WAIT_FOR_NORMAL;
                        self.task_release_for_normal(t, delay, first_release);
                    }
                }
                _ => {}
            }
            if let TaskKind::Isr { irq } = self.tasks[t].desc.kind {
                if self.tasks[t].irq_enabled
                    && self.tasks[t].state == TaskState::Suspended
                {
                    arch::enable_irq(irq);
                }
            }
        }

        for a in 0..self.alarms.len() {
            let d = self.alarms[a].desc;
            if usize::from(d.partition) != part {
                continue;
            }
            if let Some(auto) = d.autostart {
                let r = self.alarm_start_rel(a, auto.increment, auto.cycle);
                uassert!(r.is_ok());
            }
        }
        for s in 0..self.schedtabs.len() {
            let d = self.schedtabs[s].desc;
            if usize::from(d.partition) != part {
                continue;
            }
            let r = match d.autostart {
                None => continue,
                Some(SchedTabAutostart::Relative { offset }) => {
                    self.schedtab_start_rel(s, offset)
                }
                Some(SchedTabAutostart::Absolute { start }) => {
                    self.schedtab_start_abs(s, start)
                }
                Some(SchedTabAutostart::Synchron) => self.schedtab_start_sync(s),
            };
            uassert!(r.is_ok());
        }
        self.cpus[cpu].reschedule = true;
    }

    fn caller_part(&self, cpu: usize) -> usize {
        self.task_part(self.caller(cpu))
    }

    pub fn sys_part_self(&self, cpu: usize) -> u8 {
        self.caller_part(cpu) as u8
    }

    pub fn sys_part_get_operating_mode(&self, cpu: usize) -> PartMode {
        self.parts[self.caller_part(cpu)].mode
    }

    pub fn sys_part_get_start_condition(&self, cpu: usize) -> StartCondition {
        self.parts[self.caller_part(cpu)].start_condition
    }

    pub fn sys_part_set_operating_mode(
        &mut self,
        cpu: usize,
        mode: PartMode,
    ) -> Result<(), ErrorCode> {
        let part = self.caller_part(cpu);
        self.part_set_mode(cpu, part, mode, StartCondition::PartitionRestart)
    }

    fn part_lookup_ext(&self, cpu: usize, part: u32) -> Result<usize, ErrorCode> {
        let p = part as usize;
        if p >= self.parts.len() {
            return Err(ErrorCode::Id);
        }
        if !self.part_privileged(self.caller_part(cpu)) {
            return Err(ErrorCode::Access);
        }
        Ok(p)
    }

    pub fn sys_part_get_operating_mode_ext(
        &self,
        cpu: usize,
        part: u32,
    ) -> Result<PartMode, ErrorCode> {
        let p = self.part_lookup_ext(cpu, part)?;
        Ok(self.parts[p].mode)
    }

    /// Changes the mode of any partition. Partitions of other CPUs are
    /// validated here and changed by their own CPU.
    pub fn sys_part_set_operating_mode_ext(
        &mut self,
        cpu: usize,
        part: u32,
        mode: PartMode,
    ) -> Result<(), ErrorCode> {
        let p = self.part_lookup_ext(cpu, part)?;
        let dst = self.part_cpu(p);
        if dst != cpu {
            let target = &self.parts[p];
            check_transition(target.mode, mode, target.warm_eligible)?;
            return self.ipi_send(
                dst,
                crate::ipi::IpiMsg::PartMode {
                    part: p as u8,
                    mode,
                },
            );
        }
        self.part_set_mode(cpu, p, mode, StartCondition::PartitionRestart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{irq_enabled, set_now};
    use crate::testutil::*;

    #[test]
    fn transition_table() {
        use PartMode::*;
        assert_eq!(check_transition(Normal, Normal, true), Err(ErrorCode::NoFunc));
        assert_eq!(check_transition(Idle, Idle, false), Err(ErrorCode::NoFunc));
        assert_eq!(check_transition(ColdStart, WarmStart, true), Err(ErrorCode::State));
        assert_eq!(check_transition(Idle, Normal, true), Err(ErrorCode::State));
        assert_eq!(check_transition(Idle, WarmStart, false), Err(ErrorCode::State));
        assert_eq!(check_transition(Idle, WarmStart, true), Ok(()));
        assert_eq!(check_transition(Normal, ColdStart, true), Ok(()));
        assert_eq!(check_transition(WarmStart, Normal, true), Ok(()));
        assert_eq!(check_transition(Normal, Idle, true), Ok(()));
    }

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        init_hook = "init"
        period = 100
        [[partition]]
        name = "boss"
        privileged = true
        initial_mode = "normal"
        [[task]]
        name = "init"
        partition = "p"
        kind = "init_hook"
        priority = 50
        [[task]]
        name = "aper"
        partition = "p"
        priority = 10
        [[task]]
        name = "late"
        partition = "p"
        priority = 10
        [[task]]
        name = "per"
        partition = "p"
        priority = 20
        period = 100
        [[task]]
        name = "isr"
        partition = "p"
        kind = "isr"
        irq = 3
        priority = 60
        [[task]]
        name = "boss"
        partition = "boss"
        priority = 1
    "#;

    fn p(k: &Kernel) -> &Partition {
        k.part(0)
    }

    #[test]
    fn init_hook_runs_in_cold_start_and_releases_on_normal() {
        set_now(0);
        let (mut k, app) = boot(APP);
        let (init, aper, late, per) = (
            app.task("init"),
            app.task("aper"),
            app.task("late"),
            app.task("per"),
        );
        assert_eq!(p(&k).mode(), PartMode::ColdStart);
        assert_eq!(p(&k).start_condition(), StartCondition::NormalStart);
        assert!(!irq_enabled(3));
        k.schedule(0);
        assert_eq!(k.current(0), Some(init));

        set_now(30);
        k.sys_task_activate(0, aper).unwrap();
        k.sys_task_delayed_activate(0, late, 15).unwrap();
        k.sys_task_delayed_activate(0, per, 5).unwrap();
        assert_eq!(k.task(aper).state(), TaskState::WaitAct);

        set_now(40);
        k.sys_part_set_operating_mode(0, PartMode::Normal).unwrap();
        assert_eq!(p(&k).mode(), PartMode::Normal);
        assert!(p(&k).warm_eligible());
        assert_eq!(p(&k).first_release(), Timestamp::from(100));
        assert_eq!(k.task(init).state(), TaskState::Suspended);
        assert_eq!(k.task(aper).state(), TaskState::Ready);
        assert_eq!(k.task(late).timeout(), Some(Timestamp::from(55)));
        assert_eq!(k.task(per).timeout(), Some(Timestamp::from(105)));
        assert!(irq_enabled(3));

        assert_eq!(
            k.sys_part_set_operating_mode(0, PartMode::Normal),
            Err(ErrorCode::NoFunc)
        );
    }

    #[test]
    fn warm_eligibility_survives_warm_restarts_until_cold() {
        let (mut k, app) = boot(APP);
        let init = app.task("init");
        k.schedule(0);
        assert_eq!(
            k.sys_part_set_operating_mode(0, PartMode::WarmStart),
            Err(ErrorCode::State)
        );
        k.sys_part_set_operating_mode(0, PartMode::Normal).unwrap();

        k.sys_task_activate(0, app.task("aper")).unwrap();
        k.schedule(0);
        k.sys_part_set_operating_mode(0, PartMode::WarmStart).unwrap();
        assert_eq!(p(&k).mode(), PartMode::Normal);
        assert_eq!(p(&k).pending_mode(), Some(PartMode::WarmStart));
        k.schedule(0);
        assert_eq!(p(&k).mode(), PartMode::WarmStart);
        assert_eq!(p(&k).start_condition(), StartCondition::PartitionRestart);
        assert!(p(&k).warm_eligible());
        assert_eq!(k.task(app.task("aper")).state(), TaskState::Suspended);
        assert_eq!(k.current(0), Some(init));

        k.sys_part_set_operating_mode(0, PartMode::Normal).unwrap();
        run(&mut k, 0, app.task("aper"));
        k.sys_part_set_operating_mode(0, PartMode::ColdStart).unwrap();
        k.schedule(0);
        assert_eq!(p(&k).mode(), PartMode::ColdStart);
        assert!(!p(&k).warm_eligible());
        assert_eq!(
            k.sys_part_set_operating_mode(0, PartMode::WarmStart),
            Err(ErrorCode::State)
        );
    }

    #[test]
    fn privileged_partition_controls_others() {
        let (mut k, app) = boot(APP);
        k.schedule(0);
        k.sys_part_set_operating_mode(0, PartMode::Normal).unwrap();
        run(&mut k, 0, app.task("boss"));
        assert_eq!(k.sys_part_get_operating_mode_ext(0, 0), Ok(PartMode::Normal));
        assert_eq!(k.sys_part_get_operating_mode_ext(0, 9), Err(ErrorCode::Id));
        assert_eq!(
            k.sys_part_set_operating_mode_ext(0, 0, PartMode::Normal),
            Err(ErrorCode::NoFunc)
        );
        k.sys_part_set_operating_mode_ext(0, 0, PartMode::Idle).unwrap();
        k.schedule(0);
        assert_eq!(p(&k).mode(), PartMode::Idle);
        let aper = app.task("aper");
        assert_eq!(k.sys_task_activate(0, aper), Err(ErrorCode::State));
        assert_eq!(k.task(aper).state(), TaskState::Suspended);
    }

    #[test]
    fn unprivileged_partition_cannot_reach_others() {
        let (mut k, app) = boot(APP);
        k.schedule(0);
        assert_eq!(k.current(0), Some(app.task("init")));
        assert_eq!(
            k.sys_part_get_operating_mode_ext(0, 1),
            Err(ErrorCode::Access)
        );
    }
}

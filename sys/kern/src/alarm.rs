// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counters and alarms.
//!
//! A counter counts ticks modulo `max_allowed_value + 1`. Hardware counters
//! advance with the timer tick of their CPU, software counters on request.
//! Each counter keeps its active alarms in a list sorted by the number of
//! ticks until expiry, ties in arming order, so that only the head ever
//! needs looking at.
//!
//! An alarm whose action increments another counter can set off a chain of
//! increments. Those are worked off iteratively from a queue, rather than by
//! recursion, and a chain longer than `MAX_COUNTER_CASCADE` is treated as a
//! configuration error.

use abi::{
    AlarmAction, AlarmBase, AlarmDesc, CounterDesc, CounterKind, ErrorCode,
    HmErrorId, TaskId,
};
use heapless::Vec;
use kerncore::{tick_add, tick_diff, ticks_remaining, upper_bound};

use crate::app::{MAX_ALARMS, MAX_COUNTER_CASCADE};
use crate::arch;
use crate::fail;
use crate::ipi::IpiMsg;
use crate::startup::Kernel;

#[derive(Debug)]
pub struct Counter {
    pub(crate) desc: &'static CounterDesc,
    pub(crate) value: u32,
    /// Active alarms, soonest first.
    pub(crate) queue: Vec<u16, MAX_ALARMS>,
}

impl Counter {
    pub(crate) fn new(desc: &'static CounterDesc) -> Self {
        Self {
            desc,
            value: 0,
            queue: Vec::new(),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn alarms(&self) -> impl Iterator<Item = usize> + '_ {
        self.queue.iter().map(|&a| usize::from(a))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmState {
    Idle,
    Active,
}

#[derive(Debug)]
pub struct Alarm {
    pub(crate) desc: &'static AlarmDesc,
    pub(crate) state: AlarmState,
    /// Counter value at which the alarm fires next.
    pub(crate) expiry: u32,
    /// Re-arm distance; zero for one-shot alarms.
    pub(crate) cycle: u32,
}

impl Alarm {
    pub(crate) fn new(desc: &'static AlarmDesc) -> Self {
        Self {
            desc,
            state: AlarmState::Idle,
            expiry: 0,
            cycle: 0,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }
}

impl Kernel {
    fn alarm_counter(&self, alarm: usize) -> usize {
        usize::from(self.alarms[alarm].desc.counter)
    }

    /// Inserts an active alarm into its counter's list.
    pub(crate) fn alarm_enqueue(&mut self, alarm: usize) {
        let c = self.alarm_counter(alarm);
        let alarms = &self.alarms;
        let counter = &mut self.counters[c];
        let (now, max) = (counter.value, counter.desc.max_allowed_value);
        let key = ticks_remaining(alarms[alarm].expiry, now, max);
        let pos = upper_bound(&counter.queue, &key, |&a| {
            ticks_remaining(alarms[usize::from(a)].expiry, now, max)
        });
        if counter.queue.push(alarm as u16).is_err() {
            fail::die("alarm queue overflow");
        }
        counter.queue[pos..].rotate_right(1);
    }

    /// Takes an alarm off its counter's list; returns whether it was there.
    pub(crate) fn alarm_remove(&mut self, alarm: usize) -> bool {
        let c = self.alarm_counter(alarm);
        let q = &mut self.counters[c].queue;
        match q.iter().position(|&a| usize::from(a) == alarm) {
            Some(pos) => {
                q[pos..].rotate_left(1);
                q.truncate(q.len() - 1);
                true
            }
            None => false,
        }
    }

    pub(crate) fn alarm_cancel(&mut self, alarm: usize) {
        self.alarm_remove(alarm);
        self.alarms[alarm].state = AlarmState::Idle;
    }

    pub(crate) fn alarm_arm(&mut self, alarm: usize, expiry: u32, cycle: u32) {
        let a = &mut self.alarms[alarm];
        a.state = AlarmState::Active;
        a.expiry = expiry;
        a.cycle = cycle;
        self.alarm_enqueue(alarm);
    }

    fn alarm_check_cycle(&self, alarm: usize, cycle: u32) -> Result<(), ErrorCode> {
        let d = self.counters[self.alarm_counter(alarm)].desc;
        if cycle != 0 && (cycle < d.min_cycle || cycle > d.max_allowed_value) {
            return Err(ErrorCode::Value);
        }
        Ok(())
    }

    pub(crate) fn alarm_start_rel(
        &mut self,
        alarm: usize,
        increment: u32,
        cycle: u32,
    ) -> Result<(), ErrorCode> {
        if self.alarms[alarm].state == AlarmState::Active {
            return Err(ErrorCode::State);
        }
        let counter = &self.counters[self.alarm_counter(alarm)];
        let max = counter.desc.max_allowed_value;
        if increment == 0 || increment > max {
            return Err(ErrorCode::Value);
        }
        self.alarm_check_cycle(alarm, cycle)?;
        let expiry = tick_add(counter.value, increment, max);
        self.alarm_arm(alarm, expiry, cycle);
        Ok(())
    }

    pub(crate) fn alarm_start_abs(
        &mut self,
        alarm: usize,
        start: u32,
        cycle: u32,
    ) -> Result<(), ErrorCode> {
        if self.alarms[alarm].state == AlarmState::Active {
            return Err(ErrorCode::State);
        }
        let max = self.counters[self.alarm_counter(alarm)]
            .desc
            .max_allowed_value;
        if start > max {
            return Err(ErrorCode::Value);
        }
        self.alarm_check_cycle(alarm, cycle)?;
        self.alarm_arm(alarm, start, cycle);
        Ok(())
    }

    /// Advances counter `counter` of `cpu` by one tick, along with any
    /// counters chained to it through alarm actions.
    pub(crate) fn counter_increment(&mut self, cpu: usize, counter: usize) {
        uassert_eq!(usize::from(self.counters[counter].desc.cpu), cpu);
        if self.cascade.push_back(counter as u16).is_err() {
            fail::die("counter cascade overflow");
        }
        if self.cascade_active {
            return;
        }
        self.cascade_active = true;
        let mut budget = MAX_COUNTER_CASCADE;
        while let Some(c) = self.cascade.pop_front() {
            if budget == 0 {
                fail::die("counter cascade too long");
            }
            budget -= 1;
            self.counter_tick(cpu, usize::from(c));
        }
        self.cascade_active = false;
    }

    fn counter_tick(&mut self, cpu: usize, counter: usize) {
        let c = &mut self.counters[counter];
        c.value = tick_add(c.value, 1, c.desc.max_allowed_value);
        while let Some(&a) = self.counters[counter].queue.first() {
            let a = usize::from(a);
            if self.alarms[a].expiry != self.counters[counter].value {
                break;
            }
            self.alarm_expire(cpu, a);
        }
    }

    /// Fires the alarm at the head of its counter's list.
    fn alarm_expire(&mut self, cpu: usize, alarm: usize) {
        self.alarm_remove(alarm);
        if self.alarms[alarm].cycle == 0 {
            self.alarms[alarm].state = AlarmState::Idle;
        }
        self.alarm_dispatch(cpu, alarm);

        let c = self.alarm_counter(alarm);
        let a = &self.alarms[alarm];
        let queued = self.counters[c].queue.iter().any(|&q| usize::from(q) == alarm);
        if a.state == AlarmState::Active && !queued {
            if a.cycle == 0 {
                self.alarms[alarm].state = AlarmState::Idle;
            } else {
                let max = self.counters[c].desc.max_allowed_value;
                let next = tick_add(a.expiry, a.cycle, max);
                self.alarms[alarm].expiry = next;
                self.alarm_enqueue(alarm);
            }
        }
    }

    fn alarm_dispatch(&mut self, cpu: usize, alarm: usize) {
        match self.alarms[alarm].desc.action {
            AlarmAction::ActivateTask { task } | AlarmAction::Hook { task } => {
                self.notify_activate(cpu, task)
            }
            AlarmAction::SetEvent { task, mask } => {
                self.notify_event(cpu, task, mask)
            }
            AlarmAction::Callback { id } => arch::alarm_callback(id),
            AlarmAction::IncrementCounter { counter } => {
                let c = usize::from(counter);
                let dst = usize::from(self.counters[c].desc.cpu);
                if dst == cpu {
                    self.counter_increment(cpu, c);
                } else if self
                    .ipi_send(dst, IpiMsg::IncrementCounter { counter })
                    .is_err()
                {
                    klog!("cpu {cpu}: increment of counter {c} lost");
                }
            }
            AlarmAction::SchedTab { schedtab } => {
                let s = usize::from(schedtab);
                match self.schedtab_process(cpu, s) {
                    Some(wait) => {
                        let a = &mut self.alarms[alarm];
                        a.state = AlarmState::Active;
                        a.cycle = wait;
                    }
                    None => self.alarms[alarm].state = AlarmState::Idle,
                }
            }
        }
    }

    /// Activates `task` on behalf of a time-triggered action, forwarding to
    /// the owning CPU if needed. Failures go to HM, never to the trigger.
    pub(crate) fn notify_activate(&mut self, cpu: usize, task: TaskId) {
        let t = task.index();
        let dst = self.task_cpu(t);
        if dst == cpu {
            self.task_activate_async(cpu, t);
        } else if let Err(e) =
            self.ipi_send(dst, IpiMsg::Activate { task: task.0 })
        {
            self.hm_async_task_error(
                cpu,
                t,
                HmErrorId::ActivationError,
                e as u32,
            );
        }
    }

    pub(crate) fn notify_event(&mut self, cpu: usize, task: TaskId, mask: u32) {
        let t = task.index();
        let dst = self.task_cpu(t);
        if dst == cpu {
            self.ev_set_async(cpu, t, mask);
        } else if let Err(e) =
            self.ipi_send(dst, IpiMsg::SetEvent { task: task.0, mask })
        {
            self.hm_async_task_error(cpu, t, HmErrorId::StateError, e as u32);
        }
    }

    /// Resolves an alarm named in a system call. Alarms driving schedule
    /// tables are not user-visible.
    fn alarm_lookup(&self, cpu: usize, id: u32) -> Result<usize, ErrorCode> {
        let a = id as usize;
        let Some(alarm) = self.alarms.get(a) else {
            return Err(ErrorCode::Id);
        };
        if matches!(alarm.desc.action, AlarmAction::SchedTab { .. }) {
            return Err(ErrorCode::Id);
        }
        let mine = self.task_part(self.caller(cpu));
        if usize::from(alarm.desc.partition) != mine
            && !self.part_privileged(mine)
        {
            return Err(ErrorCode::Access);
        }
        Ok(a)
    }

    fn alarm_lookup_local(
        &self,
        cpu: usize,
        id: u32,
    ) -> Result<usize, ErrorCode> {
        let a = self.alarm_lookup(cpu, id)?;
        if usize::from(self.counters[self.alarm_counter(a)].desc.cpu) != cpu {
            return Err(ErrorCode::Core);
        }
        Ok(a)
    }

    pub fn sys_alarm_base(
        &self,
        cpu: usize,
        id: u32,
    ) -> Result<AlarmBase, ErrorCode> {
        let a = self.alarm_lookup(cpu, id)?;
        let d = self.counters[self.alarm_counter(a)].desc;
        Ok(AlarmBase {
            max_allowed_value: d.max_allowed_value,
            ticks_per_base: d.ticks_per_base,
            min_cycle: d.min_cycle,
        })
    }

    /// Returns the ticks left until the alarm fires.
    pub fn sys_alarm_get(&self, cpu: usize, id: u32) -> Result<u32, ErrorCode> {
        let a = self.alarm_lookup(cpu, id)?;
        let alarm = &self.alarms[a];
        if alarm.state == AlarmState::Idle {
            return Err(ErrorCode::NoFunc);
        }
        let c = &self.counters[self.alarm_counter(a)];
        let left =
            ticks_remaining(alarm.expiry, c.value, c.desc.max_allowed_value);
        Ok(u32::try_from(left).unwrap_or(u32::MAX))
    }

    pub fn sys_alarm_set_rel(
        &mut self,
        cpu: usize,
        id: u32,
        increment: u32,
        cycle: u32,
    ) -> Result<(), ErrorCode> {
        let a = self.alarm_lookup_local(cpu, id)?;
        self.alarm_start_rel(a, increment, cycle)
    }

    pub fn sys_alarm_set_abs(
        &mut self,
        cpu: usize,
        id: u32,
        start: u32,
        cycle: u32,
    ) -> Result<(), ErrorCode> {
        let a = self.alarm_lookup_local(cpu, id)?;
        self.alarm_start_abs(a, start, cycle)
    }

    pub fn sys_alarm_cancel(&mut self, cpu: usize, id: u32) -> Result<(), ErrorCode> {
        let a = self.alarm_lookup_local(cpu, id)?;
        if self.alarms[a].state == AlarmState::Idle {
            return Err(ErrorCode::NoFunc);
        }
        self.alarm_cancel(a);
        Ok(())
    }

    fn counter_lookup(&self, id: u32) -> Result<usize, ErrorCode> {
        let c = id as usize;
        if c >= self.counters.len() {
            return Err(ErrorCode::Id);
        }
        Ok(c)
    }

    /// Advances a software counter by one tick, here or on its own CPU.
    pub fn sys_counter_increment(
        &mut self,
        cpu: usize,
        id: u32,
    ) -> Result<(), ErrorCode> {
        let c = self.counter_lookup(id)?;
        let d = self.counters[c].desc;
        if d.kind != CounterKind::Software {
            return Err(ErrorCode::Id);
        }
        let dst = usize::from(d.cpu);
        if dst != cpu {
            return self.ipi_send(dst, IpiMsg::IncrementCounter { counter: c as u16 });
        }
        self.counter_increment(cpu, c);
        Ok(())
    }

    pub fn sys_counter_get(&self, id: u32) -> Result<u32, ErrorCode> {
        let c = self.counter_lookup(id)?;
        Ok(self.counters[c].value)
    }

    /// Returns the current value and the ticks elapsed since `previous`.
    pub fn sys_counter_elapsed(
        &self,
        id: u32,
        previous: u32,
    ) -> Result<(u32, u32), ErrorCode> {
        let c = self.counter_lookup(id)?;
        let counter = &self.counters[c];
        let max = counter.desc.max_allowed_value;
        if previous > max {
            return Err(ErrorCode::Value);
        }
        Ok((counter.value, tick_diff(counter.value, previous, max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::with_board;
    use crate::testutil::*;
    use abi::TaskState;
    use proptest::prelude::*;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        [[partition]]
        name = "q"
        initial_mode = "normal"
        [[counter]]
        name = "sw"
        max_allowed_value = 99
        min_cycle = 2
        [[counter]]
        name = "chained"
        max_allowed_value = 9
        [[task]]
        name = "main"
        partition = "p"
        priority = 3
        [[task]]
        name = "worker"
        partition = "p"
        priority = 5
        max_activations = 8
        [[alarm]]
        name = "act"
        counter = "sw"
        partition = "p"
        action = { activate_task = "worker" }
        [[alarm]]
        name = "cb"
        counter = "sw"
        partition = "p"
        action = { callback = 17 }
        [[alarm]]
        name = "chain"
        counter = "sw"
        partition = "p"
        action = { increment_counter = "chained" }
        [[alarm]]
        name = "foreign"
        counter = "sw"
        partition = "q"
        action = { callback = 1 }
    "#;

    fn tick(k: &mut Kernel, app: &TestApp, n: u32) {
        for _ in 0..n {
            k.sys_counter_increment(0, app.counter("sw")).unwrap();
        }
    }

    #[test]
    fn set_rel_then_get_round_trips() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        let act = app.alarm("act");
        assert_eq!(k.sys_alarm_get(0, act), Err(ErrorCode::NoFunc));
        k.sys_alarm_set_rel(0, act, 30, 0).unwrap();
        assert_eq!(k.sys_alarm_get(0, act), Ok(30));
        tick(&mut k, &app, 12);
        assert_eq!(k.sys_alarm_get(0, act), Ok(18));
        assert_eq!(k.sys_alarm_set_rel(0, act, 5, 0), Err(ErrorCode::State));
    }

    #[test]
    fn parameter_checks() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        let cb = app.alarm("cb");
        assert_eq!(k.sys_alarm_set_rel(0, cb, 0, 0), Err(ErrorCode::Value));
        assert_eq!(k.sys_alarm_set_rel(0, cb, 100, 0), Err(ErrorCode::Value));
        assert_eq!(k.sys_alarm_set_rel(0, cb, 5, 1), Err(ErrorCode::Value));
        assert_eq!(k.sys_alarm_set_abs(0, cb, 100, 0), Err(ErrorCode::Value));
        assert_eq!(k.sys_alarm_cancel(0, cb), Err(ErrorCode::NoFunc));
        assert_eq!(k.sys_alarm_get(0, 99), Err(ErrorCode::Id));
        assert_eq!(
            k.sys_alarm_get(0, app.alarm("foreign")),
            Err(ErrorCode::Access)
        );
        let base = k.sys_alarm_base(0, cb).unwrap();
        assert_eq!(base.max_allowed_value, 99);
        assert_eq!(base.min_cycle, 2);
    }

    #[test]
    fn cyclic_alarm_activates_each_period() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        let worker = app.task("worker");
        k.sys_alarm_set_rel(0, app.alarm("act"), 3, 4).unwrap();
        tick(&mut k, &app, 2);
        assert_eq!(k.task(worker).state(), TaskState::Suspended);
        tick(&mut k, &app, 1);
        assert_eq!(k.task(worker).state(), TaskState::Ready);
        tick(&mut k, &app, 8);
        assert_eq!(k.task(worker).pending_activations(), 2);
    }

    #[test]
    fn absolute_alarm_across_wrap_and_callbacks() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        tick(&mut k, &app, 95);
        k.sys_alarm_set_abs(0, app.alarm("cb"), 2, 0).unwrap();
        assert_eq!(k.sys_alarm_get(0, app.alarm("cb")), Ok(7));
        tick(&mut k, &app, 7);
        assert_eq!(with_board(|b| b.callbacks.clone()), [17]);
        assert_eq!(k.counter(app.counter("sw")).value(), 2);
        assert_eq!(k.alarm(app.alarm("cb")).state(), AlarmState::Idle);
    }

    #[test]
    fn chained_counter_advances() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        k.sys_alarm_set_rel(0, app.alarm("chain"), 2, 2).unwrap();
        tick(&mut k, &app, 10);
        assert_eq!(k.sys_counter_get(app.counter("chained")), Ok(5));
        assert_eq!(
            k.sys_counter_elapsed(app.counter("chained"), 8),
            Ok((5, 7))
        );
        assert_eq!(
            k.sys_counter_elapsed(app.counter("chained"), 10),
            Err(ErrorCode::Value)
        );
    }

    const MANY: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        [[counter]]
        name = "sw"
        max_allowed_value = 31
        [[task]]
        name = "main"
        partition = "p"
        priority = 3
        [[alarm]]
        name = "a0"
        counter = "sw"
        partition = "p"
        action = { callback = 0 }
        [[alarm]]
        name = "a1"
        counter = "sw"
        partition = "p"
        action = { callback = 1 }
        [[alarm]]
        name = "a2"
        counter = "sw"
        partition = "p"
        action = { callback = 2 }
        [[alarm]]
        name = "a3"
        counter = "sw"
        partition = "p"
        action = { callback = 3 }
    "#;

    fn assert_sorted(k: &Kernel, c: usize) {
        let counter = k.counter(c as u32);
        let max = counter.desc.max_allowed_value;
        let keys: std::vec::Vec<_> = counter
            .alarms()
            .map(|a| ticks_remaining(k.alarm(a as u32).expiry(), counter.value(), max))
            .collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]), "{keys:?}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn alarm_list_stays_sorted(
            ops in proptest::collection::vec((0u8..3, 0u32..4, 1u32..=31, 0u32..=31), 1..60)
        ) {
            let (mut k, app) = boot(MANY);
            run(&mut k, 0, app.task("main"));
            let sw = app.counter("sw");
            for (op, alarm, inc, cycle) in ops {
                let cycle = if cycle == 1 { 0 } else { cycle };
                match op {
                    0 => { let _ = k.sys_alarm_set_rel(0, alarm, inc, cycle); }
                    1 => { let _ = k.sys_alarm_cancel(0, alarm); }
                    _ => {
                        for _ in 0..inc {
                            k.sys_counter_increment(0, sw).unwrap();
                        }
                    }
                }
                assert_sorted(&k, sw as usize);
            }
        }
    }
}

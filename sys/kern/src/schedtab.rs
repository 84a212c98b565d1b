// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Schedule tables.
//!
//! A schedule table is a precompiled list of actions, split into expiry
//! points by `Wait` actions. Each table owns one alarm on its counter; an
//! expiry of that alarm runs the table from its current index up to the next
//! `Wait`, whose duration becomes the alarm's cycle, or up to the closing
//! `Wrap`.
//!
//! Explicitly synchronized tables track their deviation from an external
//! reference supplied through `sys_schedtab_sync`, and work it off at each
//! `Wait` within the budget set by the preceding `Shorten`/`Lengthen`
//! actions.

use abi::{
    ErrorCode, SchedTabAction, SchedTabDesc, SchedTabState, SyncStrategy,
};
use kerncore::{
    deviation_correction, tick_add, tick_diff, ticks_remaining, wrap_deviation,
};

use crate::startup::Kernel;

#[derive(Debug)]
pub struct SchedTab {
    pub(crate) desc: &'static SchedTabDesc,
    pub(crate) state: SchedTabState,
    /// Next action to process.
    pub(crate) index: usize,
    /// Nominal table offset of the last expiry point processed.
    pub(crate) position: u32,
    /// Counter value at the last expiry point processed.
    pub(crate) last_tick: u32,
    /// Nominal length of the wait in progress.
    pub(crate) pending_wait: u32,
    /// Positive when the table runs ahead of its reference.
    pub(crate) deviation: i64,
    pub(crate) next: Option<u16>,
    pub(crate) max_shorten: u32,
    pub(crate) max_lengthen: u32,
}

impl SchedTab {
    pub(crate) fn new(desc: &'static SchedTabDesc) -> Self {
        Self {
            desc,
            state: SchedTabState::Stopped,
            index: 0,
            position: 0,
            last_tick: 0,
            pending_wait: 0,
            deviation: 0,
            next: None,
            max_shorten: 0,
            max_lengthen: 0,
        }
    }

    fn begin(&mut self, state: SchedTabState) {
        *self = Self {
            state,
            ..Self::new(self.desc)
        };
    }

    pub fn state(&self) -> SchedTabState {
        self.state
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn deviation(&self) -> i64 {
        self.deviation
    }

    pub fn next(&self) -> Option<usize> {
        self.next.map(usize::from)
    }
}

/// Where processing of one expiry point ended.
enum Step {
    Wait(u32),
    Stop,
    Switch(usize),
}

impl Kernel {
    fn schedtab_alarm(&self, s: usize) -> usize {
        usize::from(self.schedtabs[s].desc.alarm)
    }

    fn schedtab_counter(&self, s: usize) -> usize {
        usize::from(self.schedtabs[s].desc.counter)
    }

    /// Stops table `s` and unlinks it from any chain it takes part in.
    pub(crate) fn schedtab_reset(&mut self, s: usize) {
        self.alarm_cancel(self.schedtab_alarm(s));
        if self.schedtabs[s].state == SchedTabState::Next {
            for st in self.schedtabs.iter_mut() {
                if st.next == Some(s as u16) {
                    st.next = None;
                }
            }
        }
        if let Some(n) = self.schedtabs[s].next {
            let n = usize::from(n);
            if self.schedtabs[n].state == SchedTabState::Next {
                self.schedtabs[n].begin(SchedTabState::Stopped);
            }
        }
        self.schedtabs[s].begin(SchedTabState::Stopped);
    }

    pub(crate) fn schedtab_start_rel(
        &mut self,
        s: usize,
        offset: u32,
    ) -> Result<(), ErrorCode> {
        let st = &self.schedtabs[s];
        if st.desc.sync == SyncStrategy::Implicit {
            return Err(ErrorCode::Id);
        }
        if st.state != SchedTabState::Stopped {
            return Err(ErrorCode::State);
        }
        let counter = &self.counters[self.schedtab_counter(s)];
        let max = counter.desc.max_allowed_value;
        if offset == 0 || offset > max {
            return Err(ErrorCode::Value);
        }
        let expiry = tick_add(counter.value, offset, max);
        self.schedtabs[s].begin(SchedTabState::Running);
        self.alarm_arm(self.schedtab_alarm(s), expiry, 0);
        Ok(())
    }

    pub(crate) fn schedtab_start_abs(
        &mut self,
        s: usize,
        start: u32,
    ) -> Result<(), ErrorCode> {
        let st = &self.schedtabs[s];
        if st.state != SchedTabState::Stopped {
            return Err(ErrorCode::State);
        }
        let max = self.counters[self.schedtab_counter(s)]
            .desc
            .max_allowed_value;
        if start > max {
            return Err(ErrorCode::Value);
        }
        let state = if st.desc.sync == SyncStrategy::Implicit {
            SchedTabState::RunningSync
        } else {
            SchedTabState::Running
        };
        self.schedtabs[s].begin(state);
        self.alarm_arm(self.schedtab_alarm(s), start, 0);
        Ok(())
    }

    /// Parks an explicitly synchronized table until its first sync value.
    pub(crate) fn schedtab_start_sync(&mut self, s: usize) -> Result<(), ErrorCode> {
        let st = &mut self.schedtabs[s];
        if st.desc.sync != SyncStrategy::Explicit {
            return Err(ErrorCode::Id);
        }
        if st.state != SchedTabState::Stopped {
            return Err(ErrorCode::State);
        }
        st.begin(SchedTabState::Waiting);
        Ok(())
    }

    /// Processes the expiry point of table `s` that its alarm just reached.
    /// Returns the ticks until the next expiry point, or `None` if the alarm
    /// should go idle.
    pub(crate) fn schedtab_process(
        &mut self,
        cpu: usize,
        s: usize,
    ) -> Option<u32> {
        let mut cur = s;
        loop {
            match self.schedtab_step(cpu, cur) {
                Step::Wait(wait) if cur == s => return Some(wait),
                Step::Wait(wait) => {
                    // A successor took over; it runs on its own alarm.
                    let c = &self.counters[self.schedtab_counter(cur)];
                    let expiry =
                        tick_add(c.value, wait, c.desc.max_allowed_value);
                    self.alarm_arm(self.schedtab_alarm(cur), expiry, wait);
                    return None;
                }
                Step::Stop => return None,
                Step::Switch(n) => cur = n,
            }
        }
    }

    fn schedtab_step(&mut self, cpu: usize, s: usize) -> Step {
        let now = self.counters[self.schedtab_counter(s)].value;
        let st = &mut self.schedtabs[s];
        st.position = (st.position + st.pending_wait) % st.desc.duration;
        st.pending_wait = 0;
        st.last_tick = now;

        loop {
            let st = &mut self.schedtabs[s];
            let action = st.desc.actions[st.index];
            st.index += 1;
            match action {
                SchedTabAction::Start => {}
                SchedTabAction::Event { task, mask } => {
                    self.notify_event(cpu, task, mask)
                }
                SchedTabAction::Task { task } | SchedTabAction::Hook { task } => {
                    self.notify_activate(cpu, task)
                }
                SchedTabAction::Shorten { ticks } => st.max_shorten = ticks,
                SchedTabAction::Lengthen { ticks } => st.max_lengthen = ticks,
                SchedTabAction::Wait { ticks } => {
                    return Step::Wait(self.schedtab_correct(s, ticks));
                }
                SchedTabAction::Wrap => {
                    st.index = 0;
                    st.position = 0;
                    if let Some(n) = st.next.take() {
                        let (state, deviation) = (st.state, st.deviation);
                        st.begin(SchedTabState::Stopped);
                        let next = &mut self.schedtabs[usize::from(n)];
                        // Only an explicitly synchronized successor carries
                        // the synchronization state over.
                        let (state, deviation) = match next.desc.sync {
                            SyncStrategy::Explicit => (state, deviation),
                            SyncStrategy::Implicit => {
                                (SchedTabState::RunningSync, 0)
                            }
                            SyncStrategy::None => (SchedTabState::Running, 0),
                        };
                        next.begin(state);
                        next.deviation = deviation;
                        return Step::Switch(usize::from(n));
                    }
                    if !st.desc.repeating {
                        st.begin(SchedTabState::Stopped);
                        return Step::Stop;
                    }
                }
            }
        }
    }

    /// Applies deviation correction to a `Wait` of `ticks`, consuming the
    /// budgets collected since the previous one.
    fn schedtab_correct(&mut self, s: usize, ticks: u32) -> u32 {
        let st = &mut self.schedtabs[s];
        st.pending_wait = ticks;
        let shorten = core::mem::take(&mut st.max_shorten);
        let lengthen = core::mem::take(&mut st.max_lengthen);
        if st.desc.sync != SyncStrategy::Explicit
            || !st.state.is_running()
            || st.deviation == 0
        {
            return ticks;
        }
        let c = deviation_correction(
            st.deviation,
            shorten.min(ticks - 1),
            lengthen,
        );
        st.deviation -= c;
        st.state = if st.deviation.unsigned_abs() <= u64::from(st.desc.precision)
        {
            SchedTabState::RunningSync
        } else {
            SchedTabState::RunningAsync
        };
        (i64::from(ticks) + c) as u32
    }

    /// Current position of a started table, in `0..duration`.
    fn schedtab_position_now(&self, s: usize) -> u32 {
        let st = &self.schedtabs[s];
        let c = &self.counters[self.schedtab_counter(s)];
        let max = c.desc.max_allowed_value;
        let dur = u64::from(st.desc.duration);
        if st.index == 0 {
            // Not at its first expiry point yet: position 0 is ahead.
            let alarm = &self.alarms[self.schedtab_alarm(s)];
            let ahead = ticks_remaining(alarm.expiry, c.value, max) % dur;
            ((dur - ahead) % dur) as u32
        } else {
            let elapsed = u64::from(tick_diff(c.value, st.last_tick, max));
            ((u64::from(st.position) + elapsed) % dur) as u32
        }
    }

    fn schedtab_lookup(&self, cpu: usize, id: u32) -> Result<usize, ErrorCode> {
        let s = id as usize;
        let Some(st) = self.schedtabs.get(s) else {
            return Err(ErrorCode::Id);
        };
        let mine = self.task_part(self.caller(cpu));
        if usize::from(st.desc.partition) != mine && !self.part_privileged(mine)
        {
            return Err(ErrorCode::Access);
        }
        if usize::from(self.counters[self.schedtab_counter(s)].desc.cpu) != cpu
        {
            return Err(ErrorCode::Core);
        }
        Ok(s)
    }

    pub fn sys_schedtab_start_rel(
        &mut self,
        cpu: usize,
        id: u32,
        offset: u32,
    ) -> Result<(), ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        self.schedtab_start_rel(s, offset)
    }

    pub fn sys_schedtab_start_abs(
        &mut self,
        cpu: usize,
        id: u32,
        start: u32,
    ) -> Result<(), ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        self.schedtab_start_abs(s, start)
    }

    pub fn sys_schedtab_start_sync(
        &mut self,
        cpu: usize,
        id: u32,
    ) -> Result<(), ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        self.schedtab_start_sync(s)
    }

    pub fn sys_schedtab_stop(&mut self, cpu: usize, id: u32) -> Result<(), ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        if self.schedtabs[s].state == SchedTabState::Stopped {
            return Err(ErrorCode::NoFunc);
        }
        self.schedtab_reset(s);
        Ok(())
    }

    /// Chains `to` behind the running table `from`, replacing any earlier
    /// successor.
    pub fn sys_schedtab_next(
        &mut self,
        cpu: usize,
        from: u32,
        to: u32,
    ) -> Result<(), ErrorCode> {
        let f = self.schedtab_lookup(cpu, from)?;
        let t = self.schedtab_lookup(cpu, to)?;
        if self.schedtabs[f].desc.counter != self.schedtabs[t].desc.counter {
            return Err(ErrorCode::Id);
        }
        if !self.schedtabs[f].state.is_running() {
            return Err(ErrorCode::NoFunc);
        }
        if self.schedtabs[t].state != SchedTabState::Stopped {
            return Err(ErrorCode::State);
        }
        if let Some(old) = self.schedtabs[f].next.replace(t as u16) {
            self.schedtabs[usize::from(old)].begin(SchedTabState::Stopped);
        }
        self.schedtabs[t].state = SchedTabState::Next;
        Ok(())
    }

    /// Reports the reference position `value` to an explicitly synchronized
    /// table.
    pub fn sys_schedtab_sync(
        &mut self,
        cpu: usize,
        id: u32,
        value: u32,
    ) -> Result<(), ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        let desc = self.schedtabs[s].desc;
        if desc.sync != SyncStrategy::Explicit {
            return Err(ErrorCode::Id);
        }
        if value >= desc.duration {
            return Err(ErrorCode::Value);
        }
        match self.schedtabs[s].state {
            SchedTabState::Waiting => {
                // Line position 0 up with the reference passing 0.
                let c = &self.counters[self.schedtab_counter(s)];
                let expiry = tick_add(
                    c.value,
                    desc.duration - value,
                    c.desc.max_allowed_value,
                );
                self.schedtabs[s].begin(SchedTabState::RunningSync);
                self.alarm_arm(self.schedtab_alarm(s), expiry, 0);
                Ok(())
            }
            state if state.is_running() => {
                let pos = self.schedtab_position_now(s);
                let d = wrap_deviation(pos, value, desc.duration);
                let st = &mut self.schedtabs[s];
                st.deviation = d;
                st.state = if d.unsigned_abs() <= u64::from(desc.precision) {
                    SchedTabState::RunningSync
                } else {
                    SchedTabState::RunningAsync
                };
                Ok(())
            }
            _ => Err(ErrorCode::State),
        }
    }

    /// Stops synchronizing a table; it keeps running on its own.
    pub fn sys_schedtab_set_async(
        &mut self,
        cpu: usize,
        id: u32,
    ) -> Result<(), ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        let st = &mut self.schedtabs[s];
        if st.desc.sync != SyncStrategy::Explicit {
            return Err(ErrorCode::Id);
        }
        if !st.state.is_running() {
            return Err(ErrorCode::State);
        }
        st.state = SchedTabState::Running;
        st.deviation = 0;
        Ok(())
    }

    pub fn sys_schedtab_get_status(
        &self,
        cpu: usize,
        id: u32,
    ) -> Result<SchedTabState, ErrorCode> {
        let s = self.schedtab_lookup(cpu, id)?;
        Ok(self.schedtabs[s].state)
    }
}

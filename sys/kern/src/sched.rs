// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU scheduler.
//!
//! Each CPU owns one ready queue per time partition, a timeout queue and a
//! deadline queue. Only tasks of the CPU's currently active time partition
//! are eligible to run; when that partition has nothing ready, the CPU idles.
//!
//! The ready queue is a set of intrusive FIFO lists, one per priority, with a
//! two-level bitmap recording which lists are non-empty. The links live in the
//! queue (indexed by task) rather than in the task, so the queue can be
//! exercised on its own.

use abi::{CpuDesc, HmErrorId, Priority, TaskState, NUM_PRIOS};
use heapless::{Deque, Vec};
use kerncore::{upper_bound, PrioBitmap};

use crate::app::{MAX_PARTS, MAX_TASKS, MAX_TPS, PRIO_WORDS};
use crate::arch;
use crate::fail;
use crate::profiling;
use crate::startup::Kernel;
use crate::task::WaitObj;
use crate::time::Timestamp;
use crate::trace::Trace;

/// Priority-bucketed ready queue of one time partition.
///
/// # Invariants
///
/// Bit `p` of `bitmap` is set iff `heads[p]` is `Some`; `heads[p]` and
/// `tails[p]` are either both `None` or both `Some`.
pub struct ReadyQueue {
    bitmap: PrioBitmap<PRIO_WORDS>,
    heads: [Option<u16>; NUM_PRIOS],
    tails: [Option<u16>; NUM_PRIOS],
    next: [Option<u16>; MAX_TASKS],
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            bitmap: PrioBitmap::new(),
            heads: [None; NUM_PRIOS],
            tails: [None; NUM_PRIOS],
            next: [None; MAX_TASKS],
        }
    }

    pub fn insert_tail(&mut self, task: usize, prio: Priority) {
        uassert!(prio != Priority::IDLE);
        let p = prio.bucket();
        self.next[task] = None;
        match self.tails[p] {
            Some(tail) => self.next[usize::from(tail)] = Some(task as u16),
            None => self.heads[p] = Some(task as u16),
        }
        self.tails[p] = Some(task as u16);
        self.bitmap.set(p);
    }

    pub fn insert_head(&mut self, task: usize, prio: Priority) {
        uassert!(prio != Priority::IDLE);
        let p = prio.bucket();
        self.next[task] = self.heads[p];
        if self.heads[p].is_none() {
            self.tails[p] = Some(task as u16);
        }
        self.heads[p] = Some(task as u16);
        self.bitmap.set(p);
    }

    /// Unlinks `task` from the bucket for `prio`. The task must be queued
    /// there.
    pub fn remove(&mut self, task: usize, prio: Priority) {
        let p = prio.bucket();
        let mut prev: Option<u16> = None;
        let mut cur = self.heads[p];
        while let Some(c) = cur {
            if usize::from(c) == task {
                let after = self.next[task];
                match prev {
                    Some(pv) => self.next[usize::from(pv)] = after,
                    None => self.heads[p] = after,
                }
                if self.tails[p] == Some(c) {
                    self.tails[p] = prev;
                }
                if self.heads[p].is_none() {
                    self.bitmap.clear(p);
                }
                self.next[task] = None;
                return;
            }
            prev = cur;
            cur = self.next[usize::from(c)];
        }
        fail::die(format_args!("task {task} not in ready bucket {p}"));
    }

    pub fn highest(&self) -> Option<Priority> {
        self.bitmap.highest().map(|p| Priority(p as u8))
    }

    /// Dequeues the head of the most important non-empty bucket.
    pub fn pop_highest(&mut self) -> Option<usize> {
        let p = self.bitmap.highest()?;
        let head = self.heads[p];
        uassert!(head.is_some());
        let task = usize::from(head?);
        self.heads[p] = self.next[task];
        if self.heads[p].is_none() {
            self.tails[p] = None;
            self.bitmap.clear(p);
        }
        self.next[task] = None;
        Some(task)
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Iterates over the tasks queued at `prio`, head first.
    pub fn bucket(&self, prio: Priority) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.heads[prio.bucket()];
        core::iter::from_fn(move || {
            let c = usize::from(cur?);
            cur = self.next[c];
            Some(c)
        })
    }
}

/// Sorted `(expiry, task)` queue used for timeouts and deadlines.
pub type TimeQueue = Vec<(Timestamp, u16), MAX_TASKS>;

/// Inserts after any entries with the same expiry.
pub(crate) fn time_queue_insert(q: &mut TimeQueue, at: Timestamp, task: usize) {
    let pos = upper_bound(q, &at, |e| e.0);
    if q.push((at, task as u16)).is_err() {
        fail::die("time queue overflow");
    }
    q[pos..].rotate_right(1);
}

pub(crate) fn time_queue_remove(q: &mut TimeQueue, task: usize) -> bool {
    match q.iter().position(|e| usize::from(e.1) == task) {
        Some(pos) => {
            q[pos..].rotate_left(1);
            q.truncate(q.len() - 1);
            true
        }
        None => false,
    }
}

/// Scheduling state of one CPU.
pub struct Sched {
    pub(crate) rq: Vec<ReadyQueue, MAX_TPS>,
    pub(crate) current_tp: usize,
    /// Task on the CPU, or `None` while idling.
    pub(crate) current: Option<usize>,
    pub(crate) reschedule: bool,
    /// Most important ready priority in the current time partition.
    pub(crate) next_prio: Priority,
    pub(crate) timeouts: TimeQueue,
    pub(crate) deadlines: TimeQueue,
    pub(crate) tp_schedule: usize,
    /// Schedule to switch to at the next wrap.
    pub(crate) tp_next_schedule: usize,
    pub(crate) tp_window: usize,
    pub(crate) tp_window_end: Timestamp,
    /// Partitions with a deferred mode change, in request order.
    pub(crate) pending_parts: Deque<u8, MAX_PARTS>,
}

impl Sched {
    pub(crate) fn new(desc: &CpuDesc, now: Timestamp) -> Self {
        let mut rq = Vec::new();
        for _ in 0..desc.tp_count {
            if rq.push(ReadyQueue::new()).is_err() {
                fail::die("too many time partitions");
            }
        }
        let schedule = usize::from(desc.initial_schedule);
        let (tp, window_end) = match desc.schedules.get(schedule) {
            Some(s) => (
                usize::from(s.windows[0].tp),
                now.saturating_add(s.windows[0].duration),
            ),
            None => (0, Timestamp::from(u64::MAX)),
        };
        Self {
            rq,
            current_tp: tp,
            current: None,
            reschedule: true,
            next_prio: Priority::IDLE,
            timeouts: Vec::new(),
            deadlines: Vec::new(),
            tp_schedule: schedule,
            tp_next_schedule: schedule,
            tp_window: 0,
            tp_window_end: window_end,
            pending_parts: Deque::new(),
        }
    }

    pub fn current_tp(&self) -> usize {
        self.current_tp
    }

    pub fn tp_schedule(&self) -> usize {
        self.tp_schedule
    }

    pub fn tp_next_schedule(&self) -> usize {
        self.tp_next_schedule
    }

    pub fn ready_queue(&self, tp: usize) -> &ReadyQueue {
        &self.rq[tp]
    }

    pub fn timeouts(&self) -> &[(Timestamp, u16)] {
        &self.timeouts
    }

    pub fn deadlines(&self) -> &[(Timestamp, u16)] {
        &self.deadlines
    }

    pub fn needs_reschedule(&self) -> bool {
        self.reschedule
    }

    fn refresh_next_prio(&mut self) {
        self.next_prio = self.rq[self.current_tp]
            .highest()
            .unwrap_or(Priority::IDLE);
    }
}

impl Kernel {
    /// Makes `task` ready, behind equal-priority tasks.
    pub(crate) fn ready_insert_tail(&mut self, task: usize) {
        self.ready_insert(task, false)
    }

    /// Makes `task` ready ahead of equal-priority tasks. Reserved for hooks
    /// and for a preempted task re-entering its bucket.
    pub(crate) fn ready_insert_head(&mut self, task: usize) {
        self.ready_insert(task, true)
    }

    fn ready_insert(&mut self, task: usize, head: bool) {
        let cpu = self.task_cpu(task);
        let t = &mut self.tasks[task];
        uassert!(t.state != TaskState::Ready);
        t.state = TaskState::Ready;
        let (tp, prio) = (usize::from(t.desc.tp), t.prio);
        let sched = &mut self.cpus[cpu];
        if head {
            sched.rq[tp].insert_head(task, prio);
        } else {
            sched.rq[tp].insert_tail(task, prio);
        }
        if tp == sched.current_tp
            && prio.is_more_important_than(sched.next_prio)
        {
            sched.next_prio = prio;
        }
        self.note_ready(cpu, tp, prio);
    }

    /// Requests a reschedule if a task of priority `prio` just became ready
    /// and outranks what `cpu` is running.
    fn note_ready(&mut self, cpu: usize, tp: usize, prio: Priority) {
        let sched = &self.cpus[cpu];
        if tp != sched.current_tp {
            return;
        }
        let running = match sched.current {
            Some(c) if self.tasks[c].state == TaskState::Running => {
                self.tasks[c].prio
            }
            _ => Priority::IDLE,
        };
        if prio.is_more_important_than(running) {
            self.cpus[cpu].reschedule = true;
        }
    }

    /// Takes a ready task off its queue, leaving its state to the caller.
    pub(crate) fn ready_remove(&mut self, task: usize) {
        let cpu = self.task_cpu(task);
        let t = &self.tasks[task];
        uassert_eq!(t.state, TaskState::Ready);
        let (tp, prio) = (usize::from(t.desc.tp), t.prio);
        let sched = &mut self.cpus[cpu];
        sched.rq[tp].remove(task, prio);
        sched.refresh_next_prio();
    }

    /// Puts the running task of `cpu` back at the head of its bucket.
    pub(crate) fn insert_current_head(&mut self, cpu: usize) {
        if let Some(c) = self.running(cpu) {
            self.ready_insert_head(c);
        }
    }

    /// Puts the running task of `cpu` behind its equal-priority peers.
    pub(crate) fn insert_current_tail(&mut self, cpu: usize) {
        if let Some(c) = self.running(cpu) {
            self.ready_insert_tail(c);
            self.cpus[cpu].reschedule = true;
        }
    }

    /// Changes the effective priority of `task`, keeping any queue it sits
    /// in ordered.
    pub(crate) fn task_reprioritize(&mut self, task: usize, prio: Priority) {
        let cpu = self.task_cpu(task);
        let old = self.tasks[task].prio;
        if old == prio {
            return;
        }
        match self.tasks[task].state {
            TaskState::Ready => {
                self.ready_remove(task);
                self.tasks[task].state = TaskState::Suspended;
                self.tasks[task].prio = prio;
                self.ready_insert_tail(task);
            }
            TaskState::Running => {
                self.tasks[task].prio = prio;
                if self.cpus[cpu].next_prio.is_more_important_than(prio) {
                    self.cpus[cpu].reschedule = true;
                }
            }
            _ => {
                self.tasks[task].prio = prio;
                if let WaitObj::Wq(w) = self.tasks[task].wait {
                    self.wq_requeue(usize::from(w), task);
                }
            }
        }
    }

    fn running(&self, cpu: usize) -> Option<usize> {
        self.cpus[cpu]
            .current
            .filter(|&c| self.tasks[c].state == TaskState::Running)
    }

    /// Picks the task `cpu` should run and switches to it.
    ///
    /// Pending IPIs and deferred partition mode changes are applied first, so
    /// the pick sees their effects.
    pub fn schedule(&mut self, cpu: usize) {
        self.ipi_handle(cpu);
        self.sched_do_part_state_changes(cpu);

        let tp = self.cpus[cpu].current_tp;
        let prev = self.cpus[cpu].current;

        if let Some(c) = self.running(cpu) {
            let keep = usize::from(self.tasks[c].desc.tp) == tp
                && match self.cpus[cpu].rq[tp].highest() {
                    Some(p) => !p.is_more_important_than(self.tasks[c].prio),
                    None => true,
                };
            if keep {
                self.cpus[cpu].reschedule = false;
                return;
            }
            self.insert_current_head(cpu);
        }

        let sched = &mut self.cpus[cpu];
        let next = sched.rq[tp].pop_highest();
        sched.refresh_next_prio();
        sched.current = next;
        sched.reschedule = false;
        if let Some(n) = next {
            self.tasks[n].state = TaskState::Running;
        }

        if next != prev {
            profiling::event_context_switch(cpu, next);
            arch::switch_to(cpu, next.map(|n| &self.tasks[n]));
            ktrace!(
                self,
                Trace::Switch {
                    cpu: cpu as u8,
                    task: next.map(|n| n as u16),
                }
            );
        }
    }

    /// Timer interrupt of `cpu`: advances hardware counters, expires
    /// timeouts and deadlines, and moves the time-partition schedule along.
    ///
    /// The caller is expected to `schedule` afterwards if
    /// `needs_reschedule` is set.
    pub fn timer_tick(&mut self, cpu: usize) {
        profiling::event_timer_isr_enter(cpu);
        let now = arch::now();

        for c in 0..self.counters.len() {
            let d = self.counters[c].desc;
            if usize::from(d.cpu) == cpu
                && d.kind == abi::CounterKind::Hardware
            {
                self.counter_increment(cpu, c);
            }
        }

        while let Some(&(at, t)) = self.cpus[cpu].timeouts.first() {
            if at > now {
                break;
            }
            self.task_timeout(usize::from(t), at);
        }

        while let Some(&(at, t)) = self.cpus[cpu].deadlines.first() {
            if at > now {
                break;
            }
            let t = usize::from(t);
            self.deadline_stop(t);
            self.hm_async_task_error(cpu, t, HmErrorId::DeadlineMissed, 0);
        }

        self.tp_advance(cpu, now);
        profiling::event_timer_isr_exit();
    }

    /// Moves `cpu` through every window boundary at or before `now`.
    fn tp_advance(&mut self, cpu: usize, now: Timestamp) {
        let app = self.app;
        let desc = &app.cpus[cpu];
        if desc.schedules.is_empty() {
            return;
        }
        while self.cpus[cpu].tp_window_end <= now {
            let sched = &mut self.cpus[cpu];
            sched.tp_window += 1;
            if sched.tp_window >= desc.schedules[sched.tp_schedule].windows.len()
            {
                sched.tp_window = 0;
                sched.tp_schedule = sched.tp_next_schedule;
            }
            let window =
                desc.schedules[sched.tp_schedule].windows[sched.tp_window];
            sched.tp_window_end =
                sched.tp_window_end.saturating_add(window.duration);

            let (old, new) = (sched.current_tp, usize::from(window.tp));
            if old != new {
                sched.current_tp = new;
                sched.refresh_next_prio();
                sched.reschedule = true;
                arch::board_tp_switch(cpu, old, new);
                profiling::event_tp_switch(cpu, new);
                ktrace!(
                    self,
                    Trace::TpSwitch {
                        cpu: cpu as u8,
                        old: old as u8,
                        new: new as u8,
                    }
                );
            }
        }
    }

    /// Applies every deferred partition mode change queued on `cpu` before
    /// this call. Changes queued while draining wait for the next pass.
    pub(crate) fn sched_do_part_state_changes(&mut self, cpu: usize) {
        let n = self.cpus[cpu].pending_parts.len();
        for _ in 0..n {
            let Some(p) = self.cpus[cpu].pending_parts.pop_front() else {
                break;
            };
            let p = usize::from(p);
            if let Some((mode, cond)) = self.parts[p].pending.take() {
                self.part_apply_mode(cpu, p, mode, cond);
            }
        }
    }

    pub(crate) fn timeout_arm(&mut self, task: usize, at: Timestamp) {
        self.timeout_disarm(task);
        let cpu = self.task_cpu(task);
        self.tasks[task].timeout = Some(at);
        time_queue_insert(&mut self.cpus[cpu].timeouts, at, task);
    }

    pub(crate) fn timeout_disarm(&mut self, task: usize) {
        if self.tasks[task].timeout.take().is_some() {
            let cpu = self.task_cpu(task);
            let found = time_queue_remove(&mut self.cpus[cpu].timeouts, task);
            uassert!(found);
        }
    }

    /// Starts deadline monitoring of the activation released at `at`, if the
    /// task has a deadline.
    pub(crate) fn deadline_start(&mut self, task: usize, at: Timestamp) {
        self.deadline_stop(task);
        let rel = self.tasks[task].desc.deadline;
        if rel == 0 {
            return;
        }
        let cpu = self.task_cpu(task);
        let d = at.saturating_add(rel);
        self.tasks[task].deadline = Some(d);
        time_queue_insert(&mut self.cpus[cpu].deadlines, d, task);
    }

    pub(crate) fn deadline_stop(&mut self, task: usize) {
        if self.tasks[task].deadline.take().is_some() {
            let cpu = self.task_cpu(task);
            let found = time_queue_remove(&mut self.cpus[cpu].deadlines, task);
            uassert!(found);
        }
    }
}

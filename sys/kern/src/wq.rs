// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait queues.
//!
//! A wait queue is a partition-local list of blocked tasks, kept either in
//! arrival order or by current priority (arrival order among equals). The
//! queue holds task indices only; each waiter records the queue it sits on
//! in its `WaitObj`.

use core::cmp::Reverse;

use abi::{ErrorCode, TaskState, WqDesc, WqDiscipline};
use heapless::Vec;
use kerncore::upper_bound;

use crate::app::MAX_TASKS;
use crate::fail;
use crate::startup::Kernel;
use crate::task::{Blocking, WaitObj};

#[derive(Debug)]
pub struct WaitQueue {
    pub(crate) desc: &'static WqDesc,
    pub(crate) discipline: WqDiscipline,
    pub(crate) waiters: Vec<u16, MAX_TASKS>,
}

impl WaitQueue {
    pub(crate) fn new(desc: &'static WqDesc) -> Self {
        Self {
            desc,
            discipline: desc.discipline,
            waiters: Vec::new(),
        }
    }

    pub fn discipline(&self) -> WqDiscipline {
        self.discipline
    }

    /// Waiters in wake-up order.
    pub fn waiters(&self) -> impl Iterator<Item = usize> + '_ {
        self.waiters.iter().map(|&t| usize::from(t))
    }
}

impl Kernel {
    fn wq_lookup(&self, cpu: usize, id: u32) -> Result<usize, ErrorCode> {
        let w = id as usize;
        let Some(q) = self.wqs.get(w) else {
            return Err(ErrorCode::Id);
        };
        if usize::from(q.desc.partition) != self.task_part(self.caller(cpu)) {
            return Err(ErrorCode::Access);
        }
        Ok(w)
    }

    fn wq_insert(&mut self, w: usize, task: usize) {
        let tasks = &self.tasks;
        let q = &mut self.wqs[w];
        let pos = match q.discipline {
            WqDiscipline::Fifo => q.waiters.len(),
            WqDiscipline::Priority => {
                let key = Reverse(tasks[task].prio.0);
                upper_bound(&q.waiters, &key, |&t| {
                    Reverse(tasks[usize::from(t)].prio.0)
                })
            }
        };
        if q.waiters.push(task as u16).is_err() {
            fail::die("wait queue overflow");
        }
        q.waiters[pos..].rotate_right(1);
    }

    /// Takes `task` off queue `w`; returns whether it was there.
    pub(crate) fn wq_remove(&mut self, w: usize, task: usize) -> bool {
        let q = &mut self.wqs[w];
        match q.waiters.iter().position(|&t| usize::from(t) == task) {
            Some(pos) => {
                q.waiters[pos..].rotate_left(1);
                q.waiters.truncate(q.waiters.len() - 1);
                true
            }
            None => false,
        }
    }

    /// Restores ordering after the priority of a waiter changed.
    pub(crate) fn wq_requeue(&mut self, w: usize, task: usize) {
        if self.wqs[w].discipline == WqDiscipline::Priority
            && self.wq_remove(w, task)
        {
            self.wq_insert(w, task);
        }
    }

    /// Empties a queue whose partition is shutting down. The waiters
    /// themselves are stopped by the caller.
    pub(crate) fn wq_close(&mut self, w: usize) {
        let q = &mut self.wqs[w];
        q.waiters.clear();
        q.discipline = q.desc.discipline;
    }

    pub fn sys_wq_set_discipline(
        &mut self,
        cpu: usize,
        id: u32,
        discipline: WqDiscipline,
    ) -> Result<(), ErrorCode> {
        let w = self.wq_lookup(cpu, id)?;
        let q = &mut self.wqs[w];
        if !q.waiters.is_empty() {
            return Err(ErrorCode::State);
        }
        q.discipline = discipline;
        Ok(())
    }

    pub fn sys_wq_wait(
        &mut self,
        cpu: usize,
        id: u32,
        timeout: u64,
    ) -> Result<Blocking<()>, ErrorCode> {
        let w = self.wq_lookup(cpu, id)?;
        if timeout == 0 {
            return Err(ErrorCode::Timeout);
        }
        let me = self.caller(cpu);
        self.task_block(me, TaskState::WaitWq, WaitObj::Wq(w as u16), timeout);
        self.wq_insert(w, me);
        Ok(Blocking::Blocked)
    }

    /// Wakes up to `count` waiters in queue order; returns how many woke.
    pub fn sys_wq_wake(
        &mut self,
        cpu: usize,
        id: u32,
        count: u32,
    ) -> Result<u32, ErrorCode> {
        let w = self.wq_lookup(cpu, id)?;
        let mut woken = 0;
        while woken < count {
            let Some(&t) = self.wqs[w].waiters.first() else {
                break;
            };
            self.task_wake(usize::from(t), Ok([0, 0]));
            woken += 1;
        }
        Ok(woken)
    }
}

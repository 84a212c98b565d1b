// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the kernel context.
//!
//! All dynamic kernel state lives in one `Kernel` value built from the
//! application description at boot. Each CPU only ever touches the parts of
//! it that belong to objects it owns, so in a multi-core build the value is
//! shared and every entry point names the CPU it runs on.

use abi::{AppDesc, ErrorCode, PartMode, StartCondition, TaskId};
use heapless::{Deque, Vec};

use crate::alarm::{Alarm, Counter};
use crate::app::{
    check_app, IPI_QUEUE_LEN, MAX_ALARMS, MAX_COUNTERS, MAX_COUNTER_CASCADE,
    MAX_CPUS, MAX_PARTS, MAX_SCHEDTABS, MAX_TASKS, MAX_WQS, TRACE_ENTRIES,
};
use crate::arch;
use crate::fail;
use crate::ipi::IpiMsg;
use crate::part::Partition;
use crate::sched::Sched;
use crate::schedtab::SchedTab;
use crate::task::Task;
use crate::time::Timestamp;
use crate::trace::{Ringbuf, Trace};
use crate::wq::WaitQueue;

pub struct Kernel {
    pub(crate) app: &'static AppDesc,
    pub(crate) tasks: Vec<Task, MAX_TASKS>,
    pub(crate) parts: Vec<Partition, MAX_PARTS>,
    pub(crate) counters: Vec<Counter, MAX_COUNTERS>,
    pub(crate) alarms: Vec<Alarm, MAX_ALARMS>,
    pub(crate) schedtabs: Vec<SchedTab, MAX_SCHEDTABS>,
    pub(crate) wqs: Vec<WaitQueue, MAX_WQS>,
    pub(crate) cpus: Vec<Sched, MAX_CPUS>,
    pub(crate) mailboxes: Vec<Deque<IpiMsg, IPI_QUEUE_LEN>, MAX_CPUS>,
    /// Selected system HM table.
    pub(crate) hm_system_table: usize,
    /// Counters waiting for their share of an increment chain.
    pub(crate) cascade: Deque<u16, MAX_COUNTER_CASCADE>,
    pub(crate) cascade_active: bool,
    /// Stamps blocking calls, so waiters can be served in arrival order.
    pub(crate) wait_seq: u32,
    pub(crate) trace: Ringbuf<Trace, TRACE_ENTRIES>,
}

/// Collects one kernel object per descriptor into a fixed-capacity table.
fn build<D: 'static, T, const N: usize>(
    descs: &'static [D],
    what: &str,
    mut f: impl FnMut(usize, &'static D) -> T,
) -> Vec<T, N> {
    let mut v = Vec::new();
    for (i, d) in descs.iter().enumerate() {
        if v.push(f(i, d)).is_err() {
            fail::die(format_args!("too many {what}"));
        }
    }
    v
}

impl Kernel {
    /// Boots the kernel for `app`.
    ///
    /// Checks the configuration, builds every kernel object in its initial
    /// state, arms the time-partition schedules and brings each partition
    /// into its configured initial mode. The caller then runs `schedule` on
    /// each CPU to pick the first tasks.
    pub fn new(app: &'static AppDesc) -> Self {
        check_app(app);
        let now = arch::now();

        let mut k = Self {
            app,
            tasks: build(app.tasks, "tasks", |i, d| {
                Task::new(TaskId::from(i), d)
            }),
            parts: build(app.partitions, "partitions", |_, d| {
                Partition::new(d)
            }),
            counters: build(app.counters, "counters", |_, d| Counter::new(d)),
            alarms: build(app.alarms, "alarms", |_, d| Alarm::new(d)),
            schedtabs: build(app.schedtabs, "schedule tables", |_, d| {
                SchedTab::new(d)
            }),
            wqs: build(app.wqs, "wait queues", |_, d| WaitQueue::new(d)),
            cpus: build(app.cpus, "cpus", |_, d| Sched::new(d, now)),
            mailboxes: build(app.cpus, "cpus", |_, _| Deque::new()),
            hm_system_table: 0,
            cascade: Deque::new(),
            cascade_active: false,
            wait_seq: 0,
            trace: Ringbuf::new(Trace::None),
        };

        for task in k.tasks.iter_mut() {
            arch::reinitialize(task);
        }

        for part in 0..k.parts.len() {
            let cpu = k.part_cpu(part);
            match k.parts[part].desc.initial_mode {
                PartMode::Idle => {}
                PartMode::ColdStart | PartMode::Normal => k.part_start(
                    cpu,
                    part,
                    PartMode::ColdStart,
                    StartCondition::NormalStart,
                ),
                PartMode::WarmStart => fail::die("warm start at boot"),
            }
        }
        k
    }

    pub fn app(&self) -> &'static AppDesc {
        self.app
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.index()]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.index()]
    }

    pub fn part(&self, part: usize) -> &Partition {
        &self.parts[part]
    }

    pub fn sched(&self, cpu: usize) -> &Sched {
        &self.cpus[cpu]
    }

    /// Task currently on `cpu`, or `None` while it idles.
    pub fn current(&self, cpu: usize) -> Option<TaskId> {
        self.cpus[cpu].current.map(TaskId::from)
    }

    pub fn counter(&self, id: u32) -> &Counter {
        &self.counters[id as usize]
    }

    pub fn alarm(&self, id: u32) -> &Alarm {
        &self.alarms[id as usize]
    }

    pub fn schedtab(&self, id: u32) -> &SchedTab {
        &self.schedtabs[id as usize]
    }

    pub fn wq(&self, id: u32) -> &WaitQueue {
        &self.wqs[id as usize]
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_ENTRIES> {
        &self.trace
    }

    pub fn hm_system_table(&self) -> usize {
        self.hm_system_table
    }

    /// Selects the time-partition schedule `cpu` switches to at its next
    /// wrap.
    pub(crate) fn tp_schedule_select(&mut self, cpu: usize, schedule: usize) {
        uassert!(schedule < self.app.cpus[cpu].schedules.len());
        self.cpus[cpu].tp_next_schedule = schedule;
    }

    /// Selects the time-partition schedule of `target`. Only privileged
    /// partitions may do this; another CPU's selector is changed over IPI.
    pub fn sys_tp_schedule_switch(
        &mut self,
        cpu: usize,
        target: u32,
        schedule: u32,
    ) -> Result<(), ErrorCode> {
        let target = target as usize;
        if target >= self.cpus.len() {
            return Err(ErrorCode::Id);
        }
        if !self.part_privileged(self.task_part(self.caller(cpu))) {
            return Err(ErrorCode::Access);
        }
        let schedule = schedule as usize;
        if schedule >= self.app.cpus[target].schedules.len() {
            return Err(ErrorCode::Value);
        }
        if target != cpu {
            return self.ipi_send(
                target,
                IpiMsg::TpSchedule {
                    schedule: schedule as u8,
                },
            );
        }
        self.tp_schedule_select(cpu, schedule);
        Ok(())
    }

    /// Returns the running and the selected time-partition schedule of
    /// `target`.
    pub fn sys_tp_schedule_get(
        &self,
        target: u32,
    ) -> Result<(u32, u32), ErrorCode> {
        let sched = self.cpus.get(target as usize).ok_or(ErrorCode::Id)?;
        Ok((sched.tp_schedule as u32, sched.tp_next_schedule as u32))
    }

    pub fn sys_get_time(&self) -> Timestamp {
        arch::now()
    }
}

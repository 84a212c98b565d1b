// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A task moves between SUSPENDED, READY, RUNNING and the waiting states.
//! Activating a task that is already active does not start a second copy; it
//! is queued as a pending activation (up to `max_activations - 1` of them)
//! and consumed when the running copy terminates.
//!
//! Tasks of a partition that is still initializing are not started right
//! away. They wait in WAIT_ACT with a timeout carrying the `WAIT_FOR_NORMAL`
//! marker, and are released when the partition enters NORMAL.

use abi::{
    ErrorCode, PartMode, Priority, TaskDesc, TaskId, TaskKind, TaskState,
    INFINITE,
};

use crate::arch::{self, SavedState};
use crate::fail;
use crate::startup::Kernel;
use crate::time::Timestamp;
use crate::trace::Trace;

/// Marker bit of timeouts that mean "release when the partition enters
/// NORMAL"; the low bits carry the requested delay.
pub const WAIT_FOR_NORMAL: u64 = 1 << 63;

/// Result of a system call, as delivered in the return registers.
pub type SysResult = Result<[u32; 2], ErrorCode>;

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX` and `retX` functions plus
/// `syscall_descriptor`, and the rest of the trait (such as the argument
/// decoders) will just work.
pub trait ArchState: Default {
    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u32;
    /// Reads syscall argument register 5.
    fn arg5(&self) -> u32;

    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes syscall return argument 0.
    fn ret0(&mut self, _: u32);
    /// Writes syscall return argument 1.
    fn ret1(&mut self, _: u32);
    /// Writes syscall return argument 2.
    fn ret2(&mut self, _: u32);

    fn syscall_args(&self) -> [u32; 6] {
        [
            self.arg0(),
            self.arg1(),
            self.arg2(),
            self.arg3(),
            self.arg4(),
            self.arg5(),
        ]
    }

    /// Reads a 64-bit argument passed in registers `lo` and `lo + 1`, low
    /// word first.
    fn arg64(&self, lo: usize) -> u64 {
        let a = self.syscall_args();
        Timestamp::from([a[lo], a[lo + 1]]).into()
    }

    /// Writes a syscall result: zero or an error code in register 0, values
    /// in registers 1 and 2.
    fn set_result(&mut self, r: SysResult) {
        match r {
            Ok([a, b]) => {
                self.ret0(0);
                self.ret1(a);
                self.ret2(b);
            }
            Err(e) => self.ret0(e as u32),
        }
    }
}

/// What a waiting task is waiting on, beyond what its state says.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitObj {
    None,
    Wq(u16),
    /// RPC client; `accepted` once the server has taken the request.
    RpcSend { server: u16, accepted: bool },
    RpcRecv,
    Sleep,
    /// Waiting for the next periodic release.
    Periodic,
    /// Activated, waiting for its first release.
    Release,
}

/// Outcome of a call that may put the caller to sleep.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Blocking<T> {
    /// The call completed without blocking.
    Done(T),
    /// The caller is waiting; its result is delivered when it wakes.
    Blocked,
}

/// Internal representation of a task.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    pub(crate) desc: &'static TaskDesc,
    /// Saved machine state of the user program.
    save: SavedState,
    pub(crate) state: TaskState,
    /// Effective priority, including any raise.
    pub(crate) prio: Priority,
    /// Priority without raises; changed by `sys_task_set_prio`.
    pub(crate) base_prio: Priority,
    /// Priority, entry point and argument used at the next start.
    pub(crate) start_prio: Priority,
    pub(crate) entry: u32,
    pub(crate) arg: u32,
    /// Activations queued behind the current one.
    pub(crate) activations: u8,
    pub(crate) deadline: Option<Timestamp>,
    pub(crate) timeout: Option<Timestamp>,
    pub(crate) last_release: Timestamp,
    pub(crate) wait: WaitObj,
    /// Arrival order among tasks waiting on the same object.
    pub(crate) wait_seq: u32,
    pub(crate) rpc_arg: u32,
    pub(crate) ev_pending: u32,
    pub(crate) ev_wait: u32,
    /// Logical enable of an ISR task's interrupt line.
    pub(crate) irq_enabled: bool,
    /// Bumped on every start, so a stale syscall result is never written
    /// into a restarted task.
    pub(crate) incarnation: u32,
}

impl Task {
    pub(crate) fn new(id: TaskId, desc: &'static TaskDesc) -> Self {
        Self {
            id,
            desc,
            save: SavedState::default(),
            state: TaskState::Suspended,
            prio: desc.priority,
            base_prio: desc.priority,
            start_prio: desc.priority,
            entry: desc.entry_point,
            arg: 0,
            activations: 0,
            deadline: None,
            timeout: None,
            last_release: Timestamp::ZERO,
            wait: WaitObj::None,
            wait_seq: 0,
            rpc_arg: 0,
            ev_pending: 0,
            ev_wait: 0,
            irq_enabled: true,
            incarnation: 0,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn descriptor(&self) -> &'static TaskDesc {
        self.desc
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.prio
    }

    pub fn base_priority(&self) -> Priority {
        self.base_prio
    }

    pub fn pending_activations(&self) -> u8 {
        self.activations
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn timeout(&self) -> Option<Timestamp> {
        self.timeout
    }

    pub fn waiting_on(&self) -> WaitObj {
        self.wait
    }

    pub fn events_pending(&self) -> u32 {
        self.ev_pending
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    pub fn save(&self) -> &SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut SavedState {
        &mut self.save
    }

    /// Program counter, stack pointer and argument the task starts with.
    pub fn initial_context(&self) -> (u32, u32, u32) {
        (self.entry, self.desc.initial_stack, self.arg)
    }
}

impl Kernel {
    pub(crate) fn task_part(&self, task: usize) -> usize {
        usize::from(self.tasks[task].desc.partition)
    }

    pub(crate) fn task_cpu(&self, task: usize) -> usize {
        usize::from(self.app.partitions[self.task_part(task)].cpu)
    }

    /// The task on whose behalf `cpu` is executing a system call.
    pub(crate) fn caller(&self, cpu: usize) -> usize {
        match self.cpus[cpu].current {
            Some(c) => c,
            None => fail::die("system call without a current task"),
        }
    }

    /// Resolves a task named in a system call. Tasks of other partitions are
    /// only reachable from privileged partitions.
    pub(crate) fn task_lookup(
        &self,
        cpu: usize,
        id: TaskId,
    ) -> Result<usize, ErrorCode> {
        let t = id.index();
        if t >= self.tasks.len() {
            return Err(ErrorCode::Id);
        }
        let mine = self.task_part(self.caller(cpu));
        if self.task_part(t) != mine && !self.part_privileged(mine) {
            return Err(ErrorCode::Access);
        }
        Ok(t)
    }

    /// Checks whether one more activation of `task` fits.
    pub(crate) fn task_check_activate(
        &self,
        task: usize,
    ) -> Result<(), ErrorCode> {
        let t = &self.tasks[task];
        if t.state == TaskState::Suspended
            || t.activations + 1 < t.desc.max_activations
        {
            Ok(())
        } else {
            Err(ErrorCode::Limit)
        }
    }

    /// Activates `task`, which must have passed `task_check_activate`. A
    /// suspended task becomes READY; otherwise the activation is queued.
    pub(crate) fn task_do_activate(&mut self, task: usize) {
        if self.tasks[task].state != TaskState::Suspended {
            uassert!(self.task_check_activate(task).is_ok());
            self.tasks[task].activations += 1;
            return;
        }
        self.task_prepare(task);
        let now = arch::now();
        self.tasks[task].last_release = now;
        self.deadline_start(task, now);
        if let TaskKind::Isr { irq } = self.tasks[task].desc.kind {
            arch::disable_irq(irq);
        }
        if self.tasks[task].desc.kind.is_hook() {
            self.ready_insert_head(task);
        } else {
            self.ready_insert_tail(task);
        }
        ktrace!(self, Trace::Activate { task: task as u16 });
    }

    /// Moves the ready `task` ahead of every other task of its CPU for the
    /// rest of this activation. The next activation starts from the
    /// configured priority again.
    pub(crate) fn task_boost_head(&mut self, task: usize) {
        self.ready_remove(task);
        let t = &mut self.tasks[task];
        t.state = TaskState::Suspended;
        t.prio = Priority::HIGHEST;
        t.base_prio = Priority::HIGHEST;
        self.ready_insert_head(task);
    }

    /// Resets a task for a fresh start.
    fn task_prepare(&mut self, task: usize) {
        let t = &mut self.tasks[task];
        t.incarnation = t.incarnation.wrapping_add(1);
        t.prio = t.start_prio;
        t.base_prio = t.start_prio;
        t.ev_pending = 0;
        t.ev_wait = 0;
        t.wait = WaitObj::None;
        arch::reinitialize(t);
    }

    /// Activation as seen from inside the task's own CPU, respecting the
    /// partition's mode: activations made before NORMAL wait for it.
    pub(crate) fn task_activate_local(
        &mut self,
        task: usize,
    ) -> Result<(), ErrorCode> {
        let part = self.task_part(task);
        let suspended = self.tasks[task].state == TaskState::Suspended;
        match self.parts[part].mode {
            PartMode::Idle => Err(ErrorCode::State),
            PartMode::Normal => {
                if suspended && self.tasks[task].desc.is_periodic() {
                    self.task_delay_start(task, 0);
                } else {
                    self.task_check_activate(task)?;
                    self.task_do_activate(task);
                }
                Ok(())
            }
            PartMode::ColdStart | PartMode::WarmStart => {
                if suspended {
                    self.task_delay_start(task, 0);
                } else {
                    self.task_check_activate(task)?;
                    self.tasks[task].activations += 1;
                }
                Ok(())
            }
        }
    }

    /// Activation requested by an alarm, a schedule table, an interrupt, or
    /// another CPU. There is no caller to report failure to, so it goes to
    /// health monitoring.
    pub(crate) fn task_activate_async(&mut self, cpu: usize, task: usize) {
        if let Err(e) = self.task_activate_local(task) {
            self.hm_async_task_error(
                cpu,
                task,
                abi::HmErrorId::ActivationError,
                e as u32,
            );
        }
    }

    /// Starts a suspended task after `delay` ns. Periodic tasks are aligned
    /// to the partition's release grid first.
    pub(crate) fn task_delay_start(&mut self, task: usize, delay: u64) {
        uassert_eq!(self.tasks[task].state, TaskState::Suspended);
        let part = self.task_part(task);
        let now = arch::now();
        let at = match self.parts[part].mode {
            PartMode::Normal => {
                let desc = self.tasks[task].desc;
                if desc.is_periodic() {
                    let grid = match self.app.partitions[part].period {
                        0 => desc.period,
                        p => p,
                    };
                    let base = u64::from(self.parts[part].first_release);
                    Timestamp::from(kerncore::next_release(
                        u64::from(now),
                        base,
                        grid,
                    ))
                    .saturating_add(delay)
                } else if delay == 0 {
                    self.task_do_activate(task);
                    return;
                } else {
                    now.saturating_add(delay)
                }
            }
            _ => Timestamp::from(WAIT_FOR_NORMAL | delay),
        };
        self.task_prepare(task);
        self.tasks[task].state = TaskState::WaitAct;
        self.tasks[task].wait = WaitObj::Release;
        self.timeout_arm(task, at);
        ktrace!(self, Trace::Activate { task: task as u16 });
    }

    /// Releases a task waiting in WAIT_ACT at time `at`.
    pub(crate) fn task_release(&mut self, task: usize, at: Timestamp) {
        uassert_eq!(self.tasks[task].state, TaskState::WaitAct);
        self.timeout_disarm(task);
        let t = &mut self.tasks[task];
        let periodic_wait = t.wait == WaitObj::Periodic;
        t.wait = WaitObj::None;
        t.last_release = at;
        if periodic_wait {
            t.save.set_result(Ok([0, 0]));
        }
        self.deadline_start(task, at);
        self.ready_insert_tail(task);
    }

    /// Blocks the running `task`. A timeout of `INFINITE` never expires.
    pub(crate) fn task_block(
        &mut self,
        task: usize,
        state: TaskState,
        wait: WaitObj,
        timeout: u64,
    ) {
        uassert_eq!(self.tasks[task].state, TaskState::Running);
        uassert!(state.is_waiting());
        self.tasks[task].state = state;
        self.tasks[task].wait = wait;
        self.wait_seq = self.wait_seq.wrapping_add(1);
        self.tasks[task].wait_seq = self.wait_seq;
        if timeout != INFINITE {
            self.timeout_arm(task, arch::now().saturating_add(timeout));
        }
        let cpu = self.task_cpu(task);
        self.cpus[cpu].reschedule = true;
    }

    /// Ends a wait, delivering `result` as the outcome of the blocking call.
    pub(crate) fn task_wake(&mut self, task: usize, result: SysResult) {
        uassert!(self.tasks[task].state.is_waiting());
        self.timeout_disarm(task);
        if let WaitObj::Wq(w) = self.tasks[task].wait {
            self.wq_remove(usize::from(w), task);
        }
        let t = &mut self.tasks[task];
        t.wait = WaitObj::None;
        t.ev_wait = 0;
        t.save.set_result(result);
        self.ready_insert_tail(task);
    }

    /// Handles an expired timeout.
    pub(crate) fn task_timeout(&mut self, task: usize, at: Timestamp) {
        let t = &self.tasks[task];
        match (t.state, t.wait) {
            (TaskState::WaitAct, _) => self.task_release(task, at),
            (_, WaitObj::Sleep) => self.task_wake(task, Ok([0, 0])),
            (s, _) if s.is_waiting() => {
                self.task_wake(task, Err(ErrorCode::Timeout))
            }
            (s, _) => fail::die(format_args!(
                "timeout on task {task} in state {s:?}"
            )),
        }
    }

    /// Takes a task out of every queue except the deadline queue.
    fn task_unlink(&mut self, task: usize) {
        match self.tasks[task].state {
            TaskState::Ready => self.ready_remove(task),
            _ => {
                if let WaitObj::Wq(w) = self.tasks[task].wait {
                    self.wq_remove(usize::from(w), task);
                }
            }
        }
        self.timeout_disarm(task);
        let t = &mut self.tasks[task];
        t.wait = WaitObj::None;
        t.ev_wait = 0;
        t.state = TaskState::Suspended;
        let cpu = self.task_cpu(task);
        self.cpus[cpu].reschedule = true;
    }

    /// Ends the current activation of `task`, starting the next queued one
    /// if there is any.
    pub(crate) fn task_terminate(&mut self, task: usize) {
        self.task_unlink(task);
        self.deadline_stop(task);
        if let TaskKind::Isr { irq } = self.tasks[task].desc.kind {
            let part = self.task_part(task);
            if self.tasks[task].irq_enabled
                && self.parts[part].mode == PartMode::Normal
            {
                arch::enable_irq(irq);
            }
        }
        if self.tasks[task].activations > 0 {
            self.tasks[task].activations -= 1;
            let cpu = self.task_cpu(task);
            self.task_activate_async(cpu, task);
        }
        self.rpc_abort_accepted(task);
    }

    /// Forcibly suspends `task`, dropping queued activations. RPC clients
    /// waiting on it are released with `E_OS_STATE`.
    pub(crate) fn task_stop(&mut self, task: usize) {
        self.task_unlink(task);
        self.deadline_stop(task);
        self.tasks[task].activations = 0;
        if let TaskKind::Isr { irq } = self.tasks[task].desc.kind {
            arch::disable_irq(irq);
        }
        self.rpc_abort_clients(task);
    }

    /// Releases the task that was waiting for its partition to enter NORMAL.
    pub(crate) fn task_release_for_normal(
        &mut self,
        task: usize,
        delay: u64,
        first_release: Timestamp,
    ) {
        let now = arch::now();
        self.timeout_disarm(task);
        let t = &self.tasks[task];
        if t.desc.is_periodic() {
            self.timeout_arm(task, first_release.saturating_add(delay));
        } else if delay == 0 {
            self.task_release(task, now);
        } else {
            self.timeout_arm(task, now.saturating_add(delay));
        }
    }

    pub fn sys_task_self(&self, cpu: usize) -> TaskId {
        TaskId::from(self.caller(cpu))
    }

    pub fn sys_task_activate(
        &mut self,
        cpu: usize,
        id: TaskId,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if self.tasks[t].desc.kind != TaskKind::Task {
            return Err(ErrorCode::Id);
        }
        let dst = self.task_cpu(t);
        if dst != cpu {
            return self.ipi_send(
                dst,
                crate::ipi::IpiMsg::Activate { task: t as u16 },
            );
        }
        self.task_activate_local(t)
    }

    pub fn sys_task_delayed_activate(
        &mut self,
        cpu: usize,
        id: TaskId,
        delay: u64,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if self.tasks[t].desc.kind != TaskKind::Task {
            return Err(ErrorCode::Id);
        }
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        if delay >= WAIT_FOR_NORMAL {
            return Err(ErrorCode::Value);
        }
        if self.tasks[t].state != TaskState::Suspended {
            return Err(ErrorCode::State);
        }
        if self.parts[self.task_part(t)].mode == PartMode::Idle {
            return Err(ErrorCode::State);
        }
        self.task_delay_start(t, delay);
        Ok(())
    }

    /// Sets the priority, entry point and argument of a suspended task for
    /// its next start.
    pub fn sys_task_create(
        &mut self,
        cpu: usize,
        id: TaskId,
        prio: Priority,
        entry: u32,
        arg: u32,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if self.tasks[t].desc.kind != TaskKind::Task {
            return Err(ErrorCode::Id);
        }
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        if self.tasks[t].state != TaskState::Suspended {
            return Err(ErrorCode::State);
        }
        let desc = self.tasks[t].desc;
        if prio == Priority::IDLE
            || prio.is_more_important_than(desc.max_priority)
        {
            return Err(ErrorCode::Value);
        }
        let task = &mut self.tasks[t];
        task.start_prio = prio;
        task.prio = prio;
        task.base_prio = prio;
        task.entry = entry;
        task.arg = arg;
        Ok(())
    }

    pub fn sys_task_terminate(&mut self, cpu: usize) -> Result<(), ErrorCode> {
        let me = self.caller(cpu);
        if self.tasks[me].prio != self.tasks[me].base_prio {
            return Err(ErrorCode::Resource);
        }
        self.task_terminate(me);
        Ok(())
    }

    /// Stops another task of the caller's partition (or, for a privileged
    /// caller, any local task).
    pub fn sys_task_terminate_other(
        &mut self,
        cpu: usize,
        id: TaskId,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if matches!(self.tasks[t].desc.kind, TaskKind::Isr { .. }) {
            return Err(ErrorCode::Id);
        }
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        if t == self.caller(cpu) {
            return Err(ErrorCode::Value);
        }
        if self.tasks[t].state == TaskState::Suspended {
            return Err(ErrorCode::State);
        }
        self.task_stop(t);
        Ok(())
    }

    /// Terminates the caller and activates `id` in one step.
    pub fn sys_task_chain(
        &mut self,
        cpu: usize,
        id: TaskId,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if self.tasks[t].desc.kind != TaskKind::Task {
            return Err(ErrorCode::Id);
        }
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        let me = self.caller(cpu);
        if t != me {
            self.task_check_activate(t)?;
        }
        if self.tasks[me].prio != self.tasks[me].base_prio {
            return Err(ErrorCode::Resource);
        }
        self.task_terminate(me);
        if let Err(e) = self.task_activate_local(t) {
            self.hm_async_task_error(
                cpu,
                t,
                abi::HmErrorId::ActivationError,
                e as u32,
            );
        }
        Ok(())
    }

    pub fn sys_task_get_state(
        &self,
        cpu: usize,
        id: TaskId,
    ) -> Result<TaskState, ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        Ok(self.tasks[t].state)
    }

    pub fn sys_task_get_prio(
        &self,
        cpu: usize,
        id: TaskId,
    ) -> Result<Priority, ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        Ok(self.tasks[t].prio)
    }

    /// Changes the base priority of an active task. The task moves behind
    /// its new equal-priority peers; a raised priority stays in effect until
    /// restored.
    pub fn sys_task_set_prio(
        &mut self,
        cpu: usize,
        id: TaskId,
        prio: Priority,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if self.tasks[t].desc.kind != TaskKind::Task {
            return Err(ErrorCode::Id);
        }
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        if self.tasks[t].state == TaskState::Suspended {
            return Err(ErrorCode::State);
        }
        if prio == Priority::IDLE
            || prio.is_more_important_than(self.tasks[t].desc.max_priority)
        {
            return Err(ErrorCode::Value);
        }
        let raised = self.tasks[t].prio != self.tasks[t].base_prio;
        self.tasks[t].base_prio = prio;
        if !raised {
            self.task_reprioritize(t, prio);
        }
        Ok(())
    }

    /// Raises the caller to at least `prio`, returning the priority to pass
    /// to `sys_prio_restore`.
    pub fn sys_prio_raise(
        &mut self,
        cpu: usize,
        prio: Priority,
    ) -> Result<Priority, ErrorCode> {
        let me = self.caller(cpu);
        let t = &self.tasks[me];
        if prio == Priority::IDLE
            || prio.is_more_important_than(t.desc.max_priority)
        {
            return Err(ErrorCode::Value);
        }
        let old = t.prio;
        if prio.is_more_important_than(old) {
            self.task_reprioritize(me, prio);
        }
        Ok(old)
    }

    pub fn sys_prio_restore(
        &mut self,
        cpu: usize,
        old: Priority,
    ) -> Result<(), ErrorCode> {
        let me = self.caller(cpu);
        let t = &self.tasks[me];
        if (old.is_more_important_than(t.desc.max_priority)
            && old != t.base_prio)
            || t.base_prio.is_more_important_than(old)
        {
            return Err(ErrorCode::Value);
        }
        self.task_reprioritize(me, old);
        Ok(())
    }

    pub fn sys_yield(&mut self, cpu: usize) {
        self.insert_current_tail(cpu);
    }

    /// Sleeps for `timeout` ns. Zero yields; sleeping forever is refused.
    pub fn sys_sleep(
        &mut self,
        cpu: usize,
        timeout: u64,
    ) -> Result<Blocking<()>, ErrorCode> {
        if timeout == INFINITE {
            return Err(ErrorCode::Value);
        }
        if timeout == 0 {
            self.sys_yield(cpu);
            return Ok(Blocking::Done(()));
        }
        let me = self.caller(cpu);
        self.task_block(me, TaskState::WaitWq, WaitObj::Sleep, timeout);
        Ok(Blocking::Blocked)
    }

    /// Waits for the caller's next periodic release. Releases that already
    /// passed are skipped, keeping the task on its release grid.
    pub fn sys_task_wait_periodic(
        &mut self,
        cpu: usize,
    ) -> Result<Blocking<()>, ErrorCode> {
        let me = self.caller(cpu);
        let desc = self.tasks[me].desc;
        if !desc.is_periodic() {
            return Err(ErrorCode::Access);
        }
        let now = u64::from(arch::now());
        let mut next = u64::from(self.tasks[me].last_release) + desc.period;
        if next < now {
            next = kerncore::next_release(now, next, desc.period);
        }
        self.deadline_stop(me);
        self.task_block(me, TaskState::WaitAct, WaitObj::Periodic, INFINITE);
        self.timeout_arm(me, next.into());
        Ok(Blocking::Blocked)
    }

    /// Cancels the wait of a task blocked on a wait queue, an RPC, or a
    /// sleep; the task sees `E_OS_STATE`.
    pub fn sys_unblock(
        &mut self,
        cpu: usize,
        id: TaskId,
    ) -> Result<(), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        if !self.tasks[t].state.is_unblockable() {
            return Err(ErrorCode::State);
        }
        self.task_wake(t, Err(ErrorCode::State));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::set_now;
    use crate::testutil::*;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        [[partition]]
        name = "q"
        initial_mode = "normal"
        [[task]]
        name = "main"
        partition = "p"
        priority = 10
        [[task]]
        name = "worker"
        partition = "p"
        priority = 5
        max_priority = 12
        max_activations = 3
        [[task]]
        name = "other"
        partition = "q"
        priority = 5
        [[task]]
        name = "isr"
        partition = "p"
        kind = "isr"
        irq = 4
        priority = 30
    "#;

    #[test]
    fn activation_queues_up_to_limit() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        run(&mut k, 0, main);

        assert_eq!(k.sys_task_activate(0, worker), Ok(()));
        assert_eq!(k.task(worker).state(), TaskState::Ready);
        assert_eq!(k.task(worker).pending_activations(), 0);

        assert_eq!(k.sys_task_activate(0, worker), Ok(()));
        assert_eq!(k.sys_task_activate(0, worker), Ok(()));
        assert_eq!(k.task(worker).pending_activations(), 2);
        assert_eq!(k.sys_task_activate(0, worker), Err(ErrorCode::Limit));
        assert_eq!(k.task(worker).pending_activations(), 2);
    }

    #[test]
    fn terminate_consumes_queued_activation() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        run(&mut k, 0, main);
        k.sys_task_activate(0, worker).unwrap();
        k.sys_task_activate(0, worker).unwrap();
        let first = k.task(worker).incarnation();

        k.sys_task_terminate(0).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0), Some(worker));
        k.sys_task_terminate(0).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0), Some(worker));
        assert_eq!(k.task(worker).incarnation(), first + 1);
        assert_eq!(k.task(worker).pending_activations(), 0);
        k.sys_task_terminate(0).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0), None);
        assert_eq!(k.task(worker).state(), TaskState::Suspended);
    }

    #[test]
    fn other_partitions_and_isrs_are_not_activatable() {
        let (mut k, app) = boot(APP);
        run(&mut k, 0, app.task("main"));
        assert_eq!(
            k.sys_task_activate(0, app.task("other")),
            Err(ErrorCode::Access)
        );
        assert_eq!(k.sys_task_activate(0, app.task("isr")), Err(ErrorCode::Id));
        assert_eq!(k.sys_task_activate(0, TaskId(99)), Err(ErrorCode::Id));
    }

    #[test]
    fn raised_priority_blocks_termination() {
        let (mut k, app) = boot(APP);
        let worker = app.task("worker");
        run(&mut k, 0, worker);
        let old = k.sys_prio_raise(0, Priority(12)).unwrap();
        assert_eq!(old, Priority(5));
        assert_eq!(k.task(worker).priority(), Priority(12));
        assert_eq!(k.sys_task_terminate(0), Err(ErrorCode::Resource));
        assert_eq!(k.sys_prio_raise(0, Priority(13)), Err(ErrorCode::Value));
        k.sys_prio_restore(0, old).unwrap();
        assert_eq!(k.sys_task_terminate(0), Ok(()));
    }

    #[test]
    fn lowering_priority_of_running_task_yields() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        run(&mut k, 0, main);
        k.sys_task_activate(0, worker).unwrap();
        k.sys_task_set_prio(0, main, Priority(2)).unwrap();
        assert!(k.sched(0).needs_reschedule());
        k.schedule(0);
        assert_eq!(k.current(0), Some(worker));
        assert_eq!(k.task(main).state(), TaskState::Ready);
        assert_eq!(
            k.sys_task_set_prio(0, main, Priority(0)),
            Err(ErrorCode::Value)
        );
    }

    #[test]
    fn sleep_times_out_with_success_and_unblock_reports_state() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        set_now(0);
        run(&mut k, 0, main);
        assert_eq!(k.sys_sleep(0, 100), Ok(Blocking::Blocked));
        assert_eq!(k.task(main).state(), TaskState::WaitWq);
        tick_to(&mut k, 0, 100);
        assert_eq!(k.current(0), Some(main));
        assert_eq!(result(k.task(main).save().rets()), Ok([0, 0]));

        assert_eq!(k.sys_sleep(0, 100), Ok(Blocking::Blocked));
        k.schedule(0);
        run(&mut k, 0, worker);
        k.sys_unblock(0, main).unwrap();
        assert_eq!(
            result(k.task(main).save().rets()),
            Err(ErrorCode::State)
        );
        assert!(k.sched(0).timeouts().is_empty());
        assert_eq!(k.sys_unblock(0, main), Err(ErrorCode::State));
    }

    #[test]
    fn chain_replaces_caller() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        run(&mut k, 0, main);
        k.sys_task_chain(0, worker).unwrap();
        assert_eq!(k.task(main).state(), TaskState::Suspended);
        k.schedule(0);
        assert_eq!(k.current(0), Some(worker));
    }

    #[test]
    fn terminate_other_stops_ready_task() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        run(&mut k, 0, main);
        k.sys_task_activate(0, worker).unwrap();
        k.sys_task_activate(0, worker).unwrap();
        k.sys_task_terminate_other(0, worker).unwrap();
        assert_eq!(k.task(worker).state(), TaskState::Suspended);
        assert_eq!(k.task(worker).pending_activations(), 0);
        assert_eq!(
            k.sys_task_terminate_other(0, worker),
            Err(ErrorCode::State)
        );
        assert_eq!(k.sys_task_terminate_other(0, main), Err(ErrorCode::Value));
    }

    #[test]
    fn create_sets_start_parameters() {
        let (mut k, app) = boot(APP);
        let (main, worker) = (app.task("main"), app.task("worker"));
        run(&mut k, 0, main);
        k.sys_task_create(0, worker, Priority(11), 0x2000, 7).unwrap();
        k.sys_task_activate(0, worker).unwrap();
        k.schedule(0);
        assert_eq!(k.current(0), Some(worker));
        let save = k.task(worker).save();
        assert_eq!(save.pc, 0x2000);
        assert_eq!(save.args()[0], 7);
        assert_eq!(
            k.sys_task_create(0, worker, Priority(11), 0, 0),
            Err(ErrorCode::State)
        );
    }

    const PERIODIC: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        period = 100
        [[task]]
        name = "main"
        partition = "p"
        priority = 10
        [[task]]
        name = "tick"
        partition = "p"
        priority = 20
        period = 100
        deadline = 80
        max_activations = 2
    "#;

    #[test]
    fn periodic_task_follows_release_grid() {
        let (mut k, app) = boot(PERIODIC);
        let (main, tick) = (app.task("main"), app.task("tick"));
        set_now(30);
        run(&mut k, 0, main);
        k.sys_task_delayed_activate(0, tick, 5).unwrap();
        assert_eq!(k.task(tick).timeout(), Some(Timestamp::from(105)));

        tick_to(&mut k, 0, 105);
        assert_eq!(k.current(0), Some(tick));
        assert_eq!(k.task(tick).deadline(), Some(Timestamp::from(185)));

        set_now(120);
        assert_eq!(k.sys_task_wait_periodic(0), Ok(Blocking::Blocked));
        assert_eq!(k.task(tick).timeout(), Some(Timestamp::from(205)));
        assert_eq!(k.task(tick).deadline(), None);

        // An overrun skips the missed release.
        tick_to(&mut k, 0, 205);
        set_now(420);
        assert_eq!(k.sys_task_wait_periodic(0), Ok(Blocking::Blocked));
        assert_eq!(k.task(tick).timeout(), Some(Timestamp::from(505)));
        k.schedule(0);
        assert_eq!(k.current(0), Some(main));
        assert_eq!(k.sys_task_wait_periodic(0), Err(ErrorCode::Access));
    }

    #[test]
    fn queued_activation_of_periodic_task_waits_for_next_release() {
        let (mut k, app) = boot(PERIODIC);
        let (main, tick) = (app.task("main"), app.task("tick"));
        set_now(30);
        run(&mut k, 0, main);
        k.sys_task_activate(0, tick).unwrap();
        assert_eq!(k.task(tick).state(), TaskState::WaitAct);
        tick_to(&mut k, 0, 100);
        assert_eq!(k.current(0), Some(tick));

        k.sys_task_activate(0, tick).unwrap();
        assert_eq!(k.task(tick).pending_activations(), 1);
        set_now(130);
        k.sys_task_terminate(0).unwrap();
        assert_eq!(k.task(tick).state(), TaskState::WaitAct);
        assert_eq!(k.task(tick).timeout(), Some(Timestamp::from(200)));
        assert_eq!(k.task(tick).pending_activations(), 0);
        k.schedule(0);
        assert_eq!(k.current(0), Some(main));
    }
}

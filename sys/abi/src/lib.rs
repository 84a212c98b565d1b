// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel, partitions, and the
//! configuration tooling.
//!
//! Everything in here is either a value that crosses the system call
//! boundary (error codes, states, syscall numbers) or part of the static
//! application description the kernel is booted with (`AppDesc` and friends).

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

mod hm;

pub use hm::*;

/// Number of distinct scheduling priorities. Priority 0 is reserved for the
/// per-CPU idle task.
pub const NUM_PRIOS: usize = 256;

/// Timeout value meaning "wait forever". Waits with this timeout never enter
/// the timeout queue.
pub const INFINITE: u64 = u64::MAX;

/// Names a task by its dense index in the application task table.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Extracts the table index of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

impl From<usize> for TaskId {
    fn from(x: usize) -> Self {
        Self(x as u16)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically *higher*
/// priorities are more important; priority 0 belongs to the idle task and is
/// never given to a configured task.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater or
/// more important.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const IDLE: Self = Self(0);
    /// Above anything an application can configure; used to let an
    /// exception hook run ahead of everyone.
    pub const HIGHEST: Self = Self(u8::MAX);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Index of this priority's bucket in a ready queue.
    pub fn bucket(self) -> usize {
        usize::from(self.0)
    }
}

/// Error codes returned synchronously from system calls.
///
/// The numbering follows the OSEK/AUTOSAR `StatusType` values, with the
/// kernel-specific codes appended. `E_OK` is represented by `Ok(_)` and has no
/// variant here; on the wire it is zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// Object belongs to another partition, or the caller lacks privilege.
    Access = 1,
    CallLevel = 2,
    /// Identifier out of range or naming the wrong kind of object.
    Id = 3,
    /// Activation limit reached.
    Limit = 4,
    /// Nothing to do: inactive alarm, empty record ring, no transition.
    NoFunc = 5,
    /// Task still holds a raised priority.
    Resource = 6,
    /// Object is in the wrong state for this request.
    State = 7,
    /// Parameter out of range.
    Value = 8,
    ServiceId = 9,
    IllegalAddress = 10,
    MissingEnd = 11,
    DisabledInt = 12,
    StackFault = 13,
    ParamPointer = 14,
    ProtectionMemory = 15,
    ProtectionTime = 16,
    ProtectionArrival = 17,
    ProtectionLocked = 18,
    ProtectionException = 19,
    Spinlock = 20,
    InterferenceDeadlock = 21,
    NestingDeadlock = 22,
    /// Request cannot be served from this core.
    Core = 23,
    /// Poll unsatisfied, or a blocking wait timed out.
    Timeout = 24,
}

impl TryFrom<u32> for ErrorCode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Access),
            2 => Ok(Self::CallLevel),
            3 => Ok(Self::Id),
            4 => Ok(Self::Limit),
            5 => Ok(Self::NoFunc),
            6 => Ok(Self::Resource),
            7 => Ok(Self::State),
            8 => Ok(Self::Value),
            9 => Ok(Self::ServiceId),
            10 => Ok(Self::IllegalAddress),
            11 => Ok(Self::MissingEnd),
            12 => Ok(Self::DisabledInt),
            13 => Ok(Self::StackFault),
            14 => Ok(Self::ParamPointer),
            15 => Ok(Self::ProtectionMemory),
            16 => Ok(Self::ProtectionTime),
            17 => Ok(Self::ProtectionArrival),
            18 => Ok(Self::ProtectionLocked),
            19 => Ok(Self::ProtectionException),
            20 => Ok(Self::Spinlock),
            21 => Ok(Self::InterferenceDeadlock),
            22 => Ok(Self::NestingDeadlock),
            23 => Ok(Self::Core),
            24 => Ok(Self::Timeout),
            _ => Err(()),
        }
    }
}

/// Scheduling state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum TaskState {
    /// Not activated; ignored by the scheduler.
    #[default]
    Suspended = 0,
    /// In a ready queue.
    Ready = 1,
    /// Currently on its CPU.
    Running = 2,
    /// Waiting for any of a set of events.
    WaitEv = 3,
    /// Waiting on a wait queue, or sleeping.
    WaitWq = 4,
    /// RPC client waiting for a server to take and answer its request.
    WaitSend = 5,
    /// RPC server waiting for a request.
    WaitRecv = 6,
    /// Waiting for a release point (delayed start, periodic wait, or entry of
    /// the partition into NORMAL mode).
    WaitAct = 7,
}

impl TaskState {
    /// Checks if the task is blocked in one of the waiting states.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::WaitEv
                | Self::WaitWq
                | Self::WaitSend
                | Self::WaitRecv
                | Self::WaitAct
        )
    }

    /// Checks if `sys_unblock` may cancel this wait.
    pub fn is_unblockable(&self) -> bool {
        matches!(self, Self::WaitWq | Self::WaitSend | Self::WaitRecv)
    }
}

/// Partition operating mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PartMode {
    Idle = 0,
    ColdStart = 1,
    WarmStart = 2,
    Normal = 3,
}

impl TryFrom<u32> for PartMode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Idle),
            1 => Ok(Self::ColdStart),
            2 => Ok(Self::WarmStart),
            3 => Ok(Self::Normal),
            _ => Err(()),
        }
    }
}

/// Reason for the most recent (re)start of a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StartCondition {
    /// Power-on start at boot.
    NormalStart = 0,
    /// Restart requested through `sys_part_set_operating_mode*`.
    PartitionRestart = 1,
    /// Restart caused by a module-level HM decision.
    HmModuleRestart = 2,
    /// Restart caused by a partition-level HM decision.
    HmPartitionRestart = 3,
}

/// Run state of a schedule table, as reported by `sys_schedtab_get_status`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedTabState {
    Stopped = 0,
    /// Chained as the successor of a running table.
    Next = 1,
    /// Explicitly synchronized table waiting for its first sync value.
    Waiting = 2,
    Running = 3,
    /// Synchronized, deviation within precision.
    RunningSync = 4,
    /// Synchronized, deviation outside precision.
    RunningAsync = 5,
}

impl SchedTabState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::RunningSync | Self::RunningAsync)
    }
}

/// Ordering of waiters in a wait queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WqDiscipline {
    Fifo = 0,
    Priority = 1,
}

impl TryFrom<u32> for WqDiscipline {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Fifo),
            1 => Ok(Self::Priority),
            _ => Err(()),
        }
    }
}

/// Result of `sys_alarm_base`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlarmBase {
    pub max_allowed_value: u32,
    pub ticks_per_base: u32,
    pub min_cycle: u32,
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    TaskSelf = 0,
    TaskActivate = 1,
    TaskDelayedActivate = 2,
    TaskCreate = 3,
    TaskTerminate = 4,
    TaskTerminateOther = 5,
    TaskChain = 6,
    TaskGetState = 7,
    TaskGetPrio = 8,
    TaskSetPrio = 9,
    PrioRaise = 10,
    PrioRestore = 11,
    Yield = 12,
    Sleep = 13,
    WaitPeriodic = 14,
    Unblock = 15,
    EvSet = 16,
    EvGet = 17,
    EvClear = 18,
    EvWait = 19,
    AlarmBase = 20,
    AlarmGet = 21,
    AlarmSetRel = 22,
    AlarmSetAbs = 23,
    AlarmCancel = 24,
    CounterIncrement = 25,
    CounterGet = 26,
    CounterElapsed = 27,
    SchedTabStartRel = 28,
    SchedTabStartAbs = 29,
    SchedTabStartSync = 30,
    SchedTabStop = 31,
    SchedTabNext = 32,
    SchedTabSync = 33,
    SchedTabSetAsync = 34,
    SchedTabGetStatus = 35,
    WqSetDiscipline = 36,
    WqWait = 37,
    WqWake = 38,
    PartSelf = 39,
    PartGetMode = 40,
    PartSetMode = 41,
    PartGetStartCondition = 42,
    PartGetModeExt = 43,
    PartSetModeExt = 44,
    HmChangeTable = 45,
    HmInject = 46,
    HmGetError = 47,
    HmGetException = 48,
    Abort = 49,
    RpcCall = 50,
    RpcRecv = 51,
    RpcReply = 52,
    IsrMask = 53,
    IsrUnmask = 54,
    TpScheduleSwitch = 55,
    TpScheduleGet = 56,
    GetTime = 57,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::TaskSelf),
            1 => Ok(Self::TaskActivate),
            2 => Ok(Self::TaskDelayedActivate),
            3 => Ok(Self::TaskCreate),
            4 => Ok(Self::TaskTerminate),
            5 => Ok(Self::TaskTerminateOther),
            6 => Ok(Self::TaskChain),
            7 => Ok(Self::TaskGetState),
            8 => Ok(Self::TaskGetPrio),
            9 => Ok(Self::TaskSetPrio),
            10 => Ok(Self::PrioRaise),
            11 => Ok(Self::PrioRestore),
            12 => Ok(Self::Yield),
            13 => Ok(Self::Sleep),
            14 => Ok(Self::WaitPeriodic),
            15 => Ok(Self::Unblock),
            16 => Ok(Self::EvSet),
            17 => Ok(Self::EvGet),
            18 => Ok(Self::EvClear),
            19 => Ok(Self::EvWait),
            20 => Ok(Self::AlarmBase),
            21 => Ok(Self::AlarmGet),
            22 => Ok(Self::AlarmSetRel),
            23 => Ok(Self::AlarmSetAbs),
            24 => Ok(Self::AlarmCancel),
            25 => Ok(Self::CounterIncrement),
            26 => Ok(Self::CounterGet),
            27 => Ok(Self::CounterElapsed),
            28 => Ok(Self::SchedTabStartRel),
            29 => Ok(Self::SchedTabStartAbs),
            30 => Ok(Self::SchedTabStartSync),
            31 => Ok(Self::SchedTabStop),
            32 => Ok(Self::SchedTabNext),
            33 => Ok(Self::SchedTabSync),
            34 => Ok(Self::SchedTabSetAsync),
            35 => Ok(Self::SchedTabGetStatus),
            36 => Ok(Self::WqSetDiscipline),
            37 => Ok(Self::WqWait),
            38 => Ok(Self::WqWake),
            39 => Ok(Self::PartSelf),
            40 => Ok(Self::PartGetMode),
            41 => Ok(Self::PartSetMode),
            42 => Ok(Self::PartGetStartCondition),
            43 => Ok(Self::PartGetModeExt),
            44 => Ok(Self::PartSetModeExt),
            45 => Ok(Self::HmChangeTable),
            46 => Ok(Self::HmInject),
            47 => Ok(Self::HmGetError),
            48 => Ok(Self::HmGetException),
            49 => Ok(Self::Abort),
            50 => Ok(Self::RpcCall),
            51 => Ok(Self::RpcRecv),
            52 => Ok(Self::RpcReply),
            53 => Ok(Self::IsrMask),
            54 => Ok(Self::IsrUnmask),
            55 => Ok(Self::TpScheduleSwitch),
            56 => Ok(Self::TpScheduleGet),
            57 => Ok(Self::GetTime),
            _ => Err(()),
        }
    }
}

/// Kind of a task-like object. Hooks and ISRs are scheduled like tasks but
/// can't be activated through `sys_task_activate`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    Task,
    /// Interrupt service task bound to an interrupt line.
    Isr { irq: u32 },
    /// Runs while the partition is in COLD_START/WARM_START.
    InitHook,
    /// Receives asynchronous task-level HM errors.
    ErrorHook,
    /// Receives synchronous exceptions.
    ExceptionHook,
}

impl TaskKind {
    /// Hooks preempt equal-priority work when activated.
    pub fn is_hook(&self) -> bool {
        matches!(self, Self::ErrorHook | Self::ExceptionHook)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TaskFlags: u8 {
        /// Task serves RPC requests.
        const RPC_SERVER = 1 << 0;
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PartFlags: u8 {
        /// Partition may change other partitions' modes, switch HM tables,
        /// and select time-partition schedules.
        const PRIVILEGED = 1 << 0;
    }
}

/// Static description of a task.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    pub partition: u8,
    pub kind: TaskKind,
    /// Priority on activation.
    pub priority: Priority,
    /// Upper bound for user-set and raised priorities.
    pub max_priority: Priority,
    /// Upper bound of concurrent activations, including the running one.
    pub max_activations: u8,
    /// Release period in ns; zero for aperiodic tasks.
    pub period: u64,
    /// Relative deadline in ns; zero disables deadline monitoring.
    pub deadline: u64,
    /// Events the task may wait for; non-zero makes it an extended task.
    pub events: u32,
    /// Time partition on the owning CPU.
    pub tp: u8,
    pub entry_point: u32,
    pub initial_stack: u32,
    pub flags: TaskFlags,
}

impl TaskDesc {
    pub fn is_extended(&self) -> bool {
        self.events != 0
    }

    pub fn is_periodic(&self) -> bool {
        self.period != 0
    }
}

/// Static description of a partition.
#[derive(Copy, Clone, Debug)]
pub struct PartDesc {
    pub cpu: u8,
    /// Release period in ns; zero if the partition has no periodic tasks.
    pub period: u64,
    pub initial_mode: PartMode,
    pub flags: PartFlags,
    /// Index into `AppDesc::hm_part_tables`.
    pub hm_table: u8,
    pub init_hook: Option<TaskId>,
    pub error_hook: Option<TaskId>,
    pub exception_hook: Option<TaskId>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    /// Advanced once per timer tick of the owning CPU.
    Hardware,
    /// Advanced by `sys_counter_increment` or by alarm actions.
    Software,
}

#[derive(Copy, Clone, Debug)]
pub struct CounterDesc {
    pub cpu: u8,
    pub kind: CounterKind,
    pub max_allowed_value: u32,
    pub ticks_per_base: u32,
    pub min_cycle: u32,
}

impl CounterDesc {
    /// Number of distinct counter values.
    pub fn modulus(&self) -> u64 {
        u64::from(self.max_allowed_value) + 1
    }
}

/// What an alarm does when it expires.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlarmAction {
    ActivateTask { task: TaskId },
    SetEvent { task: TaskId, mask: u32 },
    /// Activates a hook task.
    Hook { task: TaskId },
    /// Calls into the board with the given callback number.
    Callback { id: u32 },
    IncrementCounter { counter: u16 },
    /// Drives a schedule table; such alarms are not user-accessible.
    SchedTab { schedtab: u16 },
}

/// Relative alarm start applied when the partition enters NORMAL.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AlarmAutostart {
    pub increment: u32,
    pub cycle: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct AlarmDesc {
    pub counter: u16,
    pub partition: u8,
    pub action: AlarmAction,
    pub autostart: Option<AlarmAutostart>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedTabAction {
    /// Position-zero marker; always the first action of a table.
    Start,
    Event { task: TaskId, mask: u32 },
    Task { task: TaskId },
    Hook { task: TaskId },
    /// Suspends processing until the next expiry point.
    Wait { ticks: u32 },
    /// Budget by which the next `Wait` may be shortened.
    Shorten { ticks: u32 },
    /// Budget by which the next `Wait` may be lengthened.
    Lengthen { ticks: u32 },
    /// End of the table.
    Wrap,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    None,
    /// Driving counter is the time reference.
    Implicit,
    /// Synchronized through `sys_schedtab_sync`.
    Explicit,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedTabAutostart {
    Relative { offset: u32 },
    Absolute { start: u32 },
    Synchron,
}

#[derive(Copy, Clone, Debug)]
pub struct SchedTabDesc {
    pub counter: u16,
    /// Alarm driving this table; its action is `AlarmAction::SchedTab`.
    pub alarm: u16,
    pub partition: u8,
    pub actions: &'static [SchedTabAction],
    /// Sum of all `Wait` durations.
    pub duration: u32,
    pub sync: SyncStrategy,
    pub precision: u32,
    pub repeating: bool,
    pub autostart: Option<SchedTabAutostart>,
}

#[derive(Copy, Clone, Debug)]
pub struct WqDesc {
    pub partition: u8,
    pub discipline: WqDiscipline,
}

/// One window of a time-partition schedule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TpWindow {
    /// Window length in ns.
    pub duration: u64,
    pub tp: u8,
}

#[derive(Copy, Clone, Debug)]
pub struct TpScheduleDesc {
    pub windows: &'static [TpWindow],
}

#[derive(Copy, Clone, Debug)]
pub struct CpuDesc {
    /// Number of time partitions on this CPU.
    pub tp_count: u8,
    /// Empty if the CPU runs time partition 0 forever.
    pub schedules: &'static [TpScheduleDesc],
    pub initial_schedule: u8,
}

/// The complete static description of an application, indexed by dense ids.
#[derive(Copy, Clone, Debug)]
pub struct AppDesc {
    pub cpus: &'static [CpuDesc],
    pub partitions: &'static [PartDesc],
    pub tasks: &'static [TaskDesc],
    pub counters: &'static [CounterDesc],
    pub alarms: &'static [AlarmDesc],
    pub schedtabs: &'static [SchedTabDesc],
    pub wqs: &'static [WqDesc],
    pub hm_system_tables: &'static [SystemHmTable],
    pub hm_part_tables: &'static [PartHmTable],
}

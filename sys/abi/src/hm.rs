// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Health-monitoring taxonomy and tables.
//!
//! HM decisions are table driven. Every error id indexes one entry in the
//! partition's table, which either handles the error at task level (by
//! handing a record to the partition's error hook), at partition level
//! (ignore/idle/restart), or escalates to the selected system table.
//!
//! Entries are kept decoded in memory. The packed 8-bit encoding survives
//! only in `HmPackedTable`, for configuration images produced by external
//! tools:
//!
//! ```text
//!   7   6 5   4 3 2 1 0
//! +---+-----+-----------+
//! | L | act | code + 1  |
//! +---+-----+-----------+
//! ```
//!
//! `L` set means system level; a code field of zero means "no task-level
//! error code".

use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;

/// Number of HM error ids; sizes every HM table.
pub const HM_ERROR_COUNT: usize = 36;

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum HmErrorId {
    IllegalInstruction = 0,
    PrivilegedInstruction = 1,
    TrapInstruction = 2,
    /// Unknown system call number.
    IllegalSyscall = 3,
    FpuUnavailable = 4,
    FpuError = 5,
    ArithmeticOverflow = 6,
    UnalignedCode = 7,
    UnalignedData = 8,
    MpuErrorCode = 9,
    MpuErrorRead = 10,
    MpuErrorWrite = 11,
    BusErrorCode = 12,
    BusErrorRead = 13,
    BusErrorWrite = 14,
    EccErrorCode = 15,
    EccErrorRead = 16,
    EccErrorWrite = 17,
    ContextOverflow = 18,
    ContextUnderflow = 19,
    ContextError = 20,
    StackOverflow = 21,
    DeadlineMissed = 22,
    /// An activation was dropped because the target was at its limit.
    ActivationError = 23,
    /// An asynchronous request hit an object in the wrong state.
    StateError = 24,
    BudgetOverrun = 25,
    ArrivalRate = 26,
    NmiPin = 27,
    PowerFail = 28,
    TemperatureFail = 29,
    Watchdog = 30,
    SpuriousInterrupt = 31,
    KernelError = 32,
    /// Injected through `sys_hm_inject`.
    UserError = 33,
    /// Raised by `sys_abort`.
    Abort = 34,
    /// A hook could not be run.
    HookError = 35,
}

impl HmErrorId {
    pub const ALL: [Self; HM_ERROR_COUNT] = [
        Self::IllegalInstruction,
        Self::PrivilegedInstruction,
        Self::TrapInstruction,
        Self::IllegalSyscall,
        Self::FpuUnavailable,
        Self::FpuError,
        Self::ArithmeticOverflow,
        Self::UnalignedCode,
        Self::UnalignedData,
        Self::MpuErrorCode,
        Self::MpuErrorRead,
        Self::MpuErrorWrite,
        Self::BusErrorCode,
        Self::BusErrorRead,
        Self::BusErrorWrite,
        Self::EccErrorCode,
        Self::EccErrorRead,
        Self::EccErrorWrite,
        Self::ContextOverflow,
        Self::ContextUnderflow,
        Self::ContextError,
        Self::StackOverflow,
        Self::DeadlineMissed,
        Self::ActivationError,
        Self::StateError,
        Self::BudgetOverrun,
        Self::ArrivalRate,
        Self::NmiPin,
        Self::PowerFail,
        Self::TemperatureFail,
        Self::Watchdog,
        Self::SpuriousInterrupt,
        Self::KernelError,
        Self::UserError,
        Self::Abort,
        Self::HookError,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for HmErrorId {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        Self::ALL.get(x as usize).copied().ok_or(())
    }
}

/// Task-level error code handed to error hooks (ARINC 653 error types).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct TaskErrorCode(pub u8);

impl TaskErrorCode {
    pub const DEADLINE_MISSED: Self = Self(0);
    pub const APPLICATION_ERROR: Self = Self(1);
    pub const NUMERIC_ERROR: Self = Self(2);
    pub const ILLEGAL_REQUEST: Self = Self(3);
    pub const STACK_OVERFLOW: Self = Self(4);
    pub const MEMORY_VIOLATION: Self = Self(5);
    pub const HARDWARE_FAULT: Self = Self(6);
    pub const POWER_FAIL: Self = Self(7);

    /// Largest code that fits the packed encoding.
    pub const MAX: Self = Self(30);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmLevel {
    System,
    Partition,
}

/// Partition-level recovery action.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HmPartAction {
    Ignore = 0,
    Idle = 1,
    WarmStart = 2,
    ColdStart = 3,
}

/// System-level recovery action.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HmSysAction {
    Ignore = 0,
    Shutdown = 1,
    Reset = 2,
}

/// Decoded partition HM table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HmPartEntry {
    pub level: HmLevel,
    pub action: HmPartAction,
    /// If present, the error is delivered to the error hook first.
    pub code: Option<TaskErrorCode>,
}

impl HmPartEntry {
    pub const IGNORE: Self = Self {
        level: HmLevel::Partition,
        action: HmPartAction::Ignore,
        code: None,
    };

    pub fn pack(&self) -> u8 {
        let level = match self.level {
            HmLevel::System => 0x80,
            HmLevel::Partition => 0,
        };
        let code = self.code.map_or(0, |c| (c.0 & 0x1f) + 1);
        level | (self.action as u8) << 5 | code
    }

    pub fn unpack(b: u8) -> Self {
        let level = if b & 0x80 != 0 {
            HmLevel::System
        } else {
            HmLevel::Partition
        };
        let action = match (b >> 5) & 0x3 {
            0 => HmPartAction::Ignore,
            1 => HmPartAction::Idle,
            2 => HmPartAction::WarmStart,
            _ => HmPartAction::ColdStart,
        };
        let code = match b & 0x1f {
            0 => None,
            c => Some(TaskErrorCode(c - 1)),
        };
        Self {
            level,
            action,
            code,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartHmTable {
    pub entries: [HmPartEntry; HM_ERROR_COUNT],
}

impl PartHmTable {
    pub fn entry(&self, error: HmErrorId) -> HmPartEntry {
        self.entries[error.index()]
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SystemHmTable {
    pub entries: [HmSysAction; HM_ERROR_COUNT],
}

impl SystemHmTable {
    pub fn action(&self, error: HmErrorId) -> HmSysAction {
        self.entries[error.index()]
    }
}

/// Packed HM table as found in binary configuration images.
#[derive(
    Copy,
    Clone,
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
)]
#[repr(transparent)]
pub struct HmPackedTable(pub [u8; HM_ERROR_COUNT]);

impl HmPackedTable {
    /// Interprets `bytes` as a packed table; fails unless the length is
    /// exactly `HM_ERROR_COUNT`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_bytes(bytes).ok()
    }

    pub fn to_part_table(&self) -> PartHmTable {
        PartHmTable {
            entries: self.0.map(HmPartEntry::unpack),
        }
    }

    /// System tables only use the action field; a system entry with the
    /// partition-level encoding of IDLE means SHUTDOWN and anything above
    /// means RESET.
    pub fn to_system_table(&self) -> SystemHmTable {
        SystemHmTable {
            entries: self.0.map(|b| match (b >> 5) & 0x3 {
                0 => HmSysAction::Ignore,
                1 => HmSysAction::Shutdown,
                _ => HmSysAction::Reset,
            }),
        }
    }

    pub fn from_part_table(t: &PartHmTable) -> Self {
        Self(t.entries.map(|e| e.pack()))
    }
}

/// One record in a partition's error ring, retrieved by the error hook.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ErrorRecord {
    pub task: super::TaskId,
    pub code: TaskErrorCode,
    pub error: HmErrorId,
    pub extra: u32,
    /// Kernel time in ns at which the error was raised.
    pub time: u64,
}

/// Description of the exception that activated an exception hook.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExceptionRecord {
    pub task: super::TaskId,
    pub error: HmErrorId,
    pub addr: u32,
}

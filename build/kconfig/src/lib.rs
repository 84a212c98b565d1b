// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application configuration for the kernel.
//!
//! An application is written down in TOML, with objects referring to each
//! other by name, and lowered here into the index-addressed `abi::AppDesc`
//! the kernel boots from. Object ids are positions in the file: the third
//! `[[task]]` is task 2, and so on.
//!
//! Lowering resolves names and fills in defaults. It also compiles schedule
//! tables from their expiry points into action lists, each with a hidden
//! driving alarm. Those alarms are numbered after all user alarms. Whether
//! the result makes sense as a system (priorities, limits, table lengths
//! against counter ranges) is left to the kernel's own boot-time check.

use std::collections::BTreeMap;
use std::path::Path;

use abi::{
    AlarmAction, AlarmAutostart, AlarmDesc, AppDesc, CounterDesc, CounterKind,
    CpuDesc, HmErrorId, HmLevel, HmPackedTable, HmPartAction, HmPartEntry,
    HmSysAction, PartDesc, PartFlags, PartHmTable, PartMode, Priority,
    SchedTabAction, SchedTabAutostart, SchedTabDesc, SyncStrategy,
    SystemHmTable, TaskDesc, TaskErrorCode, TaskFlags, TaskId, TaskKind,
    TpScheduleDesc, TpWindow, WqDesc, WqDiscipline, HM_ERROR_COUNT,
};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// An application file as written.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub cpu: Vec<CpuConfig>,
    #[serde(default)]
    pub partition: Vec<PartitionConfig>,
    /// Tasks in the application. The order of tasks is significant.
    #[serde(default)]
    pub task: Vec<TaskConfig>,
    #[serde(default)]
    pub counter: Vec<CounterConfig>,
    #[serde(default)]
    pub alarm: Vec<AlarmConfig>,
    #[serde(default)]
    pub schedtab: Vec<SchedTabConfig>,
    #[serde(default)]
    pub wq: Vec<WqConfig>,
    #[serde(default)]
    pub hm_partition_table: Vec<PartTableConfig>,
    /// System HM tables; the first one is active at boot. If none are given,
    /// one that ignores everything is supplied.
    #[serde(default)]
    pub hm_system_table: Vec<SystemTableConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuConfig {
    #[serde(default = "one_u8")]
    pub tp_count: u8,
    /// Time-partition schedules to choose from. A CPU without any stays in
    /// time partition 0.
    #[serde(default)]
    pub schedules: Vec<Vec<WindowConfig>>,
    #[serde(default)]
    pub initial_schedule: u8,
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub tp: u8,
    pub duration: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub cpu: u8,
    #[serde(default = "cold_start")]
    pub initial_mode: PartMode,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub period: u64,
    pub init_hook: Option<String>,
    pub error_hook: Option<String>,
    pub exception_hook: Option<String>,
    /// Name of a `[[hm_partition_table]]`; the default ignores every error
    /// at partition level.
    pub hm_table: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKindConfig {
    #[default]
    Task,
    Isr,
    InitHook,
    ErrorHook,
    ExceptionHook,
}

/// Record describing a single task.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    pub partition: String,
    #[serde(default)]
    pub kind: TaskKindConfig,
    /// Interrupt line; required for, and only allowed on, ISR tasks.
    pub irq: Option<u32>,
    /// Priority on activation.
    pub priority: u8,
    /// Ceiling for priority changes; defaults to `priority`.
    pub max_priority: Option<u8>,
    #[serde(default = "one_u8")]
    pub max_activations: u8,
    #[serde(default)]
    pub period: u64,
    #[serde(default)]
    pub deadline: u64,
    #[serde(default)]
    pub events: u32,
    #[serde(default)]
    pub tp: u8,
    #[serde(default)]
    pub entry_point: u32,
    #[serde(default)]
    pub initial_stack: u32,
    #[serde(default)]
    pub rpc_server: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterConfig {
    pub name: String,
    #[serde(default)]
    pub cpu: u8,
    #[serde(default = "software")]
    pub kind: CounterKind,
    pub max_allowed_value: u32,
    #[serde(default = "one_u32")]
    pub ticks_per_base: u32,
    #[serde(default = "one_u32")]
    pub min_cycle: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum AlarmActionConfig {
    ActivateTask(String),
    SetEvent { task: String, mask: u32 },
    Hook(String),
    Callback(u32),
    IncrementCounter(String),
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlarmAutostartConfig {
    pub increment: u32,
    #[serde(default)]
    pub cycle: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlarmConfig {
    pub name: String,
    pub counter: String,
    pub partition: String,
    pub action: AlarmActionConfig,
    pub autostart: Option<AlarmAutostartConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ExpiryActionConfig {
    ActivateTask(String),
    SetEvent { task: String, mask: u32 },
    Hook(String),
}

/// One point of a schedule table, `offset` ticks after its start.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpiryPointConfig {
    pub offset: u32,
    #[serde(default)]
    pub actions: Vec<ExpiryActionConfig>,
    /// Budget for shortening the wait that follows this point.
    #[serde(default)]
    pub max_shorten: u32,
    /// Budget for lengthening the wait that follows this point.
    #[serde(default)]
    pub max_lengthen: u32,
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SchedTabAutostartConfig {
    Relative(u32),
    Absolute(u32),
    Synchron,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedTabConfig {
    pub name: String,
    pub counter: String,
    pub partition: String,
    pub duration: u32,
    #[serde(default)]
    pub repeating: bool,
    #[serde(default = "no_sync")]
    pub sync: SyncStrategy,
    #[serde(default)]
    pub precision: u32,
    pub autostart: Option<SchedTabAutostartConfig>,
    /// Expiry points in increasing offset order.
    #[serde(default)]
    pub expiry_point: Vec<ExpiryPointConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WqConfig {
    pub name: String,
    pub partition: String,
    #[serde(default = "fifo")]
    pub discipline: WqDiscipline,
}

/// Partition HM table entry; anything left out is a partition-level error
/// that is ignored and not reported to the error hook.
#[derive(Copy, Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartEntryConfig {
    pub level: Option<HmLevel>,
    pub action: Option<HmPartAction>,
    /// Error code handed to the error hook.
    pub code: Option<u8>,
}

/// Partition HM table, given either as entries keyed by error name or as a
/// packed image of one byte per error.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartTableConfig {
    pub name: String,
    #[serde(default)]
    pub entries: BTreeMap<String, PartEntryConfig>,
    pub packed: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemTableConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, HmSysAction>,
    pub packed: Option<Vec<u8>>,
}

fn one_u8() -> u8 {
    1
}

fn one_u32() -> u32 {
    1
}

fn cold_start() -> PartMode {
    PartMode::ColdStart
}

fn software() -> CounterKind {
    CounterKind::Software
}

fn no_sync() -> SyncStrategy {
    SyncStrategy::None
}

fn fifo() -> WqDiscipline {
    WqDiscipline::Fifo
}

/// A lowered application: the kernel's description plus the names it was
/// written with.
#[derive(Clone, Debug)]
pub struct App {
    pub desc: &'static AppDesc,
    partitions: BTreeMap<String, usize>,
    tasks: BTreeMap<String, usize>,
    counters: BTreeMap<String, usize>,
    alarms: BTreeMap<String, usize>,
    schedtabs: BTreeMap<String, usize>,
    wqs: BTreeMap<String, usize>,
}

impl App {
    pub fn partition(&self, name: &str) -> Option<usize> {
        self.partitions.get(name).copied()
    }

    pub fn task(&self, name: &str) -> Option<TaskId> {
        self.tasks.get(name).map(|&i| TaskId::from(i))
    }

    pub fn counter(&self, name: &str) -> Option<u32> {
        id(&self.counters, name)
    }

    pub fn alarm(&self, name: &str) -> Option<u32> {
        id(&self.alarms, name)
    }

    pub fn schedtab(&self, name: &str) -> Option<u32> {
        id(&self.schedtabs, name)
    }

    pub fn wq(&self, name: &str) -> Option<u32> {
        id(&self.wqs, name)
    }
}

fn id(map: &BTreeMap<String, usize>, name: &str) -> Option<u32> {
    map.get(name).map(|&i| i as u32)
}

/// Parses and lowers an application from TOML text.
pub fn load_str(text: &str) -> Result<App> {
    AppConfig::from_toml(text)?.lower()
}

pub fn load_file(path: &Path) -> Result<App> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    load_str(&text).with_context(|| format!("loading {}", path.display()))
}

/// Gives lowered tables the lifetime of the kernel, which is the rest of the
/// program.
fn leak<T>(v: Vec<T>) -> &'static [T] {
    Box::leak(v.into_boxed_slice())
}

fn index_names<'a>(
    what: &str,
    names: impl Iterator<Item = &'a String>,
) -> Result<BTreeMap<String, usize>> {
    let mut map = BTreeMap::new();
    for (i, name) in names.enumerate() {
        if map.insert(name.clone(), i).is_some() {
            bail!("duplicate {what} name `{name}`");
        }
    }
    Ok(map)
}

fn resolve(
    map: &BTreeMap<String, usize>,
    what: &str,
    name: &str,
) -> Result<usize> {
    match map.get(name) {
        Some(&i) => Ok(i),
        None => bail!("unknown {what} `{name}`"),
    }
}

fn hm_error(name: &str) -> Result<HmErrorId> {
    match HmErrorId::ALL.iter().find(|e| format!("{e:?}") == name) {
        Some(&e) => Ok(e),
        None => bail!("unknown HM error `{name}`"),
    }
}

fn packed_table(bytes: &[u8]) -> Result<HmPackedTable> {
    match HmPackedTable::parse(bytes) {
        Some(t) => Ok(t),
        None => bail!(
            "packed HM table has {} bytes, expected {HM_ERROR_COUNT}",
            bytes.len()
        ),
    }
}

impl PartTableConfig {
    fn lower(&self) -> Result<PartHmTable> {
        if let Some(bytes) = &self.packed {
            if !self.entries.is_empty() {
                bail!("table has both `packed` and `entries`");
            }
            return Ok(packed_table(bytes)?.to_part_table());
        }
        let mut table = PartHmTable {
            entries: [HmPartEntry::IGNORE; HM_ERROR_COUNT],
        };
        for (name, e) in &self.entries {
            let code = e.code.map(TaskErrorCode);
            if let Some(c) = code {
                if c.0 > TaskErrorCode::MAX.0 {
                    bail!("error code {} for `{name}` is too large", c.0);
                }
            }
            table.entries[hm_error(name)?.index()] = HmPartEntry {
                level: e.level.unwrap_or(HmLevel::Partition),
                action: e.action.unwrap_or(HmPartAction::Ignore),
                code,
            };
        }
        Ok(table)
    }
}

impl SystemTableConfig {
    fn lower(&self) -> Result<SystemHmTable> {
        if let Some(bytes) = &self.packed {
            if !self.entries.is_empty() {
                bail!("table has both `packed` and `entries`");
            }
            return Ok(packed_table(bytes)?.to_system_table());
        }
        let mut table = SystemHmTable {
            entries: [HmSysAction::Ignore; HM_ERROR_COUNT],
        };
        for (name, &action) in &self.entries {
            table.entries[hm_error(name)?.index()] = action;
        }
        Ok(table)
    }
}

/// Name-to-index maps of everything that can be referred to.
struct Names {
    partitions: BTreeMap<String, usize>,
    tasks: BTreeMap<String, usize>,
    counters: BTreeMap<String, usize>,
    alarms: BTreeMap<String, usize>,
    schedtabs: BTreeMap<String, usize>,
    wqs: BTreeMap<String, usize>,
    part_tables: BTreeMap<String, usize>,
}

impl Names {
    fn partition(&self, name: &str) -> Result<u8> {
        Ok(u8::try_from(resolve(&self.partitions, "partition", name)?)?)
    }

    fn task(&self, name: &str) -> Result<TaskId> {
        let i = resolve(&self.tasks, "task", name)?;
        Ok(TaskId(u16::try_from(i)?))
    }

    fn counter(&self, name: &str) -> Result<u16> {
        Ok(u16::try_from(resolve(&self.counters, "counter", name)?)?)
    }

    fn hook(&self, name: &Option<String>) -> Result<Option<TaskId>> {
        name.as_deref().map(|n| self.task(n)).transpose()
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing application description")
    }

    /// Resolves names and builds the kernel's view of the application.
    pub fn lower(&self) -> Result<App> {
        let names = Names {
            partitions: index_names(
                "partition",
                self.partition.iter().map(|p| &p.name),
            )?,
            tasks: index_names("task", self.task.iter().map(|t| &t.name))?,
            counters: index_names(
                "counter",
                self.counter.iter().map(|c| &c.name),
            )?,
            alarms: index_names("alarm", self.alarm.iter().map(|a| &a.name))?,
            schedtabs: index_names(
                "schedule table",
                self.schedtab.iter().map(|s| &s.name),
            )?,
            wqs: index_names("wait queue", self.wq.iter().map(|w| &w.name))?,
            part_tables: index_names(
                "HM table",
                self.hm_partition_table.iter().map(|t| &t.name),
            )?,
        };

        let cpus: Vec<CpuDesc> = self.cpu.iter().map(lower_cpu).collect();

        let mut part_tables = self
            .hm_partition_table
            .iter()
            .map(|t| t.lower().with_context(|| format!("HM table `{}`", t.name)))
            .collect::<Result<Vec<_>>>()?;
        // Partitions without a table share an extra one that ignores
        // everything.
        let default_table = part_tables.len();
        if self.partition.iter().any(|p| p.hm_table.is_none()) {
            part_tables.push(PartHmTable {
                entries: [HmPartEntry::IGNORE; HM_ERROR_COUNT],
            });
        }

        let partitions = self
            .partition
            .iter()
            .map(|p| {
                lower_partition(p, &names, default_table)
                    .with_context(|| format!("partition `{}`", p.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let tasks = self
            .task
            .iter()
            .map(|t| {
                lower_task(t, &names)
                    .with_context(|| format!("task `{}`", t.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let counters: Vec<CounterDesc> = self
            .counter
            .iter()
            .map(|c| CounterDesc {
                cpu: c.cpu,
                kind: c.kind,
                max_allowed_value: c.max_allowed_value,
                ticks_per_base: c.ticks_per_base,
                min_cycle: c.min_cycle,
            })
            .collect();

        let mut alarms = self
            .alarm
            .iter()
            .map(|a| {
                lower_alarm(a, &names)
                    .with_context(|| format!("alarm `{}`", a.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut schedtabs = Vec::with_capacity(self.schedtab.len());
        for (i, s) in self.schedtab.iter().enumerate() {
            let counter = names.counter(&s.counter)?;
            let partition = names.partition(&s.partition)?;
            schedtabs.push(
                lower_schedtab(s, &names, counter, partition, alarms.len())
                    .with_context(|| format!("schedule table `{}`", s.name))?,
            );
            alarms.push(AlarmDesc {
                counter,
                partition,
                action: AlarmAction::SchedTab {
                    schedtab: u16::try_from(i)?,
                },
                autostart: None,
            });
        }

        let wqs = self
            .wq
            .iter()
            .map(|w| {
                Ok(WqDesc {
                    partition: names.partition(&w.partition)?,
                    discipline: w.discipline,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut system_tables = self
            .hm_system_table
            .iter()
            .enumerate()
            .map(|(i, t)| {
                t.lower().with_context(|| {
                    format!(
                        "system HM table {}",
                        t.name.as_deref().unwrap_or(&i.to_string())
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if system_tables.is_empty() {
            system_tables.push(SystemHmTable {
                entries: [HmSysAction::Ignore; HM_ERROR_COUNT],
            });
        }

        let desc = Box::leak(Box::new(AppDesc {
            cpus: leak(cpus),
            partitions: leak(partitions),
            tasks: leak(tasks),
            counters: leak(counters),
            alarms: leak(alarms),
            schedtabs: leak(schedtabs),
            wqs: leak(wqs),
            hm_system_tables: leak(system_tables),
            hm_part_tables: leak(part_tables),
        }));

        Ok(App {
            desc,
            partitions: names.partitions,
            tasks: names.tasks,
            counters: names.counters,
            alarms: names.alarms,
            schedtabs: names.schedtabs,
            wqs: names.wqs,
        })
    }
}

fn lower_partition(
    p: &PartitionConfig,
    names: &Names,
    default_table: usize,
) -> Result<PartDesc> {
    let hm_table = match &p.hm_table {
        Some(t) => resolve(&names.part_tables, "HM table", t)?,
        None => default_table,
    };
    let mut flags = PartFlags::empty();
    flags.set(PartFlags::PRIVILEGED, p.privileged);
    Ok(PartDesc {
        cpu: p.cpu,
        period: p.period,
        initial_mode: p.initial_mode,
        flags,
        hm_table: u8::try_from(hm_table)?,
        init_hook: names.hook(&p.init_hook)?,
        error_hook: names.hook(&p.error_hook)?,
        exception_hook: names.hook(&p.exception_hook)?,
    })
}

fn lower_cpu(c: &CpuConfig) -> CpuDesc {
    let schedules = c
        .schedules
        .iter()
        .map(|s| TpScheduleDesc {
            windows: leak(
                s.iter()
                    .map(|w| TpWindow {
                        duration: w.duration,
                        tp: w.tp,
                    })
                    .collect(),
            ),
        })
        .collect();
    CpuDesc {
        tp_count: c.tp_count,
        schedules: leak(schedules),
        initial_schedule: c.initial_schedule,
    }
}

fn lower_task(t: &TaskConfig, names: &Names) -> Result<TaskDesc> {
    let kind = match (t.kind, t.irq) {
        (TaskKindConfig::Isr, Some(irq)) => TaskKind::Isr { irq },
        (TaskKindConfig::Isr, None) => bail!("ISR task needs an `irq`"),
        (_, Some(_)) => bail!("only ISR tasks take an `irq`"),
        (TaskKindConfig::Task, None) => TaskKind::Task,
        (TaskKindConfig::InitHook, None) => TaskKind::InitHook,
        (TaskKindConfig::ErrorHook, None) => TaskKind::ErrorHook,
        (TaskKindConfig::ExceptionHook, None) => TaskKind::ExceptionHook,
    };
    let mut flags = TaskFlags::empty();
    flags.set(TaskFlags::RPC_SERVER, t.rpc_server);
    Ok(TaskDesc {
        partition: names.partition(&t.partition)?,
        kind,
        priority: Priority(t.priority),
        max_priority: Priority(t.max_priority.unwrap_or(t.priority)),
        max_activations: t.max_activations,
        period: t.period,
        deadline: t.deadline,
        events: t.events,
        tp: t.tp,
        entry_point: t.entry_point,
        initial_stack: t.initial_stack,
        flags,
    })
}

fn lower_alarm(a: &AlarmConfig, names: &Names) -> Result<AlarmDesc> {
    let action = match &a.action {
        AlarmActionConfig::ActivateTask(t) => AlarmAction::ActivateTask {
            task: names.task(t)?,
        },
        AlarmActionConfig::SetEvent { task, mask } => AlarmAction::SetEvent {
            task: names.task(task)?,
            mask: *mask,
        },
        AlarmActionConfig::Hook(t) => AlarmAction::Hook {
            task: names.task(t)?,
        },
        AlarmActionConfig::Callback(id) => AlarmAction::Callback { id: *id },
        AlarmActionConfig::IncrementCounter(c) => {
            AlarmAction::IncrementCounter {
                counter: names.counter(c)?,
            }
        }
    };
    Ok(AlarmDesc {
        counter: names.counter(&a.counter)?,
        partition: names.partition(&a.partition)?,
        action,
        autostart: a.autostart.map(|s| AlarmAutostart {
            increment: s.increment,
            cycle: s.cycle,
        }),
    })
}

/// Compiles the expiry points of `s` into `Start`, per-point actions and
/// budgets, a `Wait` up to each following point, and a closing `Wrap`.
fn lower_schedtab(
    s: &SchedTabConfig,
    names: &Names,
    counter: u16,
    partition: u8,
    alarm: usize,
) -> Result<SchedTabDesc> {
    let points = &s.expiry_point;
    if points.is_empty() {
        bail!("no expiry points");
    }
    for w in points.windows(2) {
        if w[0].offset >= w[1].offset {
            bail!("expiry point offsets must increase");
        }
    }
    if points[points.len() - 1].offset >= s.duration {
        bail!("expiry point at or past the table duration {}", s.duration);
    }

    let mut actions = vec![SchedTabAction::Start];
    if points[0].offset > 0 {
        actions.push(SchedTabAction::Wait {
            ticks: points[0].offset,
        });
    }
    for (i, p) in points.iter().enumerate() {
        for a in &p.actions {
            actions.push(match a {
                ExpiryActionConfig::ActivateTask(t) => SchedTabAction::Task {
                    task: names.task(t)?,
                },
                ExpiryActionConfig::SetEvent { task, mask } => {
                    SchedTabAction::Event {
                        task: names.task(task)?,
                        mask: *mask,
                    }
                }
                ExpiryActionConfig::Hook(t) => SchedTabAction::Hook {
                    task: names.task(t)?,
                },
            });
        }
        if p.max_shorten != 0 {
            actions.push(SchedTabAction::Shorten {
                ticks: p.max_shorten,
            });
        }
        if p.max_lengthen != 0 {
            actions.push(SchedTabAction::Lengthen {
                ticks: p.max_lengthen,
            });
        }
        let end = points.get(i + 1).map_or(s.duration, |n| n.offset);
        actions.push(SchedTabAction::Wait {
            ticks: end - p.offset,
        });
    }
    actions.push(SchedTabAction::Wrap);

    let autostart = s.autostart.map(|a| match a {
        SchedTabAutostartConfig::Relative(offset) => {
            SchedTabAutostart::Relative { offset }
        }
        SchedTabAutostartConfig::Absolute(start) => {
            SchedTabAutostart::Absolute { start }
        }
        SchedTabAutostartConfig::Synchron => SchedTabAutostart::Synchron,
    });

    Ok(SchedTabDesc {
        counter,
        alarm: u16::try_from(alarm)?,
        partition,
        actions: leak(actions),
        duration: s.duration,
        sync: s.sync,
        precision: s.precision,
        repeating: s.repeating,
        autostart,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        [[counter]]
        name = "c"
        max_allowed_value = 99
        [[task]]
        name = "a"
        partition = "p"
        priority = 2
        [[task]]
        name = "b"
        partition = "p"
        priority = 3
        events = 0x10
    "#;

    fn load(extra: &str) -> Result<App> {
        load_str(&format!("{BASE}{extra}"))
    }

    #[test]
    fn defaults_are_filled_in() {
        let app = load("").unwrap();
        let d = app.desc;
        assert_eq!(d.cpus[0].tp_count, 1);
        assert!(d.cpus[0].schedules.is_empty());
        assert_eq!(d.partitions[0].initial_mode, PartMode::ColdStart);
        assert_eq!(d.partitions[0].flags, PartFlags::empty());
        let b = &d.tasks[1];
        assert_eq!((b.priority, b.max_priority), (Priority(3), Priority(3)));
        assert_eq!(b.max_activations, 1);
        assert_eq!(b.kind, TaskKind::Task);
        assert_eq!(d.counters[0].kind, CounterKind::Software);
        assert_eq!(d.counters[0].min_cycle, 1);
        assert_eq!(d.hm_system_tables.len(), 1);
        assert_eq!(
            d.hm_part_tables[usize::from(d.partitions[0].hm_table)].entries,
            [HmPartEntry::IGNORE; HM_ERROR_COUNT]
        );
        assert_eq!(app.task("b"), Some(TaskId(1)));
        assert_eq!(app.task("nope"), None);
    }

    #[test]
    fn schedule_table_compiles_to_actions() {
        let app = load(
            r#"
            [[alarm]]
            name = "user"
            counter = "c"
            partition = "p"
            action = { set_event = { task = "b", mask = 0x10 } }
            [[schedtab]]
            name = "s"
            counter = "c"
            partition = "p"
            duration = 10
            autostart = "synchron"
            [[schedtab.expiry_point]]
            offset = 2
            actions = [{ activate_task = "a" }]
            max_shorten = 1
            [[schedtab.expiry_point]]
            offset = 7
            actions = [{ set_event = { task = "b", mask = 0x10 } }]
            "#,
        )
        .unwrap();
        let s = &app.desc.schedtabs[0];
        let (a, b) = (TaskId(0), TaskId(1));
        assert_eq!(
            s.actions,
            [
                SchedTabAction::Start,
                SchedTabAction::Wait { ticks: 2 },
                SchedTabAction::Task { task: a },
                SchedTabAction::Shorten { ticks: 1 },
                SchedTabAction::Wait { ticks: 5 },
                SchedTabAction::Event { task: b, mask: 0x10 },
                SchedTabAction::Wait { ticks: 3 },
                SchedTabAction::Wrap,
            ]
        );
        assert_eq!(s.autostart, Some(SchedTabAutostart::Synchron));

        // The driving alarm comes after the user's.
        assert_eq!(app.alarm("user"), Some(0));
        assert_eq!(s.alarm, 1);
        assert_eq!(
            app.desc.alarms[1].action,
            AlarmAction::SchedTab { schedtab: 0 }
        );
    }

    #[test]
    fn expiry_points_must_fit_the_table() {
        let table = |points: &str| {
            load(&format!(
                r#"
                [[schedtab]]
                name = "s"
                counter = "c"
                partition = "p"
                duration = 10
                {points}
                "#
            ))
        };
        assert!(table("").is_err());
        assert!(table("[[schedtab.expiry_point]]\noffset = 10").is_err());
        assert!(table(
            "[[schedtab.expiry_point]]\noffset = 4\n\
             [[schedtab.expiry_point]]\noffset = 4"
        )
        .is_err());
        assert!(table("[[schedtab.expiry_point]]\noffset = 0").is_ok());
    }

    #[test]
    fn hm_tables_from_entries_and_packed() {
        let mut packed = vec![0u8; HM_ERROR_COUNT];
        packed[HmErrorId::Watchdog.index()] = 0x80 | 3 << 5;
        let app = load(&format!(
            r#"
            [[hm_partition_table]]
            name = "named"
            entries = {{ DeadlineMissed = {{ code = 0, action = "warm_start" }}, PowerFail = {{ level = "system" }} }}
            [[hm_partition_table]]
            name = "image"
            packed = {packed:?}
            [[hm_system_table]]
            entries = {{ PowerFail = "shutdown" }}
            "#
        ))
        .unwrap();
        let named = &app.desc.hm_part_tables[0];
        assert_eq!(
            named.entry(HmErrorId::DeadlineMissed),
            HmPartEntry {
                level: HmLevel::Partition,
                action: HmPartAction::WarmStart,
                code: Some(TaskErrorCode::DEADLINE_MISSED),
            }
        );
        assert_eq!(named.entry(HmErrorId::PowerFail).level, HmLevel::System);
        assert_eq!(named.entry(HmErrorId::Abort), HmPartEntry::IGNORE);

        let image = &app.desc.hm_part_tables[1];
        assert_eq!(
            image.entry(HmErrorId::Watchdog),
            HmPartEntry {
                level: HmLevel::System,
                action: HmPartAction::ColdStart,
                code: None,
            }
        );
        // `p` names no table, so the ignore-all default was added.
        assert_eq!(app.desc.hm_part_tables.len(), 3);
        assert_eq!(app.desc.partitions[0].hm_table, 2);

        let sys = &app.desc.hm_system_tables[0];
        assert_eq!(sys.action(HmErrorId::PowerFail), HmSysAction::Shutdown);
        assert_eq!(sys.action(HmErrorId::Watchdog), HmSysAction::Ignore);
    }

    #[test]
    fn bad_references_are_reported() {
        let err = load(
            r#"
            [[alarm]]
            name = "x"
            counter = "c"
            partition = "p"
            action = { activate_task = "ghost" }
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown task `ghost`"));

        assert!(load("[[hm_system_table]]\nentries = { Gremlins = \"reset\" }")
            .is_err());
        assert!(load("[[task]]\nname = \"a\"\npartition = \"p\"\npriority = 1")
            .is_err());
        assert!(load(
            "[[task]]\nname = \"i\"\npartition = \"p\"\npriority = 1\nkind = \"isr\""
        )
        .is_err());
        assert!(load("[[partition]]\nname = \"q\"\nbogus = 1").is_err());
    }

    #[test]
    fn packed_table_must_be_complete() {
        assert!(load(
            "[[hm_partition_table]]\nname = \"t\"\npacked = [1, 2, 3]"
        )
        .is_err());
    }
}

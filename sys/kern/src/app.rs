// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application description and its limits.
//!
//! An "application" here is the entire collection of partitions, tasks and
//! time-triggered objects that customize the generic kernel.
//!
//! Most of the interesting types in this module are sourced from the `abi`
//! crate, where they can be shared with app code. The kernel sizes all of its
//! tables by the constants below, and refuses at boot to run a configuration
//! that doesn't fit them or doesn't make sense.

use static_assertions::const_assert;

// Re-export ABI types.
pub use abi::*;

pub const MAX_CPUS: usize = 4;
pub const MAX_PARTS: usize = 16;
pub const MAX_TASKS: usize = 64;
pub const MAX_COUNTERS: usize = 16;
pub const MAX_ALARMS: usize = 64;
pub const MAX_SCHEDTABS: usize = 16;
pub const MAX_WQS: usize = 32;
/// Time partitions per CPU.
pub const MAX_TPS: usize = 8;
/// Depth of each partition's error record ring.
pub const MAX_ERROR_RECORDS: usize = 16;
/// Depth of each CPU's IPI mailbox.
pub const IPI_QUEUE_LEN: usize = 32;
/// Counter increments one top-level increment may set off.
pub const MAX_COUNTER_CASCADE: usize = 32;
pub const TRACE_ENTRIES: usize = 64;
pub const PRIO_WORDS: usize = NUM_PRIOS / 32;

const_assert!(NUM_PRIOS % 32 == 0);
const_assert!(PRIO_WORDS <= 32);
// Task and object indices travel as u16, partitions and CPUs as u8.
const_assert!(MAX_TASKS <= u16::MAX as usize);
const_assert!(MAX_ALARMS <= u16::MAX as usize);
const_assert!(MAX_PARTS <= u8::MAX as usize);
const_assert!(MAX_CPUS <= u8::MAX as usize);
const_assert!(MAX_COUNTERS <= MAX_COUNTER_CASCADE);

/// Checks `app` for consistency. Anything wrong here is a build problem, so
/// this dies rather than reporting.
pub fn check_app(app: &AppDesc) {
    uassert!(!app.cpus.is_empty() && app.cpus.len() <= MAX_CPUS);
    uassert!(app.partitions.len() <= MAX_PARTS);
    uassert!(app.tasks.len() <= MAX_TASKS);
    uassert!(app.counters.len() <= MAX_COUNTERS);
    uassert!(app.alarms.len() <= MAX_ALARMS);
    uassert!(app.schedtabs.len() <= MAX_SCHEDTABS);
    uassert!(app.wqs.len() <= MAX_WQS);
    uassert!(!app.hm_system_tables.is_empty());

    for cpu in app.cpus {
        uassert!(cpu.tp_count >= 1 && usize::from(cpu.tp_count) <= MAX_TPS);
        if !cpu.schedules.is_empty() {
            uassert!(usize::from(cpu.initial_schedule) < cpu.schedules.len());
        }
        for s in cpu.schedules {
            uassert!(!s.windows.is_empty());
            for w in s.windows {
                uassert!(w.duration > 0 && w.tp < cpu.tp_count);
            }
        }
    }

    for (i, p) in app.partitions.iter().enumerate() {
        uassert!(usize::from(p.cpu) < app.cpus.len());
        uassert!(usize::from(p.hm_table) < app.hm_part_tables.len());
        // A warm start needs a cold one first, and booting into NORMAL
        // skips initialization.
        uassert!(p.initial_mode != PartMode::WarmStart);
        uassert!(p.initial_mode != PartMode::Normal || p.init_hook.is_none());
        let hooks = [
            (p.init_hook, TaskKind::InitHook),
            (p.error_hook, TaskKind::ErrorHook),
            (p.exception_hook, TaskKind::ExceptionHook),
        ];
        for (hook, kind) in hooks {
            if let Some(h) = hook {
                let t = &app.tasks[h.index()];
                uassert_eq!(t.kind, kind);
                uassert_eq!(usize::from(t.partition), i);
            }
        }
        if let Some(h) = p.error_hook {
            let max = usize::from(app.tasks[h.index()].max_activations);
            uassert!(max <= MAX_ERROR_RECORDS);
        }
    }

    for t in app.tasks {
        let part = &app.partitions[usize::from(t.partition)];
        uassert!(t.tp < app.cpus[usize::from(part.cpu)].tp_count);
        uassert!(t.priority != Priority::IDLE);
        uassert!(!t.priority.is_more_important_than(t.max_priority));
        // HIGHEST is kept for exception hooks at work.
        uassert!(Priority::HIGHEST.is_more_important_than(t.max_priority));
        uassert!(t.max_activations >= 1);
        match t.kind {
            TaskKind::Isr { .. } => uassert_eq!(t.max_activations, 1),
            TaskKind::InitHook | TaskKind::ExceptionHook => {
                uassert_eq!(t.max_activations, 1)
            }
            TaskKind::Task | TaskKind::ErrorHook => {}
        }
    }

    for c in app.counters {
        uassert!(usize::from(c.cpu) < app.cpus.len());
        uassert!(c.max_allowed_value >= 1);
        uassert!(c.min_cycle <= c.max_allowed_value);
    }

    for a in app.alarms {
        uassert!(usize::from(a.counter) < app.counters.len());
        uassert!(usize::from(a.partition) < app.partitions.len());
        match a.action {
            AlarmAction::ActivateTask { task }
            | AlarmAction::SetEvent { task, .. }
            | AlarmAction::Hook { task } => {
                uassert!(task.index() < app.tasks.len())
            }
            AlarmAction::IncrementCounter { counter } => {
                let c = &app.counters[usize::from(counter)];
                uassert_eq!(c.kind, CounterKind::Software);
            }
            AlarmAction::SchedTab { schedtab } => {
                uassert!(usize::from(schedtab) < app.schedtabs.len())
            }
            AlarmAction::Callback { .. } => {}
        }
        if let Some(auto) = a.autostart {
            let max = app.counters[usize::from(a.counter)].max_allowed_value;
            uassert!(auto.increment >= 1 && auto.increment <= max);
        }
    }

    for (i, s) in app.schedtabs.iter().enumerate() {
        check_schedtab(app, i, s);
    }

    for wq in app.wqs {
        uassert!(usize::from(wq.partition) < app.partitions.len());
    }
}

fn check_schedtab(app: &AppDesc, i: usize, s: &SchedTabDesc) {
    let counter = &app.counters[usize::from(s.counter)];
    let alarm = &app.alarms[usize::from(s.alarm)];
    uassert_eq!(alarm.action, AlarmAction::SchedTab { schedtab: i as u16 });
    uassert_eq!(alarm.counter, s.counter);

    let actions = s.actions;
    uassert!(actions.first() == Some(&SchedTabAction::Start));
    uassert!(actions.last() == Some(&SchedTabAction::Wrap));
    let mut sum = 0u64;
    let mut waits = 0;
    for a in &actions[1..actions.len() - 1] {
        match *a {
            SchedTabAction::Wait { ticks } => {
                uassert!(ticks >= 1 && ticks <= counter.max_allowed_value);
                sum += u64::from(ticks);
                waits += 1;
            }
            SchedTabAction::Start | SchedTabAction::Wrap => {
                crate::fail::die("start or wrap inside a schedule table")
            }
            _ => {}
        }
    }
    uassert!(waits >= 1);
    uassert_eq!(sum, u64::from(s.duration));
    uassert!(s.duration <= counter.max_allowed_value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_configs_pass() {
        let app = build_kconfig::load_str(
            r#"
            [[cpu]]
            [[partition]]
            name = "p"
            [[counter]]
            name = "c"
            max_allowed_value = 9
            [[task]]
            name = "t"
            partition = "p"
            priority = 1
            [[schedtab]]
            name = "s"
            counter = "c"
            partition = "p"
            duration = 4
            [[schedtab.expiry_point]]
            offset = 1
            actions = [{ activate_task = "t" }]
            "#,
        )
        .unwrap();
        check_app(app.desc);
    }

    #[test]
    #[should_panic(expected = "kernel died")]
    fn table_longer_than_counter_is_rejected() {
        let app = build_kconfig::load_str(
            r#"
            [[cpu]]
            [[partition]]
            name = "p"
            [[counter]]
            name = "c"
            max_allowed_value = 9
            [[task]]
            name = "t"
            partition = "p"
            priority = 1
            [[schedtab]]
            name = "s"
            counter = "c"
            partition = "p"
            duration = 12
            [[schedtab.expiry_point]]
            offset = 1
            actions = [{ activate_task = "t" }]
            "#,
        )
        .unwrap();
        check_app(app.desc);
    }
}

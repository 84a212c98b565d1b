// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt service tasks.
//!
//! Each kernel-managed interrupt line is bound to one ISR task. The
//! interrupt activates the task and stays masked at the controller until the
//! task terminates; it is then unmasked again, unless the task's partition
//! has asked for the line to stay masked (`sys_isr_mask`).

use abi::{ErrorCode, HmErrorId, PartMode, TaskId, TaskKind, TaskState};

use crate::arch;
use crate::profiling;
use crate::startup::Kernel;

impl Kernel {
    /// Entry from the interrupt vector for `irq` on `cpu`.
    pub fn isr_entry(&mut self, cpu: usize, irq: u32) {
        profiling::event_isr_enter(irq);
        let owner = (0..self.tasks.len()).find(|&t| {
            self.tasks[t].desc.kind == TaskKind::Isr { irq }
                && self.task_cpu(t) == cpu
        });
        match owner {
            None => {
                arch::disable_irq(irq);
                self.hm_system_error(cpu, HmErrorId::SpuriousInterrupt, irq);
            }
            Some(t) if self.tasks[t].state != TaskState::Suspended => {
                self.hm_async_task_error(
                    cpu,
                    t,
                    HmErrorId::ActivationError,
                    irq,
                );
            }
            Some(t) => self.task_do_activate(t),
        }
        profiling::event_isr_exit();
    }

    fn isr_lookup(
        &self,
        cpu: usize,
        id: TaskId,
    ) -> Result<(usize, u32), ErrorCode> {
        let t = self.task_lookup(cpu, id)?;
        let TaskKind::Isr { irq } = self.tasks[t].desc.kind else {
            return Err(ErrorCode::Id);
        };
        if self.task_cpu(t) != cpu {
            return Err(ErrorCode::Core);
        }
        if t == self.caller(cpu) {
            return Err(ErrorCode::State);
        }
        Ok((t, irq))
    }

    pub fn sys_isr_mask(&mut self, cpu: usize, id: TaskId) -> Result<(), ErrorCode> {
        let (t, irq) = self.isr_lookup(cpu, id)?;
        self.tasks[t].irq_enabled = false;
        arch::disable_irq(irq);
        Ok(())
    }

    /// Re-enables an ISR's line. The line only opens at the controller once
    /// the ISR is idle and its partition is in NORMAL.
    pub fn sys_isr_unmask(
        &mut self,
        cpu: usize,
        id: TaskId,
    ) -> Result<(), ErrorCode> {
        let (t, irq) = self.isr_lookup(cpu, id)?;
        self.tasks[t].irq_enabled = true;
        if self.tasks[t].state == TaskState::Suspended
            && self.parts[self.task_part(t)].mode == PartMode::Normal
        {
            arch::enable_irq(irq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{irq_enabled, with_board};
    use crate::testutil::*;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        error_hook = "eh"
        hm_table = "t"
        [[hm_partition_table]]
        name = "t"
        entries = { ActivationError = { code = 1 } }
        [[hm_system_table]]
        entries = { SpuriousInterrupt = "ignore" }
        [[task]]
        name = "eh"
        partition = "p"
        kind = "error_hook"
        priority = 40
        max_activations = 2
        [[task]]
        name = "uart"
        partition = "p"
        kind = "isr"
        irq = 7
        priority = 30
        [[task]]
        name = "main"
        partition = "p"
        priority = 3
    "#;

    #[test]
    fn interrupt_masks_line_until_isr_terminates() {
        let (mut k, app) = boot(APP);
        let uart = app.task("uart");
        assert!(irq_enabled(7));
        k.isr_entry(0, 7);
        assert!(!irq_enabled(7));
        k.schedule(0);
        assert_eq!(k.current(0), Some(uart));
        k.sys_task_terminate(0).unwrap();
        assert!(irq_enabled(7));
    }

    #[test]
    fn isr_cannot_mask_itself() {
        let (mut k, app) = boot(APP);
        let uart = app.task("uart");
        k.isr_entry(0, 7);
        k.schedule(0);
        assert_eq!(k.current(0), Some(uart));
        assert_eq!(k.sys_isr_mask(0, uart), Err(ErrorCode::State));
        assert!(k.task(uart).irq_enabled());

        // The refused request leaves the line to be reopened on exit.
        k.sys_task_terminate(0).unwrap();
        assert!(irq_enabled(7));
    }

    #[test]
    fn masked_line_stays_closed_after_termination() {
        let (mut k, app) = boot(APP);
        let uart = app.task("uart");
        run(&mut k, 0, app.task("main"));
        k.sys_isr_mask(0, uart).unwrap();
        assert!(!irq_enabled(7));
        assert_eq!(
            k.sys_isr_mask(0, app.task("main")),
            Err(ErrorCode::Id)
        );
        k.sys_isr_unmask(0, uart).unwrap();
        assert!(irq_enabled(7));
    }

    #[test]
    fn second_interrupt_while_active_is_an_activation_error() {
        let (mut k, app) = boot(APP);
        let uart = app.task("uart");
        k.isr_entry(0, 7);
        k.isr_entry(0, 7);
        let rec = k.part(0).error_records().next().unwrap();
        assert_eq!(rec.task, uart);
        assert_eq!(rec.error, HmErrorId::ActivationError);
        assert_eq!(rec.extra, 7);
    }

    #[test]
    fn unknown_line_is_spurious() {
        let (mut k, _app) = boot(APP);
        k.isr_entry(0, 99);
        assert_eq!(with_board(|b| b.halted), None);
        assert!(k.trace().iter().any(|e| matches!(
            e.payload,
            crate::trace::Trace::HmSystem {
                error: HmErrorId::SpuriousInterrupt,
                ..
            }
        )));
    }
}

//! Round-robin scheduling on the timer tick.
//!
//! Every loaded process is always runnable. On each tick the interrupted
//! state is written back into the current control block, and the next
//! process in table order is dispatched.

use x86_64::{registers::rflags::RFlags, structures::gdt::SegmentSelector, PrivilegeLevel};

use crate::interrupts::{gdt::TaskStateSegment, trap::TrapFrame};

use super::{
    process::{Pid, ProcessControlBlock, ProcessTable},
    registers::KernelStack,
};

/// Everything the switch trampoline needs to enter a process.
///
/// Field offsets are used by `switch_to` and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SwitchFrame {
    pub cr3: u32,
    /// Stack the trampoline runs on before `iretd`.
    pub kernel_ss: u32,
    pub kernel_esp: u32,
    /// Non-zero when returning to ring 3.
    pub user_mode: u32,
    pub user_ss: u32,
    pub user_esp: u32,
    pub eflags: u32,
    pub cs: u32,
    pub eip: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

/// A decision to transfer control to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub target: Pid,
    pub frame: SwitchFrame,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    ticks: u64,
    switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ticks: 0,
            switches: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Handle one timer tick.
    ///
    /// `frame` is the state of the interrupted code and `tss` the active
    /// task state. Returns the switch to perform, or `None` to resume the
    /// interrupted code.
    pub fn on_tick(
        &mut self,
        table: &mut ProcessTable,
        frame: &TrapFrame,
        tss: &mut TaskStateSegment,
    ) -> Option<Switch> {
        self.ticks += 1;

        let Some(current) = table.current() else {
            if table.is_empty() {
                return None;
            }
            return self.dispatch(table, 0, tss);
        };

        if table.len() <= 1 {
            return None;
        }

        let process = table.get_mut(current)?;
        capture(process, frame, tss);

        let next = (current + 1) % table.len();
        log::trace!(target: "sched", "tick {}: {} -> {}", self.ticks, current, next);
        self.dispatch(table, next, tss)
    }

    /// Make `pid` current: install its kernel stack in the TSS and build
    /// the frame that enters it.
    pub fn dispatch(
        &mut self,
        table: &mut ProcessTable,
        pid: Pid,
        tss: &mut TaskStateSegment,
    ) -> Option<Switch> {
        let process = table.get(pid)?;
        tss.ss0 = process.kernel_stack.ss0.0 as u32;
        tss.esp0 = process.kernel_stack.esp0;
        let frame = switch_frame(process);

        table.set_current(Some(pid));
        self.switches += 1;
        log::debug!(
            target: "sched",
            "dispatch pid {} at {:#010x} ({})",
            pid,
            frame.eip,
            if frame.user_mode != 0 { "user" } else { "kernel" }
        );
        Some(Switch { target: pid, frame })
    }
}

/// Copy the interrupted state into `process`.
fn capture(process: &mut ProcessControlBlock, frame: &TrapFrame, tss: &TaskStateSegment) {
    let regs = &mut process.registers;
    regs.eax = frame.eax;
    regs.ebx = frame.ebx;
    regs.ecx = frame.ecx;
    regs.edx = frame.edx;
    regs.esi = frame.esi;
    regs.edi = frame.edi;
    regs.ebp = frame.ebp;
    regs.eip = frame.eip;
    regs.eflags = frame.eflags;
    regs.cs = frame.code_selector();
    regs.ds = selector(frame.ds);
    regs.es = selector(frame.es);
    regs.fs = selector(frame.fs);
    regs.gs = selector(frame.gs);

    if frame.from_user() {
        regs.esp = frame.user_esp;
        regs.ss = selector(frame.user_ss);
    } else {
        // interrupted inside the kernel, e.g. during a system call
        regs.esp = frame.kernel_esp();
        regs.ss = selector(tss.ss0);
    }

    process.kernel_stack = KernelStack::new(selector(tss.ss0), tss.esp0);
}

fn switch_frame(process: &ProcessControlBlock) -> SwitchFrame {
    let regs = &process.registers;
    let user_mode = regs.cs.rpl() == PrivilegeLevel::Ring3;
    let (kernel_ss, kernel_esp) = if user_mode {
        (process.kernel_stack.ss0.0 as u32, process.kernel_stack.esp0)
    } else {
        (regs.ss.0 as u32, regs.esp)
    };

    let eflags = (regs.eflags | RFlags::INTERRUPT_FLAG.bits() as u32)
        & !(RFlags::NESTED_TASK.bits() as u32);

    SwitchFrame {
        cr3: regs.cr3,
        kernel_ss,
        kernel_esp,
        user_mode: user_mode as u32,
        user_ss: regs.ss.0 as u32,
        user_esp: regs.esp,
        eflags,
        cs: regs.cs.0 as u32,
        eip: regs.eip,
        ds: regs.ds.0 as u32,
        es: regs.es.0 as u32,
        fs: regs.fs.0 as u32,
        gs: regs.gs.0 as u32,
        eax: regs.eax,
        ebx: regs.ebx,
        ecx: regs.ecx,
        edx: regs.edx,
        esi: regs.esi,
        edi: regs.edi,
        ebp: regs.ebp,
    }
}

fn selector(raw: u32) -> SegmentSelector {
    SegmentSelector(raw as u16)
}

/// Enter the process described by `frame`.
///
/// Loads its directory and stack, builds an interrupt return frame (with
/// the user stack when going back to ring 3), restores every register and
/// executes `iretd`.
///
/// # Safety
///
/// `frame` must describe a valid process whose directory maps the kernel
/// and whose stack is writable. `frame` itself must stay mapped under the
/// new directory and must not lie on the target stack.
#[cfg(target_arch = "x86")]
pub unsafe fn switch_to(frame: &SwitchFrame) -> ! {
    core::arch::asm!(
        "mov eax, [ecx]",
        "mov cr3, eax",
        "mov eax, [ecx + 4]",
        "mov ss, ax",
        "mov esp, [ecx + 8]",
        "cmp dword ptr [ecx + 12], 0",
        "je 2f",
        "push dword ptr [ecx + 16]",
        "push dword ptr [ecx + 20]",
        "2:",
        "push dword ptr [ecx + 24]",
        "push dword ptr [ecx + 28]",
        "push dword ptr [ecx + 32]",
        "mov eax, [ecx + 36]",
        "mov ds, ax",
        "mov eax, [ecx + 40]",
        "mov es, ax",
        "mov eax, [ecx + 44]",
        "mov fs, ax",
        "mov eax, [ecx + 48]",
        "mov gs, ax",
        "mov eax, [ecx + 52]",
        "mov ebx, [ecx + 56]",
        "mov edx, [ecx + 64]",
        "mov esi, [ecx + 68]",
        "mov edi, [ecx + 72]",
        "mov ebp, [ecx + 76]",
        "mov ecx, [ecx + 60]",
        "iretd",
        in("ecx") frame as *const SwitchFrame,
        options(noreturn)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::gdt::{
            KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, KERNEL_STACK_SELECTOR, USER_CODE_SELECTOR,
            USER_DATA_SELECTOR, USER_STACK_SELECTOR,
        },
        processes::process::tests::dummy,
    };
    use core::mem::offset_of;

    fn user_process(pid: Pid) -> ProcessControlBlock {
        let mut process = dummy(pid);
        let directory = process.frames.directory.as_u32();
        let regs = &mut process.registers;
        regs.cs = USER_CODE_SELECTOR;
        regs.ds = USER_DATA_SELECTOR;
        regs.es = USER_DATA_SELECTOR;
        regs.fs = USER_DATA_SELECTOR;
        regs.gs = USER_DATA_SELECTOR;
        regs.ss = USER_STACK_SELECTOR;
        regs.eip = 0x4000_0000;
        regs.esp = 0x4000_2000;
        regs.eflags = 0x202;
        regs.cr3 = directory;
        process
    }

    fn table_of(count: usize) -> ProcessTable {
        let mut table = ProcessTable::new();
        for pid in 0..count {
            table.push(user_process(pid)).unwrap();
        }
        table
    }

    fn user_frame(eip: u32) -> TrapFrame {
        TrapFrame {
            cs: 0x23,
            ds: 0x2B,
            es: 0x2B,
            fs: 0x2B,
            gs: 0x2B,
            eip,
            eflags: 0x246,
            user_esp: 0x4000_1F00,
            user_ss: 0x33,
            eax: 1,
            ebx: 2,
            ecx: 3,
            edx: 4,
            esi: 5,
            edi: 6,
            ebp: 7,
            esp: 0x5F_0FC0,
        }
    }

    #[test]
    fn test_switch_frame_offsets() {
        assert_eq!(offset_of!(SwitchFrame, kernel_esp), 8);
        assert_eq!(offset_of!(SwitchFrame, user_mode), 12);
        assert_eq!(offset_of!(SwitchFrame, eflags), 24);
        assert_eq!(offset_of!(SwitchFrame, eip), 32);
        assert_eq!(offset_of!(SwitchFrame, gs), 48);
        assert_eq!(offset_of!(SwitchFrame, ecx), 60);
        assert_eq!(offset_of!(SwitchFrame, ebp), 76);
    }

    #[test]
    fn test_empty_table_never_switches() {
        let mut scheduler = Scheduler::new();
        let mut table = ProcessTable::new();
        let mut tss = TaskStateSegment::new();
        assert_eq!(scheduler.on_tick(&mut table, &TrapFrame::default(), &mut tss), None);
        assert_eq!(scheduler.ticks(), 1);
    }

    #[test]
    fn test_cold_start_dispatches_first() {
        let mut scheduler = Scheduler::new();
        let mut table = table_of(1);
        let mut tss = TaskStateSegment::new();

        let switch = scheduler
            .on_tick(&mut table, &TrapFrame::default(), &mut tss)
            .unwrap();
        assert_eq!(switch.target, 0);
        assert_eq!(table.current(), Some(0));
        assert_eq!(tss.esp0, table.get(0).unwrap().kernel_stack.esp0);
        assert_eq!(tss.ss0, 0x18);

        // a single process keeps running
        let frame = user_frame(0x4000_0010);
        assert_eq!(scheduler.on_tick(&mut table, &frame, &mut tss), None);
        assert_eq!(table.current(), Some(0));
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let mut scheduler = Scheduler::new();
        let mut table = table_of(4);
        let mut tss = TaskStateSegment::new();

        let mut visited = [0usize; 4];
        for tick in 0..8 {
            let frame = user_frame(0x4000_0000 + tick);
            let switch = scheduler.on_tick(&mut table, &frame, &mut tss).unwrap();
            visited[switch.target] += 1;
            if tick == 3 {
                assert_eq!(visited, [1, 1, 1, 1]);
            }
        }
        assert_eq!(visited, [2, 2, 2, 2]);
    }

    #[test]
    fn test_user_frame_captured() {
        let mut scheduler = Scheduler::new();
        let mut table = table_of(2);
        let mut tss = TaskStateSegment::new();
        scheduler.on_tick(&mut table, &TrapFrame::default(), &mut tss);
        let esp0 = tss.esp0;

        let frame = user_frame(0x4000_0123);
        let switch = scheduler.on_tick(&mut table, &frame, &mut tss).unwrap();
        assert_eq!(switch.target, 1);

        let saved = table.get(0).unwrap();
        let regs = &saved.registers;
        assert_eq!(regs.eip, 0x4000_0123);
        assert_eq!(regs.eflags, 0x246);
        assert_eq!((regs.eax, regs.ebx, regs.ecx, regs.edx), (1, 2, 3, 4));
        assert_eq!((regs.esi, regs.edi, regs.ebp), (5, 6, 7));
        assert_eq!(regs.esp, 0x4000_1F00);
        assert_eq!(regs.ss, USER_STACK_SELECTOR);
        assert_eq!(regs.ds, USER_DATA_SELECTOR);
        assert_eq!(saved.kernel_stack.esp0, esp0);
        assert_eq!(saved.kernel_stack.ss0, KERNEL_STACK_SELECTOR);

        // the TSS now belongs to process 1
        assert_eq!(tss.esp0, table.get(1).unwrap().kernel_stack.esp0);
    }

    #[test]
    fn test_kernel_frame_captured() {
        let mut scheduler = Scheduler::new();
        let mut table = table_of(2);
        let mut tss = TaskStateSegment::new();
        scheduler.on_tick(&mut table, &TrapFrame::default(), &mut tss);

        let frame = TrapFrame {
            cs: KERNEL_CODE_SELECTOR.0 as u32,
            ds: KERNEL_DATA_SELECTOR.0 as u32,
            eip: 0x1234,
            esp: 0x50_0F00,
            ..TrapFrame::default()
        };
        scheduler.on_tick(&mut table, &frame, &mut tss).unwrap();

        let regs = table.get(0).unwrap().registers;
        assert_eq!(regs.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(regs.esp, 0x50_0F0C);
        assert_eq!(regs.ss, KERNEL_STACK_SELECTOR);
    }

    #[test]
    fn test_user_switch_frame() {
        let mut scheduler = Scheduler::new();
        let mut table = table_of(1);
        let mut tss = TaskStateSegment::new();
        table.get_mut(0).unwrap().registers.eflags = 0x4002;

        let switch = scheduler
            .on_tick(&mut table, &TrapFrame::default(), &mut tss)
            .unwrap();
        let process = table.get(0).unwrap();
        let frame = switch.frame;
        assert_eq!(frame.user_mode, 1);
        assert_eq!(frame.kernel_ss, 0x18);
        assert_eq!(frame.kernel_esp, process.kernel_stack.esp0);
        assert_eq!(frame.user_ss, 0x33);
        assert_eq!(frame.user_esp, 0x4000_2000);
        assert_eq!(frame.cs, 0x23);
        assert_eq!(frame.eip, 0x4000_0000);
        assert_eq!(frame.cr3, process.frames.directory.as_u32());
        // IF forced on, NT cleared
        assert_eq!(frame.eflags, 0x202);
    }

    #[test]
    fn test_kernel_switch_frame_uses_saved_stack() {
        let mut scheduler = Scheduler::new();
        let mut table = ProcessTable::new();
        let mut process = user_process(0);
        process.registers.cs = KERNEL_CODE_SELECTOR;
        process.registers.ss = KERNEL_STACK_SELECTOR;
        process.registers.esp = 0x50_0E00;
        table.push(process).unwrap();
        let mut tss = TaskStateSegment::new();

        let frame = scheduler
            .on_tick(&mut table, &TrapFrame::default(), &mut tss)
            .unwrap()
            .frame;
        assert_eq!(frame.user_mode, 0);
        assert_eq!(frame.kernel_ss, 0x18);
        assert_eq!(frame.kernel_esp, 0x50_0E00);
    }
}

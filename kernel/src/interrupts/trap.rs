//! The timer interrupt path.
//!
//! The entry stub saves the general purpose registers with `pushad`, then
//! the data segment registers, and hands the scheduler a pointer to the
//! resulting [`TrapFrame`].

use x86_64::{structures::gdt::SegmentSelector, PrivilegeLevel};

/// Registers as the timer entry stub leaves them on the kernel stack,
/// lowest address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `esp` as `pushad` saw it: the address of `eip` below.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only pushed by the CPU when the interrupt came from ring 3.
    pub user_esp: u32,
    pub user_ss: u32,
}

impl TrapFrame {
    pub fn code_selector(&self) -> SegmentSelector {
        SegmentSelector(self.cs as u16)
    }

    /// Whether the interrupted code ran in ring 3.
    pub fn from_user(&self) -> bool {
        self.code_selector().rpl() == PrivilegeLevel::Ring3
    }

    /// Stack pointer of the interrupted code, when it ran in ring 0:
    /// just above the `eip`, `cs`, `eflags` pushed by the CPU.
    pub fn kernel_esp(&self) -> u32 {
        self.esp + 12
    }
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".global timer_interrupt_entry",
    "timer_interrupt_entry:",
    "pushad",
    "push ds",
    "push es",
    "push fs",
    "push gs",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "cld",
    "push esp",
    "call timer_tick",
    "add esp, 4",
    "pop gs",
    "pop fs",
    "pop es",
    "pop ds",
    "popad",
    "iretd",
);

#[cfg(target_arch = "x86")]
extern "C" {
    /// Address to install in the IDT timer gate.
    pub fn timer_interrupt_entry();
}

#[cfg(target_arch = "x86")]
fn end_of_interrupt() {
    use crate::constants::ports::{PIC1_COMMAND, PIC_EOI};
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") PIC1_COMMAND,
            in("al") PIC_EOI,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Called by the entry stub on every timer tick, with interrupts masked.
///
/// Returns normally when no switch is needed; otherwise control moves to
/// the selected process and never comes back here.
///
/// # Safety
///
/// `frame` must point at the frame the entry stub just built.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub unsafe extern "C" fn timer_tick(frame: *mut TrapFrame) {
    let switch = {
        let mut kernel = crate::init::KERNEL.lock();
        match (kernel.as_mut(), frame.as_ref()) {
            (Some(kernel), Some(frame)) => kernel.on_timer_tick(frame),
            _ => None,
        }
    };
    end_of_interrupt();

    if let Some(switch) = switch {
        crate::processes::scheduler::switch_to(&switch.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_layout_matches_stub() {
        assert_eq!(size_of::<TrapFrame>(), 17 * 4);
        assert_eq!(offset_of!(TrapFrame, ds), 12);
        assert_eq!(offset_of!(TrapFrame, edi), 16);
        assert_eq!(offset_of!(TrapFrame, eax), 44);
        assert_eq!(offset_of!(TrapFrame, eip), 48);
        assert_eq!(offset_of!(TrapFrame, user_ss), 64);
    }

    #[test]
    fn test_privilege_of_interrupted_code() {
        let user = TrapFrame {
            cs: 0x23,
            ..TrapFrame::default()
        };
        let kernel = TrapFrame {
            cs: 0x08,
            esp: 0x1FF0,
            ..TrapFrame::default()
        };
        assert!(user.from_user());
        assert!(!kernel.from_user());
        assert_eq!(kernel.kernel_esp(), 0x1FFC);
    }
}

//! Translation cache maintenance. Single core, so no shootdown is needed.

use super::VirtAddr;

/// Invalidate the cached translation for the page containing `vaddr`.
#[cfg(target_arch = "x86")]
pub fn flush(vaddr: VirtAddr) {
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) vaddr.as_u32(),
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(not(target_arch = "x86"))]
pub fn flush(_vaddr: VirtAddr) {}

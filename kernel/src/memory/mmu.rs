//! The boundary between the paging code and the processor.

use super::{PageTable, PhysAddr, VirtAddr};

/// Access to the paging hardware.
///
/// Everything the paging manager does to the machine goes through this
/// trait: reading or writing a page of kernel-visible memory, installing
/// the directory root, turning paging on, and invalidating translations.
pub trait Mmu {
    /// The page at `addr` as seen by the kernel right now.
    ///
    /// Before paging is enabled this is physical memory. Returns `None`
    /// when `addr` is not page aligned or cannot be reached.
    fn page(&mut self, addr: VirtAddr) -> Option<&mut PageTable>;

    /// Install `directory` as the paging root (CR3).
    fn load_directory(&mut self, directory: PhysAddr);

    /// Set CR0.PG.
    fn enable_paging(&mut self);

    /// Invalidate the translation of a single page.
    fn flush(&mut self, addr: VirtAddr);
}

/// The real MMU of the running processor.
#[cfg(target_arch = "x86")]
pub struct HardwareMmu {
    _private: (),
}

#[cfg(target_arch = "x86")]
impl HardwareMmu {
    /// # Safety
    ///
    /// Only one `HardwareMmu` may exist, and the caller must be running
    /// in ring 0.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86")]
impl Mmu for HardwareMmu {
    fn page(&mut self, addr: VirtAddr) -> Option<&mut PageTable> {
        if !addr.is_page_aligned() {
            return None;
        }
        // The paging manager only hands out addresses it has just mapped,
        // or identity-mapped kernel frames.
        unsafe { (addr.as_u32() as usize as *mut PageTable).as_mut() }
    }

    fn load_directory(&mut self, directory: PhysAddr) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) directory.as_u32(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn enable_paging(&mut self) {
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr0",
                "or {tmp}, 0x80000000",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags)
            );
        }
    }

    fn flush(&mut self, addr: VirtAddr) {
        super::tlb::flush(addr);
    }
}

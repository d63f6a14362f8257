//! Boot-time bring-up on the kernel target.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    constants::memory::{HEAP_SIZE, HEAP_START},
    idle_loop,
    interrupts::gdt,
    kernel::Kernel,
    logging,
    memory::{mmu::HardwareMmu, HeapOptions},
    sync::IrqMutex,
};

/// The one kernel context. Holding the lock keeps interrupts masked.
pub static KERNEL: IrqMutex<Option<Kernel<HardwareMmu, &'static mut [u8]>>> =
    IrqMutex::new(None);

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

/// Routes `alloc` through the kernel arena once [`init`] has run.
///
/// Requests aligned above the arena's 4 bytes, and any request made before
/// boot or while `KERNEL` is held, get a null pointer.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(mut slot) = KERNEL.try_lock() else {
            return ptr::null_mut();
        };
        slot.as_mut()
            .and_then(|kernel| kernel.heap_mut().allocate_layout(layout).ok())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let (Some(ptr), Some(mut slot)) = (NonNull::new(ptr), KERNEL.try_lock()) else {
            return;
        };
        if let Some(kernel) = slot.as_mut() {
            // the heap logs the rejected free
            let _ = kernel.deallocate(ptr);
        }
    }
}

/// Build the kernel context and install the GDT and TSS.
///
/// Called once by the boot stub with interrupts masked. Halts when memory
/// management cannot be brought up.
pub fn init() {
    logging::init();
    log::info!(target: "mm", "booting");

    // Safety: this is the only MMU handle, and the arena lies in the range
    // bootstrap reserves and identity maps.
    let mmu = unsafe { HardwareMmu::new() };
    let arena =
        unsafe { core::slice::from_raw_parts_mut(HEAP_START as usize as *mut u8, HEAP_SIZE) };

    let kernel = match Kernel::boot(mmu, arena, HeapOptions::default()) {
        Ok(kernel) => kernel,
        Err(err) => {
            log::error!(target: "mm", "boot failed: {}", err);
            idle_loop();
        }
    };

    let mut slot = KERNEL.lock();
    let kernel = slot.insert(kernel);
    let tss = kernel.tss() as *const _ as u32;
    // Safety: the TSS lives inside KERNEL and never moves again.
    unsafe { gdt::init(tss) };
}

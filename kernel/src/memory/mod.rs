//! Memory management: physical frames, two-level paging, the kernel arena
//! and the page heap.

pub mod bitmap_frame_allocator;
pub mod heap;
pub mod mmu;
pub mod page_heap;
pub mod paging;
pub mod tlb;

#[cfg(test)]
pub(crate) mod simulated;

use core::fmt;

use crate::constants::memory::{PAGE_MASK, PAGE_SIZE, TABLE_ENTRIES};

pub use bitmap_frame_allocator::{FrameAllocator, FrameError};
pub use heap::{HeapError, HeapOptions, HeapStats, KernelHeap};
pub use mmu::Mmu;
pub use page_heap::{PageAllocation, PageHeap, PageHeapError};
pub use paging::{PageTable, PageTableEntry, PagingError, PagingManager};

/// A 32-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// A 32-bit virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        PhysAddr(addr)
    }

    /// Physical address of frame number `index`.
    pub const fn from_frame_index(index: usize) -> Self {
        PhysAddr(index as u32 * PAGE_SIZE)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn frame_index(self) -> usize {
        (self.0 / PAGE_SIZE) as usize
    }

    pub const fn align_down(self) -> Self {
        PhysAddr(self.0 & PAGE_MASK)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & !PAGE_MASK == 0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        PhysAddr(self.0 + bytes)
    }
}

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the page directory.
    pub const fn directory_index(self) -> usize {
        ((self.0 >> 22) as usize) & (TABLE_ENTRIES - 1)
    }

    /// Index into the page table.
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) as usize) & (TABLE_ENTRIES - 1)
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & !PAGE_MASK
    }

    pub const fn align_down(self) -> Self {
        VirtAddr(self.0 & PAGE_MASK)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        VirtAddr(self.0 + bytes)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE as usize)
}

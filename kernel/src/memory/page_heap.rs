//! Whole-page allocations for the kernel.
//!
//! Zone `i` is always mapped at `PAGE_HEAP_START + i * PAGE_SIZE`, so
//! finding the zone of an address on release is plain arithmetic.

use core::fmt;

use crate::constants::memory::{PAGE_HEAP_END, PAGE_HEAP_ENTRIES, PAGE_HEAP_START, PAGE_SIZE};

use super::{
    paging::{kernel_flags, PagingError},
    FrameAllocator, Mmu, PagingManager, PhysAddr, VirtAddr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHeapError {
    /// Every zone is bound to a frame.
    Full,
    FramesExhausted,
    /// The address is not the start of a page-heap zone.
    InvalidAddress(VirtAddr),
    AlreadyFree(VirtAddr),
    /// The page heap's page table is not reachable.
    TableMissing,
}

impl fmt::Display for PageHeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageHeapError::Full => write!(f, "page heap is full"),
            PageHeapError::FramesExhausted => write!(f, "no frame for a page-heap zone"),
            PageHeapError::InvalidAddress(addr) => write!(f, "{} is not a page-heap page", addr),
            PageHeapError::AlreadyFree(addr) => write!(f, "page {} is already free", addr),
            PageHeapError::TableMissing => write!(f, "page heap table is not mapped"),
        }
    }
}

/// A page handed out by the page heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocation {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
}

pub struct PageHeap {
    zones: [Option<PhysAddr>; PAGE_HEAP_ENTRIES],
}

impl PageHeap {
    /// A page heap with no zones in use and no table behind it.
    pub const fn empty() -> Self {
        Self {
            zones: [None; PAGE_HEAP_ENTRIES],
        }
    }

    /// Install the page table covering the zones, taken straight from the
    /// frame allocator. Zone mappings never need a new table after this.
    pub fn init<M: Mmu>(
        paging: &mut PagingManager<M>,
        frames: &mut FrameAllocator,
    ) -> Result<Self, PagingError> {
        let start = VirtAddr::new(PAGE_HEAP_START);
        if paging.entry_slot(start)?.is_none() {
            let table = frames
                .acquire_frame()
                .map_err(|_| PagingError::FramesExhausted)?;
            if let Err(err) = paging.install_table(start.directory_index(), table, kernel_flags())
            {
                let _ = frames.release_frame(table);
                return Err(err);
            }
            log::debug!(target: "page_heap", "zone table at {}", table);
        }

        log::info!(
            target: "page_heap",
            "{} zones at {}..{}",
            PAGE_HEAP_ENTRIES,
            start,
            VirtAddr::new(PAGE_HEAP_END)
        );
        Ok(Self::empty())
    }

    pub fn acquire_page<M: Mmu>(
        &mut self,
        paging: &mut PagingManager<M>,
        frames: &mut FrameAllocator,
    ) -> Result<PageAllocation, PageHeapError> {
        let Some(index) = self.zones.iter().position(Option::is_none) else {
            log::warn!(target: "page_heap", "no free zone");
            return Err(PageHeapError::Full);
        };

        let phys = frames
            .acquire_frame()
            .map_err(|_| PageHeapError::FramesExhausted)?;
        let virt = Self::zone_address(index);

        if let Err(err) = paging.map_existing(virt, phys, kernel_flags()) {
            log::error!(target: "page_heap", "cannot map zone {}: {}", index, err);
            let _ = frames.release_frame(phys);
            return Err(PageHeapError::TableMissing);
        }

        self.zones[index] = Some(phys);
        log::trace!(target: "page_heap", "zone {} -> {}", index, phys);
        Ok(PageAllocation { virt, phys })
    }

    /// Unmap a zone and give its frame back.
    ///
    /// Releasing a zone that is already free is reported and changes nothing.
    pub fn release_page<M: Mmu>(
        &mut self,
        vaddr: VirtAddr,
        paging: &mut PagingManager<M>,
        frames: &mut FrameAllocator,
    ) -> Result<(), PageHeapError> {
        let index = Self::zone_index(vaddr).ok_or_else(|| {
            log::warn!(target: "page_heap", "release of {} outside the page heap", vaddr);
            PageHeapError::InvalidAddress(vaddr)
        })?;
        let phys = self.zones[index].ok_or_else(|| {
            log::warn!(target: "page_heap", "page {} already free", vaddr);
            PageHeapError::AlreadyFree(vaddr)
        })?;

        paging
            .unmap(vaddr)
            .map_err(|_| PageHeapError::TableMissing)?;
        let _ = frames.release_frame(phys);
        self.zones[index] = None;

        log::trace!(target: "page_heap", "zone {} released", index);
        Ok(())
    }

    pub const fn zone_address(index: usize) -> VirtAddr {
        VirtAddr::new(PAGE_HEAP_START + index as u32 * PAGE_SIZE)
    }

    /// Zone that starts at `vaddr`.
    pub fn zone_index(vaddr: VirtAddr) -> Option<usize> {
        let addr = vaddr.as_u32();
        if !(PAGE_HEAP_START..PAGE_HEAP_END).contains(&addr) || !vaddr.is_page_aligned() {
            return None;
        }
        Some(((addr - PAGE_HEAP_START) / PAGE_SIZE) as usize)
    }

    pub fn zone(&self, index: usize) -> Option<PhysAddr> {
        self.zones.get(index).copied().flatten()
    }

    pub fn used_zones(&self) -> usize {
        self.zones.iter().filter(|zone| zone.is_some()).count()
    }
}

impl Default for PageHeap {
    fn default() -> Self {
        Self::empty()
    }
}

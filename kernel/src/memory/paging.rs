//! Two-level 32-bit paging.
//!
//! The kernel directory maps itself in its last slot, so once recursive
//! mapping is on every table of the active directory is reachable at
//! `RECURSIVE_TABLES + index * PAGE_SIZE` and the directory itself at
//! `RECURSIVE_DIRECTORY`.

use core::{
    fmt,
    ops::{Index, IndexMut},
};

use x86_64::structures::paging::PageTableFlags;

use crate::constants::memory::{
    HARDWARE_RESERVED_END, HARDWARE_RESERVED_START, HEAP_SIZE, HEAP_START, IDENTITY_MAP_END,
    KERNEL_IMAGE_END, KERNEL_IMAGE_START, PAGE_MASK, PAGE_SIZE, RECURSIVE_DIRECTORY,
    RECURSIVE_SLOT, RECURSIVE_TABLES, SCRATCH_PAGE, TABLE_ENTRIES, USER_OFFSET,
};

use super::{
    page_heap::{PageHeap, PageHeapError},
    FrameAllocator, Mmu, PhysAddr, VirtAddr,
};

// entry flags live in the low 12 bits of a 32-bit entry
const FLAG_BITS: u32 = !PAGE_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// No physical frame for a paging structure.
    FramesExhausted,
    /// A new page table could not be taken from the page heap.
    PageHeap(PageHeapError),
    /// The operation walks the recursive windows, which are not set up yet.
    RecursiveMappingDisabled,
    /// The page at this address cannot be reached by the kernel.
    NotAccessible(VirtAddr),
    /// The address is not page aligned.
    Misaligned(u32),
    /// A user image of this many bytes does not fit one user page table.
    ImageTooLarge(usize),
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingError::FramesExhausted => write!(f, "no frame left for paging structures"),
            PagingError::PageHeap(err) => write!(f, "page table allocation failed: {}", err),
            PagingError::RecursiveMappingDisabled => write!(f, "recursive mapping is not enabled"),
            PagingError::NotAccessible(addr) => write!(f, "page {} is not accessible", addr),
            PagingError::Misaligned(addr) => write!(f, "address {:#x} is not page aligned", addr),
            PagingError::ImageTooLarge(size) => {
                write!(f, "image of {} bytes does not fit the user window", size)
            }
        }
    }
}

impl From<PageHeapError> for PagingError {
    fn from(err: PageHeapError) -> Self {
        PagingError::PageHeap(err)
    }
}

/// A directory or table entry: frame address in the top 20 bits, flags below.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysAddr, flags: PageTableFlags) -> Self {
        PageTableEntry(frame.align_down().as_u32() | (flags.bits() as u32 & FLAG_BITS))
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & PAGE_MASK)
    }

    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate((self.0 & FLAG_BITS) as u64)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn set(&mut self, frame: PhysAddr, flags: PageTableFlags) {
        *self = PageTableEntry::new(frame, flags);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// One page of paging structure. Also used as the untyped view of any
/// page the kernel touches through the `Mmu`.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// The raw bytes of the page.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the entries are plain u32s filling the whole page
        unsafe {
            core::slice::from_raw_parts_mut(
                self.entries.as_mut_ptr() as *mut u8,
                PAGE_SIZE as usize,
            )
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Where the entry for a virtual address lives: a table reached through
/// the recursive window, and the index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSlot {
    pub table: VirtAddr,
    pub index: usize,
}

/// Physical frames backing a new user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub directory: PhysAddr,
    pub user_table: PhysAddr,
}

/// Kernel paging state and the mapping primitives built on it.
pub struct PagingManager<M: Mmu> {
    mmu: M,
    kernel_directory: PhysAddr,
    kernel_table: PhysAddr,
    recursive: bool,
}

/// Page of the recursive window that shows table `directory_index`.
pub const fn table_window(directory_index: usize) -> VirtAddr {
    VirtAddr::new(RECURSIVE_TABLES + directory_index as u32 * PAGE_SIZE)
}

pub(crate) fn kernel_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE
}

pub(crate) fn user_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

impl<M: Mmu> PagingManager<M> {
    /// Build the kernel directory, identity map the first 4 MiB for the
    /// kernel only, and turn paging on.
    ///
    /// The frame bitmap is reset first: the kernel image, the hardware
    /// hole and the kernel arena are reserved before anything is handed
    /// out. Failing here leaves the machine without usable paging.
    pub fn bootstrap(mut mmu: M, frames: &mut FrameAllocator) -> Result<Self, PagingError> {
        frames.clear();
        frames.mark_range_used(
            PhysAddr::new(KERNEL_IMAGE_START),
            PhysAddr::new(KERNEL_IMAGE_END),
        );
        frames.mark_range_used(
            PhysAddr::new(HARDWARE_RESERVED_START),
            PhysAddr::new(HARDWARE_RESERVED_END),
        );
        frames.mark_range_used(
            PhysAddr::new(HEAP_START),
            PhysAddr::new(HEAP_START + HEAP_SIZE as u32),
        );

        let directory = frames
            .acquire_frame()
            .map_err(|_| PagingError::FramesExhausted)?;
        let table = frames
            .acquire_frame()
            .map_err(|_| PagingError::FramesExhausted)?;

        // paging is still off, physical addresses are directly usable
        let identity = mmu
            .page(VirtAddr::new(table.as_u32()))
            .ok_or(PagingError::NotAccessible(VirtAddr::new(table.as_u32())))?;
        for (index, frame) in (0..IDENTITY_MAP_END).step_by(PAGE_SIZE as usize).enumerate() {
            identity[index] = PageTableEntry::new(PhysAddr::new(frame), kernel_flags());
        }

        let root = mmu
            .page(VirtAddr::new(directory.as_u32()))
            .ok_or(PagingError::NotAccessible(VirtAddr::new(directory.as_u32())))?;
        root.zero();
        root[0] = PageTableEntry::new(table, kernel_flags());

        mmu.load_directory(directory);
        mmu.enable_paging();

        log::info!(
            target: "mm",
            "paging enabled, directory {} identity table {}",
            directory,
            table
        );

        Ok(Self {
            mmu,
            kernel_directory: directory,
            kernel_table: table,
            recursive: false,
        })
    }

    /// Point the last directory slot back at the directory.
    pub fn enable_recursive_mapping(&mut self) -> Result<(), PagingError> {
        let directory = self.kernel_directory;
        if directory.as_u32() >= IDENTITY_MAP_END {
            return Err(PagingError::NotAccessible(VirtAddr::new(directory.as_u32())));
        }
        let root = self
            .mmu
            .page(VirtAddr::new(directory.as_u32()))
            .ok_or(PagingError::NotAccessible(VirtAddr::new(directory.as_u32())))?;
        root[RECURSIVE_SLOT] = PageTableEntry::new(directory, kernel_flags());
        self.mmu.flush(VirtAddr::new(RECURSIVE_DIRECTORY));
        self.recursive = true;

        log::debug!(target: "mm", "recursive mapping installed in slot {}", RECURSIVE_SLOT);
        Ok(())
    }

    pub fn kernel_directory(&self) -> PhysAddr {
        self.kernel_directory
    }

    pub fn kernel_table(&self) -> PhysAddr {
        self.kernel_table
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut M {
        &mut self.mmu
    }

    /// The active directory, through the recursive window.
    pub fn directory(&mut self) -> Result<&mut PageTable, PagingError> {
        if !self.recursive {
            return Err(PagingError::RecursiveMappingDisabled);
        }
        let window = VirtAddr::new(RECURSIVE_DIRECTORY);
        self.mmu
            .page(window)
            .ok_or(PagingError::NotAccessible(window))
    }

    /// Slot for `vaddr` if its table exists. Never creates anything.
    pub fn entry_slot(&mut self, vaddr: VirtAddr) -> Result<Option<TableSlot>, PagingError> {
        let pde = self.directory()?[vaddr.directory_index()];
        if !pde.is_present() {
            return Ok(None);
        }
        Ok(Some(TableSlot {
            table: table_window(vaddr.directory_index()),
            index: vaddr.table_index(),
        }))
    }

    /// Slot for `vaddr`, installing a fresh table from the page heap when
    /// the directory entry is absent or not present.
    pub fn resolve_or_create_table(
        &mut self,
        vaddr: VirtAddr,
        page_heap: &mut PageHeap,
        frames: &mut FrameAllocator,
    ) -> Result<TableSlot, PagingError> {
        if let Some(slot) = self.entry_slot(vaddr)? {
            return Ok(slot);
        }

        let directory_index = vaddr.directory_index();
        let page = page_heap.acquire_page(self, frames)?;
        if let Err(err) = self.install_table(directory_index, page.phys, user_flags()) {
            let _ = page_heap.release_page(page.virt, self, frames);
            return Err(err);
        }

        log::debug!(
            target: "mm",
            "new page table {} for directory slot {}",
            page.phys,
            directory_index
        );

        Ok(TableSlot {
            table: table_window(directory_index),
            index: vaddr.table_index(),
        })
    }

    /// Point directory slot `directory_index` at `frame` and zero the new
    /// table through its window.
    pub fn install_table(
        &mut self,
        directory_index: usize,
        frame: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), PagingError> {
        self.directory()?[directory_index] = PageTableEntry::new(frame, flags);
        let window = table_window(directory_index);
        self.mmu.flush(window);
        let zeroed = match self.mmu.page(window) {
            Some(table) => {
                table.zero();
                true
            }
            None => false,
        };
        if !zeroed {
            self.directory()?[directory_index].clear();
            return Err(PagingError::NotAccessible(window));
        }
        Ok(())
    }

    fn write_slot(&mut self, slot: TableSlot, entry: PageTableEntry) -> Result<(), PagingError> {
        let table = self
            .mmu
            .page(slot.table)
            .ok_or(PagingError::NotAccessible(slot.table))?;
        table[slot.index] = entry;
        Ok(())
    }

    /// Map `vaddr` to `paddr`. `PRESENT` is always added to `flags`.
    pub fn map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
        page_heap: &mut PageHeap,
        frames: &mut FrameAllocator,
    ) -> Result<(), PagingError> {
        check_aligned(vaddr, paddr)?;
        check_outside_window(vaddr)?;
        let slot = self.resolve_or_create_table(vaddr, page_heap, frames)?;
        self.write_slot(slot, PageTableEntry::new(paddr, flags | PageTableFlags::PRESENT))?;
        self.mmu.flush(vaddr);
        log::trace!(target: "mm", "mapped {} -> {}", vaddr, paddr);
        Ok(())
    }

    /// Map `vaddr` only if its page table already exists.
    pub fn map_existing(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), PagingError> {
        check_aligned(vaddr, paddr)?;
        check_outside_window(vaddr)?;
        let slot = self
            .entry_slot(vaddr)?
            .ok_or(PagingError::NotAccessible(vaddr))?;
        self.write_slot(slot, PageTableEntry::new(paddr, flags | PageTableFlags::PRESENT))?;
        self.mmu.flush(vaddr);
        Ok(())
    }

    /// Clear the entry for `vaddr` and return the frame it pointed at.
    ///
    /// An address without a table, or with an empty entry, is left alone.
    pub fn unmap(&mut self, vaddr: VirtAddr) -> Result<Option<PhysAddr>, PagingError> {
        check_outside_window(vaddr)?;
        let Some(slot) = self.entry_slot(vaddr)? else {
            return Ok(None);
        };
        let table = self
            .mmu
            .page(slot.table)
            .ok_or(PagingError::NotAccessible(slot.table))?;
        let entry = table[slot.index];
        if !entry.is_present() {
            return Ok(None);
        }
        table[slot.index].clear();
        self.mmu.flush(vaddr.align_down());
        log::trace!(target: "mm", "unmapped {}", vaddr);
        Ok(Some(entry.addr()))
    }

    /// Physical address `vaddr` currently resolves to.
    pub fn translate(&mut self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let slot = self.entry_slot(vaddr).ok()??;
        let entry = self.mmu.page(slot.table)?[slot.index];
        if !entry.is_present() {
            return None;
        }
        Some(entry.addr().offset(vaddr.page_offset()))
    }

    /// Run `f` on the physical frame `frame`, reached through the scratch
    /// slot. The scratch mapping is removed before returning.
    pub fn with_frame<R>(
        &mut self,
        frame: PhysAddr,
        f: impl FnOnce(&mut PageTable) -> R,
    ) -> Result<R, PagingError> {
        let scratch = VirtAddr::new(SCRATCH_PAGE);
        self.map_existing(scratch, frame.align_down(), kernel_flags())?;
        let result = match self.mmu.page(scratch) {
            Some(page) => Ok(f(page)),
            None => Err(PagingError::NotAccessible(scratch)),
        };
        self.unmap(scratch)?;
        result
    }

    /// Build the directory of a new process.
    ///
    /// The code occupies `code_size` bytes starting at `code_phys`, and
    /// the frame right after the code is the initial user stack. All of
    /// them must already be owned by the caller. Kernel directory slots
    /// are shared without user access; slot 0 aliases the kernel's
    /// identity table.
    pub fn create_process_address_space(
        &mut self,
        code_phys: PhysAddr,
        code_size: usize,
        frames: &mut FrameAllocator,
    ) -> Result<AddressSpace, PagingError> {
        if !code_phys.is_page_aligned() {
            return Err(PagingError::Misaligned(code_phys.as_u32()));
        }
        let code_pages = super::pages_for(code_size).max(1);
        if code_pages + 1 > TABLE_ENTRIES {
            return Err(PagingError::ImageTooLarge(code_size));
        }

        let kernel = self.directory()?.clone();
        let kernel_table = self.kernel_table;

        let directory = frames
            .acquire_frame()
            .map_err(|_| PagingError::FramesExhausted)?;
        let user_table = match frames.acquire_frame() {
            Ok(frame) => frame,
            Err(_) => {
                let _ = frames.release_frame(directory);
                return Err(PagingError::FramesExhausted);
            }
        };

        let user_slot = VirtAddr::new(USER_OFFSET).directory_index();
        let filled = self
            .with_frame(directory, |root| {
                root.zero();
                for (index, entry) in kernel.iter().enumerate() {
                    if index != RECURSIVE_SLOT && entry.is_present() {
                        let mut flags = entry.flags();
                        flags.remove(PageTableFlags::USER_ACCESSIBLE);
                        root[index] = PageTableEntry::new(entry.addr(), flags);
                    }
                }
                root[0] = PageTableEntry::new(kernel_table, kernel_flags());
                root[user_slot] = PageTableEntry::new(user_table, user_flags());
                root[RECURSIVE_SLOT] = PageTableEntry::new(directory, kernel_flags());
            })
            .and_then(|_| {
                self.with_frame(user_table, |table| {
                    table.zero();
                    // code pages, then the stack page right behind them
                    for index in 0..=code_pages {
                        let frame = code_phys.offset(index as u32 * PAGE_SIZE);
                        table[index] = PageTableEntry::new(frame, user_flags());
                    }
                })
            });

        if let Err(err) = filled {
            let _ = frames.release_frame(directory);
            let _ = frames.release_frame(user_table);
            log::warn!(target: "mm", "address space creation failed: {}", err);
            return Err(err);
        }

        log::debug!(
            target: "mm",
            "address space: directory {} user table {} ({} code pages)",
            directory,
            user_table,
            code_pages
        );

        Ok(AddressSpace {
            directory,
            user_table,
        })
    }
}

fn check_aligned(vaddr: VirtAddr, paddr: PhysAddr) -> Result<(), PagingError> {
    if !vaddr.is_page_aligned() {
        return Err(PagingError::Misaligned(vaddr.as_u32()));
    }
    if !paddr.is_page_aligned() {
        return Err(PagingError::Misaligned(paddr.as_u32()));
    }
    Ok(())
}

/// Pages under the recursive slot are the paging structures themselves.
fn check_outside_window(vaddr: VirtAddr) -> Result<(), PagingError> {
    if vaddr.directory_index() == RECURSIVE_SLOT {
        return Err(PagingError::NotAccessible(vaddr));
    }
    Ok(())
}

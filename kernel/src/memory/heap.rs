//! The kernel heap.
//!
//! A first-fit allocator over a fixed arena. Blocks are laid out back to
//! back, each starting with a 16 byte header:
//!
//! | offset | field                               |
//! |--------|-------------------------------------|
//! | 0      | magic tag                           |
//! | 4      | payload size, bit 0 is the used flag |
//! | 8      | offset of the previous block        |
//! | 12     | offset of the next block            |
//!
//! Links are arena offsets, never raw addresses, so a block can only ever
//! point inside the arena it belongs to.

use core::{alloc::Layout, fmt, ops::DerefMut, panic::Location, ptr::NonNull};

use arrayvec::ArrayVec;

use crate::constants::memory::{HEAP_ALIGN, HEAP_MAGIC, HEAP_MIN_SIZE, MAX_ALLOCATIONS};

const HEADER: usize = 16;
const MIN_PAYLOAD: usize = HEAP_MIN_SIZE as usize;
const USED: u32 = 1;
const NIL: u32 = u32::MAX;

const MAGIC_AT: usize = 0;
const SIZE_AT: usize = 4;
const PREV_AT: usize = 8;
const NEXT_AT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCorruption {
    BadMagic,
    UnalignedSize,
    /// The chain runs past the end of the arena.
    ChainOverflow,
    /// A `prev` link disagrees with the chain, or the chain stops short.
    BrokenLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory { requested: usize, free: usize },
    InvalidFree { addr: usize },
    DoubleFree { addr: usize },
    Corrupted { offset: usize, reason: HeapCorruption },
    /// The arena cannot hold even one minimal block.
    ArenaTooSmall(usize),
    /// Payloads are only 4 byte aligned.
    UnsupportedAlignment(usize),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory { requested, free } => write!(
                f,
                "out of memory: {} bytes requested, {} bytes free",
                requested, free
            ),
            HeapError::InvalidFree { addr } => write!(f, "invalid free of {:#x}", addr),
            HeapError::DoubleFree { addr } => write!(f, "double free of {:#x}", addr),
            HeapError::Corrupted { offset, reason } => {
                write!(f, "heap corrupted at offset {:#x}: {:?}", offset, reason)
            }
            HeapError::ArenaTooSmall(size) => write!(f, "arena of {} bytes is too small", size),
            HeapError::UnsupportedAlignment(align) => {
                write!(f, "alignment of {} bytes not supported", align)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOptions {
    /// Keep an allocation record per live block for leak reports.
    pub track_allocations: bool,
    /// Walk the whole chain before every allocation.
    pub validate_before_alloc: bool,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            track_allocations: cfg!(debug_assertions),
            validate_before_alloc: cfg!(debug_assertions),
        }
    }
}

/// Running totals. `used` and `free` count payload bytes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub peak: usize,
    pub allocations: usize,
    pub deallocations: usize,
}

impl HeapStats {
    pub fn active(&self) -> usize {
        self.allocations - self.deallocations
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    pub addr: usize,
    pub size: usize,
    pub location: &'static Location<'static>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: usize,
    pub size: usize,
    pub used: bool,
}

pub struct KernelHeap<A: DerefMut<Target = [u8]>> {
    arena: A,
    options: HeapOptions,
    stats: HeapStats,
    records: ArrayVec<AllocationRecord, MAX_ALLOCATIONS>,
}

impl<A: DerefMut<Target = [u8]>> KernelHeap<A> {
    pub fn new(arena: A) -> Result<Self, HeapError> {
        Self::with_options(arena, HeapOptions::default())
    }

    /// Format `arena` as a single free block.
    pub fn with_options(arena: A, options: HeapOptions) -> Result<Self, HeapError> {
        let len = arena.len();
        if len < HEADER + MIN_PAYLOAD || len >= NIL as usize || len % HEAP_ALIGN as usize != 0 {
            return Err(HeapError::ArenaTooSmall(len));
        }

        let mut heap = Self {
            arena,
            options,
            stats: HeapStats {
                total: len,
                free: len - HEADER,
                ..HeapStats::default()
            },
            records: ArrayVec::new(),
        };
        heap.write_header(0, (len - HEADER) as u32, NIL, NIL);

        log::debug!(target: "heap", "arena of {} bytes ready", len);
        Ok(heap)
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn options(&self) -> HeapOptions {
        self.options
    }

    /// First-fit allocation of at least `size` bytes, 4 byte aligned.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if self.options.validate_before_alloc {
            self.validate()?;
        }

        let Some(wanted) = round_request(size) else {
            return Err(self.out_of_memory(size));
        };

        let len = self.arena.len();
        let mut offset = 0;
        let mut steps = 0;
        let block = loop {
            let available = self.size(offset);
            let next = self.next(offset);
            if (offset + HEADER).saturating_add(available) > len
                || (next != NIL && (next as usize).saturating_add(HEADER) > len)
            {
                return Err(corrupted(offset, HeapCorruption::ChainOverflow));
            }
            if !self.is_used(offset) && available >= wanted {
                break offset;
            }
            if next == NIL {
                return Err(self.out_of_memory(size));
            }
            steps += 1;
            if steps > len / HEADER {
                return Err(corrupted(offset, HeapCorruption::BrokenLink));
            }
            offset = next as usize;
        };

        let available = self.size(block);
        if available - wanted > HEADER + MIN_PAYLOAD {
            self.split(block, wanted);
        }

        let size = self.size(block);
        self.set_used(block, true);
        self.stats.used += size;
        self.stats.free -= size;
        self.stats.allocations += 1;
        self.stats.peak = self.stats.peak.max(self.stats.used);

        // SAFETY: block + HEADER lies inside the arena
        let payload = unsafe { self.arena.as_mut_ptr().add(block + HEADER) };
        let addr = payload as usize;
        if self.options.track_allocations {
            self.record(addr, size, Location::caller());
        }

        log::trace!(target: "heap", "allocated {} bytes at offset {:#x}", size, block);
        NonNull::new(payload).ok_or(HeapError::InvalidFree { addr })
    }

    /// Allocation for the global allocator.
    #[track_caller]
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.align() > HEAP_ALIGN as usize {
            log::warn!(target: "heap", "alignment {} not supported", layout.align());
            return Err(HeapError::UnsupportedAlignment(layout.align()));
        }
        self.allocate(layout.size())
    }

    /// Return a block to the heap and merge it with free neighbours.
    ///
    /// A pointer whose header has no valid magic tag, or whose block is
    /// already free, is rejected without touching the heap.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr() as usize;
        let base = self.arena.as_ptr() as usize;
        if addr < base + HEADER || addr >= base + self.arena.len() {
            log::error!(target: "heap", "free of {:#x} outside the arena", addr);
            return Err(HeapError::InvalidFree { addr });
        }

        let block = addr - base - HEADER;
        if block % HEAP_ALIGN as usize != 0 || self.read(block + MAGIC_AT) != HEAP_MAGIC {
            log::error!(target: "heap", "invalid free of {:#x}", addr);
            return Err(HeapError::InvalidFree { addr });
        }
        if !self.is_used(block) {
            log::error!(target: "heap", "double free of {:#x}", addr);
            return Err(HeapError::DoubleFree { addr });
        }
        if !self.is_linked(block) {
            log::error!(target: "heap", "free of {:#x} names no block in the chain", addr);
            return Err(HeapError::InvalidFree { addr });
        }

        let size = self.size(block);
        self.set_used(block, false);
        self.stats.used -= size;
        self.stats.free += size;
        self.stats.deallocations += 1;

        if let Some(record) = self
            .records
            .iter_mut()
            .find(|record| record.active && record.addr == addr)
        {
            record.active = false;
        }

        let next = self.next(block);
        if next != NIL && !self.is_used(next as usize) {
            self.absorb_next(block);
        }
        let prev = self.prev(block);
        if prev != NIL && !self.is_used(prev as usize) {
            self.absorb_next(prev as usize);
        }

        log::trace!(target: "heap", "freed {} bytes at offset {:#x}", size, block);
        Ok(())
    }

    /// Merge every run of adjacent free blocks. Returns the number of merges.
    pub fn defragment(&mut self) -> usize {
        let mut merged = 0;
        let mut offset = 0;
        loop {
            let next = self.next(offset);
            if next == NIL {
                break;
            }
            if !self.is_used(offset) && !self.is_used(next as usize) {
                self.absorb_next(offset);
                merged += 1;
            } else {
                offset = next as usize;
            }
        }
        if merged > 0 {
            log::debug!(target: "heap", "defragment merged {} blocks", merged);
        }
        merged
    }

    /// Walk the whole chain and check every header.
    pub fn validate(&self) -> Result<(), HeapError> {
        let len = self.arena.len();
        let mut offset = 0;
        let mut covered = 0;
        loop {
            if offset + HEADER > len {
                return Err(corrupted(offset, HeapCorruption::ChainOverflow));
            }
            if self.read(offset + MAGIC_AT) != HEAP_MAGIC {
                return Err(corrupted(offset, HeapCorruption::BadMagic));
            }
            let size = self.size(offset);
            if size % HEAP_ALIGN as usize != 0 {
                return Err(corrupted(offset, HeapCorruption::UnalignedSize));
            }
            covered += HEADER + size;
            if covered > len {
                return Err(corrupted(offset, HeapCorruption::ChainOverflow));
            }

            let next = self.next(offset);
            if next == NIL {
                break;
            }
            let next = next as usize;
            if next != offset + HEADER + size
                || next + HEADER > len
                || self.prev(next) != offset as u32
            {
                return Err(corrupted(offset, HeapCorruption::BrokenLink));
            }
            offset = next;
        }

        if covered != len {
            return Err(corrupted(offset, HeapCorruption::BrokenLink));
        }
        Ok(())
    }

    /// The block chain in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: &self.arena,
            offset: Some(0),
        }
    }

    /// Allocation records that were never freed.
    pub fn leaks(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter().filter(|record| record.active)
    }

    fn record(&mut self, addr: usize, size: usize, location: &'static Location<'static>) {
        let entry = AllocationRecord {
            addr,
            size,
            location,
            active: true,
        };
        if let Some(slot) = self.records.iter_mut().find(|record| !record.active) {
            *slot = entry;
        } else if self.records.try_push(entry).is_err() {
            log::warn!(target: "heap", "allocation table full, {:#x} not tracked", addr);
        }
    }

    fn out_of_memory(&self, requested: usize) -> HeapError {
        log::warn!(
            target: "heap",
            "out of memory: {} bytes requested, {} free",
            requested,
            self.stats.free
        );
        HeapError::OutOfMemory {
            requested,
            free: self.stats.free,
        }
    }

    /// Whether the header at `block` sits in the chain where its links say.
    ///
    /// Checks both neighbours point back at `block` and that every offset a
    /// free and merge will touch lies inside the arena.
    fn is_linked(&self, block: usize) -> bool {
        let len = self.arena.len();
        let size = self.size(block);
        let end = (block + HEADER).saturating_add(size);
        if size % HEAP_ALIGN as usize != 0 || end > len {
            return false;
        }

        let next = self.next(block);
        if next == NIL {
            if end != len {
                return false;
            }
        } else {
            let next = next as usize;
            if next != end
                || next + HEADER > len
                || self.read(next + MAGIC_AT) != HEAP_MAGIC
                || self.prev(next) != block as u32
            {
                return false;
            }
            let after = self.next(next);
            if after != NIL && (after as usize).saturating_add(HEADER) > len {
                return false;
            }
        }

        let prev = self.prev(block);
        if prev == NIL {
            return block == 0;
        }
        let prev = prev as usize;
        prev < block
            && prev % HEAP_ALIGN as usize == 0
            && self.read(prev + MAGIC_AT) == HEAP_MAGIC
            && self.next(prev) == block as u32
    }

    /// Shrink `block` to `size` and put the rest in a new free block after it.
    fn split(&mut self, block: usize, size: usize) {
        let rest = block + HEADER + size;
        let rest_size = self.size(block) - size - HEADER;
        let next = self.next(block);

        self.write_header(rest, rest_size as u32, block as u32, next);
        if next != NIL {
            self.write(next as usize + PREV_AT, rest as u32);
        }
        self.write(block + NEXT_AT, rest as u32);
        self.write(block + SIZE_AT, size as u32);
        self.stats.free -= HEADER;
    }

    /// Grow `block` over its successor. Both must be free.
    fn absorb_next(&mut self, block: usize) {
        let victim = self.next(block) as usize;
        let grown = self.size(block) + HEADER + self.size(victim);
        let after = self.next(victim);

        self.write(block + SIZE_AT, grown as u32);
        self.write(block + NEXT_AT, after);
        if after != NIL {
            self.write(after as usize + PREV_AT, block as u32);
        }
        self.write(victim + MAGIC_AT, 0);
        self.stats.free += HEADER;
    }

    fn write_header(&mut self, block: usize, size: u32, prev: u32, next: u32) {
        self.write(block + MAGIC_AT, HEAP_MAGIC);
        self.write(block + SIZE_AT, size);
        self.write(block + PREV_AT, prev);
        self.write(block + NEXT_AT, next);
    }

    fn size(&self, block: usize) -> usize {
        (self.read(block + SIZE_AT) & !USED) as usize
    }

    fn is_used(&self, block: usize) -> bool {
        self.read(block + SIZE_AT) & USED != 0
    }

    fn set_used(&mut self, block: usize, used: bool) {
        let raw = self.read(block + SIZE_AT);
        let raw = if used { raw | USED } else { raw & !USED };
        self.write(block + SIZE_AT, raw);
    }

    fn prev(&self, block: usize) -> u32 {
        self.read(block + PREV_AT)
    }

    fn next(&self, block: usize) -> u32 {
        self.read(block + NEXT_AT)
    }

    fn read(&self, at: usize) -> u32 {
        read_u32(&self.arena, at)
    }

    fn write(&mut self, at: usize, value: u32) {
        self.arena[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }
}

pub struct Blocks<'a> {
    arena: &'a [u8],
    offset: Option<usize>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let offset = self.offset?;
        if offset + HEADER > self.arena.len() || read_u32(self.arena, offset) != HEAP_MAGIC {
            self.offset = None;
            return None;
        }
        let raw = read_u32(self.arena, offset + SIZE_AT);
        let next = read_u32(self.arena, offset + NEXT_AT);
        self.offset = (next != NIL && next as usize > offset).then_some(next as usize);
        Some(BlockInfo {
            offset,
            size: (raw & !USED) as usize,
            used: raw & USED != 0,
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let b = &bytes[at..at + 4];
    u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}

fn round_request(size: usize) -> Option<usize> {
    let size = size.max(MIN_PAYLOAD);
    let align = HEAP_ALIGN as usize;
    let rounded = size.checked_add(align - 1)? & !(align - 1);
    (rounded < NIL as usize).then_some(rounded)
}

fn corrupted(offset: usize, reason: HeapCorruption) -> HeapError {
    log::error!(target: "heap", "corruption at offset {:#x}: {:?}", offset, reason);
    HeapError::Corrupted { offset, reason }
}

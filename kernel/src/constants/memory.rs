//! Physical and virtual memory layout.

pub const PAGE_SIZE: u32 = 4096;
pub const FRAME_SIZE: usize = 4096;
pub const PAGE_MASK: u32 = !(PAGE_SIZE - 1);

/// Entries in a page directory or a page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Bytes covered by one page table (one directory slot).
pub const TABLE_SPAN: u32 = PAGE_SIZE * TABLE_ENTRIES as u32;

// 512 MiB of addressable physical memory, one bit per frame
pub const MAX_FRAMES: usize = 0x20000;
pub const BITMAP_BYTES: usize = MAX_FRAMES / 8;
pub const FULL_BITMAP_ENTRY: u8 = 0xFF;

/// Kernel image, loaded by the boot stub at the bottom of memory.
pub const KERNEL_IMAGE_START: u32 = 0x0;
pub const KERNEL_IMAGE_END: u32 = 0x20000;

/// VGA memory and BIOS ROM shadow.
pub const HARDWARE_RESERVED_START: u32 = 0xA0000;
pub const HARDWARE_RESERVED_END: u32 = 0x100000;

/// Everything below this address is identity mapped, kernel only.
pub const IDENTITY_MAP_END: u32 = TABLE_SPAN;

pub const HEAP_START: u32 = 0x20_0000;
pub const HEAP_SIZE: usize = 0x20_0000; // 2 MiB, inside the identity map
pub const HEAP_MAGIC: u32 = 0xDEAD_BEEF;
pub const HEAP_MIN_SIZE: u32 = 16;
pub const HEAP_ALIGN: u32 = 4;
pub const MAX_ALLOCATIONS: usize = 256;

pub const PAGE_HEAP_START: u32 = 0x70_0000;
pub const PAGE_HEAP_ENTRIES: usize = 128;
pub const PAGE_HEAP_END: u32 = PAGE_HEAP_START + PAGE_HEAP_ENTRIES as u32 * PAGE_SIZE;

/// Kernel slot used to reach frames that are not identity mapped.
/// Shares the page heap's page table.
pub const SCRATCH_PAGE: u32 = PAGE_HEAP_END;

/// Directory slot whose entry points back at the directory itself.
pub const RECURSIVE_SLOT: usize = TABLE_ENTRIES - 1;
/// The directory, seen through the recursive slot.
pub const RECURSIVE_DIRECTORY: u32 = 0xFFFF_F000;
/// Page table `i` is visible at `RECURSIVE_TABLES + i * PAGE_SIZE`.
pub const RECURSIVE_TABLES: u32 = 0xFFC0_0000;

/// Fixed base of every user address space.
pub const USER_OFFSET: u32 = 0x4000_0000;

//! 32-bit Global Descriptor Table and Task State Segment.

use core::{fmt, mem::size_of};

use crate::constants::gdt::{BOOT_KERNEL_STACK, GDT_ENTRIES, KERNEL_STACK_SELECTOR};

// access bytes
const KERNEL_CODE: u8 = 0x9B;
const KERNEL_DATA: u8 = 0x93;
const KERNEL_STACK: u8 = 0x97;
const USER_CODE: u8 = 0xFB;
const USER_DATA: u8 = 0xF3;
const USER_STACK: u8 = 0xF7;
const TSS_AVAILABLE: u8 = 0xE9;

/// 4 KiB granularity, 32-bit segment.
const FLAT_FLAGS: u8 = 0x0D;
const FLAT_LIMIT: u32 = 0xFFFFF;

/// One 8 byte segment descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const NULL: Self = SegmentDescriptor(0);

    /// Encode a descriptor. `flags` is the high nibble of byte 6
    /// (granularity, size, long mode, available).
    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let mut raw = (limit & 0xFFFF) as u64;
        raw |= ((base & 0xFF_FFFF) as u64) << 16;
        raw |= (access as u64) << 40;
        raw |= (((limit >> 16) & 0xF) as u64) << 48;
        raw |= ((flags & 0xF) as u64) << 52;
        raw |= ((base >> 24) as u64) << 56;
        SegmentDescriptor(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn base(self) -> u32 {
        (((self.0 >> 16) & 0xFF_FFFF) | ((self.0 >> 56) << 24)) as u32
    }

    pub const fn limit(self) -> u32 {
        ((self.0 & 0xFFFF) | (((self.0 >> 48) & 0xF) << 16)) as u32
    }

    pub const fn access(self) -> u8 {
        (self.0 >> 40) as u8
    }

    pub const fn flags(self) -> u8 {
        ((self.0 >> 52) & 0xF) as u8
    }
}

impl fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentDescriptor")
            .field("base", &format_args!("{:#010x}", self.base()))
            .field("limit", &format_args!("{:#07x}", self.limit()))
            .field("access", &format_args!("{:#04x}", self.access()))
            .field("flags", &format_args!("{:#x}", self.flags()))
            .finish()
    }
}

/// Hardware task state. Only `ss0`/`esp0` are used: they give the stack
/// the CPU switches to when an interrupt arrives in ring 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TaskStateSegment {
    pub prev_task_link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

impl TaskStateSegment {
    /// A TSS pointing at the boot kernel stack, with no I/O bitmap.
    pub const fn new() -> Self {
        Self {
            prev_task_link: 0,
            esp0: BOOT_KERNEL_STACK,
            ss0: KERNEL_STACK_SELECTOR.0 as u32,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

impl Default for TaskStateSegment {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel GDT: null, kernel code/data/stack, user code/data/stack, TSS.
#[derive(Debug, Clone)]
#[repr(C, align(8))]
pub struct GlobalDescriptorTable {
    entries: [SegmentDescriptor; GDT_ENTRIES],
}

impl GlobalDescriptorTable {
    /// Flat 4 GiB segments. The stack segments are expand-down with a
    /// zero limit, which also covers the whole address space.
    pub const fn new(tss_base: u32) -> Self {
        Self {
            entries: [
                SegmentDescriptor::NULL,
                SegmentDescriptor::new(0, FLAT_LIMIT, KERNEL_CODE, FLAT_FLAGS),
                SegmentDescriptor::new(0, FLAT_LIMIT, KERNEL_DATA, FLAT_FLAGS),
                SegmentDescriptor::new(0, 0, KERNEL_STACK, FLAT_FLAGS),
                SegmentDescriptor::new(0, FLAT_LIMIT, USER_CODE, FLAT_FLAGS),
                SegmentDescriptor::new(0, FLAT_LIMIT, USER_DATA, FLAT_FLAGS),
                SegmentDescriptor::new(0, 0, USER_STACK, FLAT_FLAGS),
                SegmentDescriptor::new(
                    tss_base,
                    size_of::<TaskStateSegment>() as u32,
                    TSS_AVAILABLE,
                    0,
                ),
            ],
        }
    }

    pub fn entry(&self, index: usize) -> Option<SegmentDescriptor> {
        self.entries.get(index).copied()
    }
}

#[cfg(target_arch = "x86")]
mod install {
    use core::arch::asm;

    use spin::Once;

    use super::GlobalDescriptorTable;
    use crate::constants::gdt::{
        GDT_ENTRIES, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, KERNEL_STACK_SELECTOR,
        TSS_SELECTOR,
    };

    static GDT: Once<GlobalDescriptorTable> = Once::new();

    #[repr(C, packed)]
    struct DescriptorTablePointer {
        limit: u16,
        base: u32,
    }

    /// Load the kernel GDT, reload every segment register and load the
    /// task register.
    ///
    /// # Safety
    ///
    /// `tss_base` must be the address of a `TaskStateSegment` that stays
    /// in place for as long as the GDT is loaded.
    pub unsafe fn init(tss_base: u32) {
        let gdt = GDT.call_once(|| GlobalDescriptorTable::new(tss_base));
        let pointer = DescriptorTablePointer {
            limit: (GDT_ENTRIES * 8 - 1) as u16,
            base: gdt as *const GlobalDescriptorTable as u32,
        };

        asm!(
            "lgdt [{gdtr}]",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov fs, {data:x}",
            "mov gs, {data:x}",
            "mov ss, {stack:x}",
            // far return to reload cs
            "push {code}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            gdtr = in(reg) &pointer,
            data = in(reg) KERNEL_DATA_SELECTOR.0 as u32,
            stack = in(reg) KERNEL_STACK_SELECTOR.0 as u32,
            code = in(reg) KERNEL_CODE_SELECTOR.0 as u32,
            tmp = out(reg) _,
        );
        asm!("ltr {0:x}", in(reg) TSS_SELECTOR.0 as u32, options(nostack, preserves_flags));

        log::info!(target: "gdt", "gdt loaded, tss at {:#010x}", tss_base);
    }
}

#[cfg(target_arch = "x86")]
pub use install::init;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_encoding() {
        // kernel code, flat
        let code = SegmentDescriptor::new(0, 0xFFFFF, 0x9B, 0x0D);
        assert_eq!(code.raw(), 0x00DF_9B00_0000_FFFF);

        let split = SegmentDescriptor::new(0x1234_5678, 0xABCDE, 0xE9, 0x0);
        assert_eq!(split.base(), 0x1234_5678);
        assert_eq!(split.limit(), 0xABCDE);
        assert_eq!(split.access(), 0xE9);
        assert_eq!(split.flags(), 0);
    }

    #[test]
    fn test_tss_layout() {
        assert_eq!(size_of::<TaskStateSegment>(), 104);
        assert_eq!(core::mem::offset_of!(TaskStateSegment, esp0), 4);
        assert_eq!(core::mem::offset_of!(TaskStateSegment, ss0), 8);
        assert_eq!(core::mem::offset_of!(TaskStateSegment, iomap_base), 102);

        let tss = TaskStateSegment::new();
        assert_eq!(tss.ss0, 0x18);
        assert_eq!(tss.esp0, 0x20000);
    }

    #[test]
    fn test_kernel_table() {
        let gdt = GlobalDescriptorTable::new(0xC0FFEE);
        assert_eq!(gdt.entry(0), Some(SegmentDescriptor::NULL));
        assert_eq!(gdt.entry(1).map(|d| d.access()), Some(0x9B));
        assert_eq!(gdt.entry(3).map(|d| d.limit()), Some(0));
        assert_eq!(gdt.entry(4).map(|d| d.access()), Some(0xFB));
        assert_eq!(gdt.entry(6).map(|d| d.access()), Some(0xF7));

        let tss = gdt.entry(7).unwrap();
        assert_eq!(tss.base(), 0xC0FFEE);
        assert_eq!(tss.limit(), 104);
        assert_eq!(tss.access(), 0xE9);
        assert_eq!(gdt.entry(8), None);
    }
}

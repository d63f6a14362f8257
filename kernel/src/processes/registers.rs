use core::fmt;

use x86_64::structures::gdt::SegmentSelector;

/// Saved 32-bit register image of a process.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: SegmentSelector,
    pub ds: SegmentSelector,
    pub es: SegmentSelector,
    pub fs: SegmentSelector,
    pub gs: SegmentSelector,
    pub ss: SegmentSelector,
    /// Physical address of the page directory.
    pub cr3: u32,
}

/// Stack the CPU switches to when the process is interrupted in ring 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub ss0: SegmentSelector,
    pub esp0: u32,
}

impl Registers {
    pub const fn new() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
            eflags: 0,
            cs: SegmentSelector(0),
            ds: SegmentSelector(0),
            es: SegmentSelector(0),
            fs: SegmentSelector(0),
            gs: SegmentSelector(0),
            ss: SegmentSelector(0),
            cr3: 0,
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelStack {
    pub const fn new(ss0: SegmentSelector, esp0: u32) -> Self {
        Self { ss0, esp0 }
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("Registers");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("cs", &format_args!("{:#06x}", self.cs.0))
            .field("ds", &format_args!("{:#06x}", self.ds.0))
            .field("es", &format_args!("{:#06x}", self.es.0))
            .field("fs", &format_args!("{:#06x}", self.fs.0))
            .field("gs", &format_args!("{:#06x}", self.gs.0))
            .field("ss", &format_args!("{:#06x}", self.ss.0))
            .field("cr3", &format_args!("{:#010x}", self.cr3));

        ds.finish()
    }
}

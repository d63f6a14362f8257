use core::fmt;

use arrayvec::ArrayVec;

use crate::{
    constants::processes::MAX_PROCESSES,
    memory::{PagingError, PhysAddr, VirtAddr},
};

use super::registers::{KernelStack, Registers};

/// Index of a process in the process table.
pub type Pid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    EmptyImage,
    /// Image size in bytes.
    ImageTooLarge(usize),
    TableFull,
    FramesExhausted,
    AddressSpace(PagingError),
    /// The kernel stack frame is outside the kernel's identity map.
    KernelStackUnreachable(PhysAddr),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::EmptyImage => write!(f, "empty program image"),
            LoadError::ImageTooLarge(size) => write!(f, "program image of {} bytes is too large", size),
            LoadError::TableFull => write!(f, "process table is full"),
            LoadError::FramesExhausted => write!(f, "no frames for the process"),
            LoadError::AddressSpace(err) => write!(f, "address space: {}", err),
            LoadError::KernelStackUnreachable(frame) => {
                write!(f, "kernel stack frame {} is not identity mapped", frame)
            }
        }
    }
}

impl From<PagingError> for LoadError {
    fn from(err: PagingError) -> Self {
        LoadError::AddressSpace(err)
    }
}

/// Half-open virtual range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: VirtAddr,
    pub end: VirtAddr,
}

impl Region {
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> usize {
        (self.end.as_u32() - self.start.as_u32()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Physical frames a process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFrames {
    /// First of the code frames. The stack frame follows the last one.
    pub image: PhysAddr,
    pub image_frames: usize,
    pub directory: PhysAddr,
    pub user_table: PhysAddr,
    pub kernel_stack: PhysAddr,
}

#[derive(Debug, Clone)]
pub struct ProcessControlBlock {
    pub pid: Pid,
    pub registers: Registers,
    pub kernel_stack: KernelStack,
    pub code: Region,
    pub stack: Region,
    pub frames: ProcessFrames,
}

impl ProcessControlBlock {
    /// Physical address of the page directory the process runs under.
    pub fn directory(&self) -> PhysAddr {
        self.frames.directory
    }
}

/// Fixed-capacity table of loaded processes, in load order.
pub struct ProcessTable {
    processes: ArrayVec<ProcessControlBlock, MAX_PROCESSES>,
    current: Option<Pid>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            processes: ArrayVec::new_const(),
            current: None,
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.processes.is_full()
    }

    /// Next pid to be handed out.
    pub fn next_pid(&self) -> Pid {
        self.processes.len()
    }

    /// Append a process. Its pid must be `next_pid()`.
    pub fn push(&mut self, process: ProcessControlBlock) -> Result<Pid, LoadError> {
        let pid = process.pid;
        debug_assert_eq!(pid, self.next_pid());
        self.processes
            .try_push(process)
            .map_err(|_| LoadError::TableFull)?;
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessControlBlock> {
        self.processes.get(pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessControlBlock> {
        self.processes.get_mut(pid)
    }

    /// The dispatched process, if any.
    pub fn current(&self) -> Option<Pid> {
        self.current.filter(|pid| *pid < self.processes.len())
    }

    pub fn set_current(&mut self, pid: Option<Pid>) {
        self.current = pid;
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessControlBlock> {
        self.processes.iter()
    }

    pub fn for_each_process(&self, mut f: impl FnMut(&ProcessControlBlock)) {
        self.processes.iter().for_each(|process| f(process));
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::gdt::KERNEL_STACK_SELECTOR;

    /// A control block with recognisable frames and no real memory behind it.
    pub(crate) fn dummy(pid: Pid) -> ProcessControlBlock {
        let base = 0x50_0000 + pid as u32 * 0x1_0000;
        ProcessControlBlock {
            pid,
            registers: Registers::new(),
            kernel_stack: KernelStack::new(KERNEL_STACK_SELECTOR, base + 0x1000),
            code: Region {
                start: VirtAddr::new(0x4000_0000),
                end: VirtAddr::new(0x4000_1000),
            },
            stack: Region {
                start: VirtAddr::new(0x4000_1000),
                end: VirtAddr::new(0x4000_2000),
            },
            frames: ProcessFrames {
                image: PhysAddr::new(base),
                image_frames: 2,
                directory: PhysAddr::new(base + 0x2000),
                user_table: PhysAddr::new(base + 0x3000),
                kernel_stack: PhysAddr::new(base + 0x4000),
            },
        }
    }

    #[test]
    fn test_push_assigns_indices() {
        let mut table = ProcessTable::new();
        assert_eq!(table.push(dummy(0)), Ok(0));
        assert_eq!(table.push(dummy(1)), Ok(1));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).map(|p| p.pid), Some(1));
        assert!(table.get(2).is_none());
    }

    #[test]
    fn test_table_full() {
        let mut table = ProcessTable::new();
        for pid in 0..MAX_PROCESSES {
            table.push(dummy(pid)).unwrap();
        }
        assert!(table.is_full());
        let mut extra = dummy(0);
        extra.pid = MAX_PROCESSES;
        assert_eq!(table.push(extra), Err(LoadError::TableFull));
    }

    #[test]
    fn test_current_is_weak() {
        let mut table = ProcessTable::new();
        table.set_current(Some(0));
        assert_eq!(table.current(), None);
        table.push(dummy(0)).unwrap();
        assert_eq!(table.current(), Some(0));
    }

    #[test]
    fn test_for_each_process_visits_in_order() {
        let mut table = ProcessTable::new();
        for pid in 0..3 {
            table.push(dummy(pid)).unwrap();
        }
        let mut seen = [usize::MAX; 3];
        let mut count = 0;
        table.for_each_process(|process| {
            seen[count] = process.pid;
            count += 1;
        });
        assert_eq!(seen, [0, 1, 2]);
    }

    #[test]
    fn test_region() {
        let region = Region {
            start: VirtAddr::new(0x1000),
            end: VirtAddr::new(0x3000),
        };
        assert!(region.contains(VirtAddr::new(0x2FFF)));
        assert!(!region.contains(VirtAddr::new(0x3000)));
        assert_eq!(region.len(), 0x2000);
    }
}

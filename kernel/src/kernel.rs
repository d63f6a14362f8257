//! The kernel context.
//!
//! [`Kernel`] owns every piece of mutable core state: the frame bitmap,
//! the paging manager, both heaps, the process table, the scheduler and
//! the task state segment. It is built once at boot and reached through
//! `init::KERNEL`, whose lock keeps interrupts masked while it is held.

use core::{fmt, ops::DerefMut, ptr::NonNull};

use x86_64::structures::paging::PageTableFlags;

use crate::{
    constants::memory::PAGE_HEAP_ENTRIES,
    interrupts::{gdt::TaskStateSegment, trap::TrapFrame},
    memory::{
        FrameAllocator, HeapError, HeapOptions, HeapStats, KernelHeap, Mmu, PageAllocation,
        PageHeap, PageHeapError, PagingError, PagingManager, PhysAddr, VirtAddr,
    },
    processes::{
        loader, LoadError, Pid, ProcessControlBlock, ProcessTable, Scheduler, Switch,
    },
};

/// A failure that leaves the kernel unable to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Paging(PagingError),
    PageHeap(PagingError),
    Heap(HeapError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Paging(err) => write!(f, "paging bootstrap failed: {}", err),
            BootError::PageHeap(err) => write!(f, "page heap setup failed: {}", err),
            BootError::Heap(err) => write!(f, "kernel heap setup failed: {}", err),
        }
    }
}

/// Snapshot of memory use for diagnostic commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub total_frames: usize,
    pub used_frames: usize,
    pub heap: HeapStats,
    pub used_zones: usize,
    pub total_zones: usize,
    pub processes: usize,
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frames: {} used / {} total",
            self.used_frames, self.total_frames
        )?;
        writeln!(
            f,
            "heap: {} used, {} free, {} peak, {} live allocations",
            self.heap.used,
            self.heap.free,
            self.heap.peak,
            self.heap.active()
        )?;
        writeln!(f, "page heap: {} / {} zones", self.used_zones, self.total_zones)?;
        write!(f, "processes: {}", self.processes)
    }
}

pub struct Kernel<M: Mmu, A: DerefMut<Target = [u8]>> {
    frames: FrameAllocator,
    paging: PagingManager<M>,
    heap: KernelHeap<A>,
    page_heap: PageHeap,
    processes: ProcessTable,
    scheduler: Scheduler,
    tss: TaskStateSegment,
}

impl<M: Mmu, A: DerefMut<Target = [u8]>> Kernel<M, A> {
    /// Bring up memory management in order: identity-mapped paging, the
    /// recursive slot, the page heap and finally the kernel arena.
    pub fn boot(mmu: M, arena: A, options: HeapOptions) -> Result<Self, BootError> {
        let mut frames = FrameAllocator::new();
        let mut paging = PagingManager::bootstrap(mmu, &mut frames).map_err(BootError::Paging)?;
        paging
            .enable_recursive_mapping()
            .map_err(BootError::Paging)?;
        let page_heap = PageHeap::init(&mut paging, &mut frames).map_err(BootError::PageHeap)?;
        let heap = KernelHeap::with_options(arena, options).map_err(BootError::Heap)?;

        log::info!(
            target: "mm",
            "memory ready: {} of {} frames free",
            frames.free_frames(),
            frames.total_frames()
        );

        Ok(Self {
            frames,
            paging,
            heap,
            page_heap,
            processes: ProcessTable::new(),
            scheduler: Scheduler::new(),
            tss: TaskStateSegment::new(),
        })
    }

    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.allocate(size)
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.heap.deallocate(ptr)
    }

    pub fn acquire_page(&mut self) -> Result<PageAllocation, PageHeapError> {
        self.page_heap.acquire_page(&mut self.paging, &mut self.frames)
    }

    pub fn release_page(&mut self, vaddr: VirtAddr) -> Result<(), PageHeapError> {
        self.page_heap
            .release_page(vaddr, &mut self.paging, &mut self.frames)
    }

    pub fn map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), PagingError> {
        self.paging
            .map(vaddr, paddr, flags, &mut self.page_heap, &mut self.frames)
    }

    pub fn unmap(&mut self, vaddr: VirtAddr) -> Result<Option<PhysAddr>, PagingError> {
        self.paging.unmap(vaddr)
    }

    pub fn translate(&mut self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.paging.translate(vaddr)
    }

    pub fn load_process(&mut self, image: &[u8]) -> Result<Pid, LoadError> {
        loader::load_process(image, &mut self.processes, &mut self.paging, &mut self.frames)
    }

    pub fn for_each_process(&self, f: impl FnMut(&ProcessControlBlock)) {
        self.processes.for_each_process(f)
    }

    /// Scheduler entry for the timer interrupt.
    pub fn on_timer_tick(&mut self, frame: &TrapFrame) -> Option<Switch> {
        self.scheduler
            .on_tick(&mut self.processes, frame, &mut self.tss)
    }

    pub fn memory_report(&self) -> MemoryReport {
        MemoryReport {
            total_frames: self.frames.total_frames(),
            used_frames: self.frames.used_frames(),
            heap: self.heap.stats(),
            used_zones: self.page_heap.used_zones(),
            total_zones: PAGE_HEAP_ENTRIES,
            processes: self.processes.len(),
        }
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn heap(&self) -> &KernelHeap<A> {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut KernelHeap<A> {
        &mut self.heap
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The task state segment the GDT points at. Its address must not
    /// change once the task register is loaded.
    pub fn tss(&self) -> &TaskStateSegment {
        &self.tss
    }

    pub fn paging_mut(&mut self) -> &mut PagingManager<M> {
        &mut self.paging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{paging::user_flags, simulated::SimulatedMmu};

    type TestKernel = Kernel<SimulatedMmu, Box<[u8]>>;

    fn boot(arena: usize) -> TestKernel {
        let options = HeapOptions {
            track_allocations: true,
            validate_before_alloc: true,
        };
        Kernel::boot(SimulatedMmu::new(), vec![0u8; arena].into_boxed_slice(), options).unwrap()
    }

    #[test]
    fn test_boot_order() {
        let mut kernel = boot(4096);
        assert!(kernel.paging_mut().is_recursive());
        assert!(kernel.paging_mut().mmu().paging_enabled());
        assert_eq!(kernel.tss().ss0, 0x18);
        assert!(kernel.processes().is_empty());
        let report = kernel.memory_report();
        assert_eq!(report.used_zones, 0);
        assert_eq!(report.total_zones, 128);
        assert_eq!(report.heap.total, 4096);
        assert!(report.used_frames > 0);
    }

    #[test]
    fn test_boot_rejects_tiny_arena() {
        let result = Kernel::boot(
            SimulatedMmu::new(),
            vec![0u8; 8].into_boxed_slice(),
            HeapOptions::default(),
        );
        assert!(matches!(result, Err(BootError::Heap(HeapError::ArenaTooSmall(8)))));
    }

    #[test]
    fn test_first_fit_reuses_freed_block() {
        let mut kernel = boot(1024);
        let a = kernel.allocate(100).unwrap();
        let b = kernel.allocate(200).unwrap();
        kernel.deallocate(a).unwrap();
        let c = kernel.allocate(50).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_map_translate_unmap() {
        let mut kernel = boot(4096);
        let vaddr = VirtAddr::new(0x4000_0000);
        let frame = PhysAddr::new(0x0080_0000);

        kernel.map(vaddr, frame, user_flags()).unwrap();
        assert_eq!(kernel.translate(vaddr), Some(frame));
        assert_eq!(kernel.unmap(vaddr), Ok(Some(frame)));
        assert_eq!(kernel.translate(vaddr), None);
    }

    #[test]
    fn test_page_release_is_reported_twice() {
        let mut kernel = boot(4096);
        let page = kernel.acquire_page().unwrap();
        assert_eq!(kernel.memory_report().used_zones, 1);

        kernel.release_page(page.virt).unwrap();
        let used = kernel.frames().used_frames();
        assert_eq!(
            kernel.release_page(page.virt),
            Err(PageHeapError::AlreadyFree(page.virt))
        );
        assert_eq!(kernel.frames().used_frames(), used);
        assert_eq!(kernel.memory_report().used_zones, 0);
    }

    #[test]
    fn test_two_processes_three_ticks() {
        let mut kernel = boot(4096);
        assert_eq!(kernel.load_process(&[0x90; 32]), Ok(0));
        assert_eq!(kernel.load_process(&[0x90; 64]), Ok(1));

        let user = TrapFrame {
            cs: 0x23,
            eip: 0x4000_0004,
            user_esp: 0x4000_1FF0,
            user_ss: 0x33,
            ..TrapFrame::default()
        };
        let order: [Pid; 3] = core::array::from_fn(|_| {
            kernel.on_timer_tick(&user).map(|s| s.target).unwrap()
        });
        assert_eq!(order, [0, 1, 0]);
        assert_eq!(kernel.scheduler().switches(), 3);

        // the TSS follows the dispatched process
        let esp0 = kernel.processes().get(0).unwrap().kernel_stack.esp0;
        assert_eq!(kernel.tss().esp0, esp0);
    }

    #[test]
    fn test_for_each_process_and_report() {
        let mut kernel = boot(4096);
        kernel.load_process(&[1; 10]).unwrap();
        kernel.load_process(&[2; 5000]).unwrap();

        let mut sizes = vec![];
        kernel.for_each_process(|process| sizes.push(process.code.len()));
        assert_eq!(sizes, [4096, 8192]);

        let report = format!("{}", kernel.memory_report());
        assert!(report.contains("processes: 2"));
        assert!(report.contains("/ 128 zones"));
    }
}

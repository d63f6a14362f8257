//! A software MMU for host tests.

use std::{boxed::Box, collections::BTreeMap, vec::Vec};

use super::{Mmu, PageTable, PhysAddr, VirtAddr};

/// Physical memory is a map of lazily zero-filled frames. With paging on,
/// every access goes through a two-level walk from the loaded root.
pub(crate) struct SimulatedMmu {
    memory: BTreeMap<u32, Box<PageTable>>,
    root: PhysAddr,
    paging_enabled: bool,
    /// Every single-page invalidation, in order.
    pub flushed: Vec<VirtAddr>,
}

impl SimulatedMmu {
    pub fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            root: PhysAddr::default(),
            paging_enabled: false,
            flushed: Vec::new(),
        }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    /// Physical frame contents, bypassing translation.
    pub fn frame(&mut self, frame: PhysAddr) -> &mut PageTable {
        self.memory
            .entry(frame.align_down().as_u32())
            .or_insert_with(|| Box::new(PageTable::new()))
    }

    /// Translate like the processor would.
    pub fn walk(&mut self, addr: VirtAddr) -> Option<PhysAddr> {
        if !self.paging_enabled {
            return Some(PhysAddr::new(addr.as_u32()));
        }
        let pde = self.frame(self.root)[addr.directory_index()];
        if !pde.is_present() {
            return None;
        }
        let pte = self.frame(pde.addr())[addr.table_index()];
        if !pte.is_present() {
            return None;
        }
        Some(pte.addr().offset(addr.page_offset()))
    }
}

impl Mmu for SimulatedMmu {
    fn page(&mut self, addr: VirtAddr) -> Option<&mut PageTable> {
        if !addr.is_page_aligned() {
            return None;
        }
        let frame = self.walk(addr)?;
        Some(self.frame(frame))
    }

    fn load_directory(&mut self, directory: PhysAddr) {
        self.root = directory;
    }

    fn enable_paging(&mut self) {
        self.paging_enabled = true;
    }

    fn flush(&mut self, addr: VirtAddr) {
        self.flushed.push(addr);
    }
}

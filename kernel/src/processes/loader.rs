use crate::{
    constants::{
        gdt::{KERNEL_STACK_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_STACK_SELECTOR},
        memory::{IDENTITY_MAP_END, PAGE_SIZE, TABLE_ENTRIES, USER_OFFSET},
        processes::INITIAL_EFLAGS,
    },
    memory::{pages_for, paging::AddressSpace, FrameAllocator, Mmu, PagingManager, PhysAddr, VirtAddr},
};

use super::{
    process::{LoadError, Pid, ProcessControlBlock, ProcessFrames, ProcessTable, Region},
    registers::{KernelStack, Registers},
};

/// Create a process running `image` from the start of the user window.
///
/// The image is copied into fresh physically contiguous frames followed by
/// one zeroed stack frame, an address space is built around them, and a
/// kernel stack frame is taken for ring 0 entries. Every frame acquired
/// here is released again if a later step fails.
pub fn load_process<M: Mmu>(
    image: &[u8],
    table: &mut ProcessTable,
    paging: &mut PagingManager<M>,
    frames: &mut FrameAllocator,
) -> Result<Pid, LoadError> {
    if image.is_empty() {
        return Err(LoadError::EmptyImage);
    }
    let code_pages = pages_for(image.len());
    if code_pages + 1 > TABLE_ENTRIES {
        return Err(LoadError::ImageTooLarge(image.len()));
    }
    if table.is_full() {
        log::warn!(target: "process", "process table full");
        return Err(LoadError::TableFull);
    }

    let run = code_pages + 1;
    let code = frames.acquire_run(run).map_err(|_| {
        log::warn!(target: "process", "no {} contiguous frames for image", run);
        LoadError::FramesExhausted
    })?;

    if let Err(err) = copy_image(image, code, run, paging) {
        release_run(frames, code, run);
        return Err(err.into());
    }

    let space = match paging.create_process_address_space(code, image.len(), frames) {
        Ok(space) => space,
        Err(err) => {
            release_run(frames, code, run);
            return Err(err.into());
        }
    };

    let kernel_stack = match acquire_kernel_stack(frames) {
        Ok(frame) => frame,
        Err(err) => {
            release_run(frames, code, run);
            release_space(frames, space);
            return Err(err);
        }
    };

    let pid = table.next_pid();
    let code_end = USER_OFFSET + code_pages as u32 * PAGE_SIZE;
    let stack_end = code_end + PAGE_SIZE;

    let registers = Registers {
        eip: USER_OFFSET,
        esp: stack_end,
        eflags: INITIAL_EFLAGS,
        cs: USER_CODE_SELECTOR,
        ds: USER_DATA_SELECTOR,
        es: USER_DATA_SELECTOR,
        fs: USER_DATA_SELECTOR,
        gs: USER_DATA_SELECTOR,
        ss: USER_STACK_SELECTOR,
        cr3: space.directory.as_u32(),
        ..Registers::new()
    };

    let process = ProcessControlBlock {
        pid,
        registers,
        kernel_stack: KernelStack::new(
            KERNEL_STACK_SELECTOR,
            kernel_stack.as_u32() + PAGE_SIZE,
        ),
        code: Region {
            start: VirtAddr::new(USER_OFFSET),
            end: VirtAddr::new(code_end),
        },
        stack: Region {
            start: VirtAddr::new(code_end),
            end: VirtAddr::new(stack_end),
        },
        frames: ProcessFrames {
            image: code,
            image_frames: code_pages,
            directory: space.directory,
            user_table: space.user_table,
            kernel_stack,
        },
    };

    if let Err(err) = table.push(process) {
        release_run(frames, code, run);
        release_space(frames, space);
        let _ = frames.release_frame(kernel_stack);
        return Err(err);
    }

    log::info!(
        target: "process",
        "loaded pid {} ({} bytes) directory {} kernel stack {}",
        pid,
        image.len(),
        space.directory,
        kernel_stack
    );
    Ok(pid)
}

/// Copy `image` into `run` frames starting at `code`, zero filling the
/// tail of the last code frame and the stack frame.
fn copy_image<M: Mmu>(
    image: &[u8],
    code: PhysAddr,
    run: usize,
    paging: &mut PagingManager<M>,
) -> Result<(), crate::memory::PagingError> {
    let mut chunks = image.chunks(PAGE_SIZE as usize);
    for page in 0..run {
        let frame = code.offset(page as u32 * PAGE_SIZE);
        let chunk = chunks.next().unwrap_or(&[]);
        paging.with_frame(frame, |contents| {
            let bytes = contents.as_bytes_mut();
            bytes[..chunk.len()].copy_from_slice(chunk);
            bytes[chunk.len()..].fill(0);
        })?;
    }
    Ok(())
}

fn acquire_kernel_stack(frames: &mut FrameAllocator) -> Result<PhysAddr, LoadError> {
    let frame = frames
        .acquire_frame()
        .map_err(|_| LoadError::FramesExhausted)?;
    // ring 0 reaches its stack through the identity map
    if frame.as_u32() + PAGE_SIZE > IDENTITY_MAP_END {
        let _ = frames.release_frame(frame);
        log::warn!(target: "process", "kernel stack frame {} above identity map", frame);
        return Err(LoadError::KernelStackUnreachable(frame));
    }
    Ok(frame)
}

fn release_run(frames: &mut FrameAllocator, start: PhysAddr, count: usize) {
    for index in 0..count {
        let _ = frames.release_frame(start.offset(index as u32 * PAGE_SIZE));
    }
}

fn release_space(frames: &mut FrameAllocator, space: AddressSpace) {
    let _ = frames.release_frame(space.directory);
    let _ = frames.release_frame(space.user_table);
}

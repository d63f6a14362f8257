use core::fmt;

use crate::constants::memory::{BITMAP_BYTES, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_FRAMES};

use super::PhysAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Every frame in the pool is in use.
    Exhausted,
    /// The address lies beyond the managed physical range.
    OutOfRange(PhysAddr),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Exhausted => write!(f, "no free physical frame"),
            FrameError::OutOfRange(addr) => write!(f, "frame {} outside physical memory", addr),
        }
    }
}

/// One bit per physical frame, set when the frame is owned.
///
/// Allocation is first-fit over the frame index, so the lowest free
/// physical address is always handed out first.
pub struct FrameAllocator {
    bitmap: [u8; BITMAP_BYTES],
    used_frames: usize,
}

impl FrameAllocator {
    /// An allocator with every frame free.
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_BYTES],
            used_frames: 0,
        }
    }

    /// Forget every reservation.
    pub fn clear(&mut self) {
        self.bitmap.fill(0);
        self.used_frames = 0;
    }

    pub fn acquire_frame(&mut self) -> Result<PhysAddr, FrameError> {
        for (byte_index, byte) in self.bitmap.iter().enumerate() {
            if *byte == FULL_BITMAP_ENTRY {
                continue;
            }
            let bit = byte.trailing_ones() as usize;
            let frame = byte_index * 8 + bit;
            self.set_bit(frame);
            log::trace!(target: "mm", "acquired frame {:#x}", frame);
            return Ok(PhysAddr::from_frame_index(frame));
        }
        log::warn!(target: "mm", "physical frames exhausted");
        Err(FrameError::Exhausted)
    }

    /// Acquire `count` physically adjacent frames, lowest run first.
    pub fn acquire_run(&mut self, count: usize) -> Result<PhysAddr, FrameError> {
        if count == 0 || count > MAX_FRAMES - self.used_frames {
            return Err(FrameError::Exhausted);
        }

        let mut start = 0;
        let mut length = 0;
        let mut frame = 0;
        while frame < MAX_FRAMES {
            // whole used bytes can be skipped at a byte boundary
            if frame % 8 == 0 && self.bitmap[frame / 8] == FULL_BITMAP_ENTRY {
                length = 0;
                frame += 8;
                continue;
            }
            if self.is_bit_set(frame) {
                length = 0;
            } else {
                if length == 0 {
                    start = frame;
                }
                length += 1;
                if length == count {
                    for index in start..start + count {
                        self.set_bit(index);
                    }
                    log::trace!(target: "mm", "acquired {} frames at {:#x}", count, start);
                    return Ok(PhysAddr::from_frame_index(start));
                }
            }
            frame += 1;
        }

        log::warn!(target: "mm", "no run of {} free frames", count);
        Err(FrameError::Exhausted)
    }

    /// Clear the frame's bit. Ownership is not checked; releasing a frame
    /// that is still mapped elsewhere is the caller's bug.
    pub fn release_frame(&mut self, frame: PhysAddr) -> Result<(), FrameError> {
        let index = frame.frame_index();
        if index >= MAX_FRAMES {
            return Err(FrameError::OutOfRange(frame));
        }
        self.clear_bit(index);
        Ok(())
    }

    /// Reserve a fixed frame, e.g. the kernel image during bootstrap.
    pub fn mark_used(&mut self, frame_index: usize) {
        if frame_index < MAX_FRAMES {
            self.set_bit(frame_index);
        }
    }

    /// Mark the frames covering `[start, end)` used.
    pub fn mark_range_used(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = start.frame_index();
        let last = (end.as_u32() as usize).div_ceil(FRAME_SIZE);
        for index in first..last.min(MAX_FRAMES) {
            self.set_bit(index);
        }
    }

    pub fn is_used(&self, frame: PhysAddr) -> bool {
        let index = frame.frame_index();
        index < MAX_FRAMES && self.is_bit_set(index)
    }

    pub fn total_frames(&self) -> usize {
        MAX_FRAMES
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        MAX_FRAMES - self.used_frames
    }

    fn set_bit(&mut self, frame_index: usize) {
        let mask = 1 << (frame_index % 8);
        let byte = &mut self.bitmap[frame_index / 8];
        if *byte & mask == 0 {
            *byte |= mask;
            self.used_frames += 1;
        }
    }

    fn clear_bit(&mut self, frame_index: usize) {
        let mask = 1 << (frame_index % 8);
        let byte = &mut self.bitmap[frame_index / 8];
        if *byte & mask != 0 {
            *byte &= !mask;
            self.used_frames -= 1;
        }
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        self.bitmap[frame_index / 8] & (1 << (frame_index % 8)) != 0
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_lowest_frame() {
        let mut frames = FrameAllocator::new();
        assert_eq!(frames.acquire_frame(), Ok(PhysAddr::new(0)));
        assert_eq!(frames.acquire_frame(), Ok(PhysAddr::new(0x1000)));
        assert_eq!(frames.used_frames(), 2);
    }

    #[test]
    fn test_skips_reserved_bytes() {
        let mut frames = FrameAllocator::new();
        for index in 0..17 {
            frames.mark_used(index);
        }
        assert_eq!(frames.acquire_frame(), Ok(PhysAddr::from_frame_index(17)));
    }

    #[test]
    fn test_never_returns_used_frame() {
        let mut frames = FrameAllocator::new();
        frames.mark_used(1);
        frames.mark_used(3);
        let mut seen = [false; 8];
        for _ in 0..6 {
            let frame = frames.acquire_frame().unwrap().frame_index();
            assert!(frame != 1 && frame != 3);
            assert!(!seen[frame]);
            seen[frame] = true;
        }
    }

    #[test]
    fn test_release_then_acquire_returns_same_frame() {
        let mut frames = FrameAllocator::new();
        let mut acquired = [PhysAddr::default(); 10];
        for slot in acquired.iter_mut() {
            *slot = frames.acquire_frame().unwrap();
        }
        frames.release_frame(acquired[4]).unwrap();
        assert!(!frames.is_used(acquired[4]));
        assert_eq!(frames.acquire_frame(), Ok(acquired[4]));
    }

    #[test]
    fn test_mark_range_used() {
        let mut frames = FrameAllocator::new();
        frames.mark_range_used(PhysAddr::new(0xA0000), PhysAddr::new(0x100000));
        assert_eq!(frames.used_frames(), 0x60);
        assert!(frames.is_used(PhysAddr::new(0xA0000)));
        assert!(frames.is_used(PhysAddr::new(0xFF000)));
        assert!(!frames.is_used(PhysAddr::new(0x100000)));
    }

    #[test]
    fn test_acquire_run_finds_adjacent_frames() {
        let mut frames = FrameAllocator::new();
        frames.mark_used(2);
        frames.mark_used(5);
        // frames 0,1 and 3,4 are too short for three
        assert_eq!(frames.acquire_run(3), Ok(PhysAddr::from_frame_index(6)));
        for index in 6..9 {
            assert!(frames.is_used(PhysAddr::from_frame_index(index)));
        }
        assert_eq!(frames.acquire_run(2), Ok(PhysAddr::from_frame_index(0)));
    }

    #[test]
    fn test_exhaustion() {
        let mut frames = FrameAllocator::new();
        frames.mark_range_used(
            PhysAddr::new(0),
            PhysAddr::from_frame_index(MAX_FRAMES - 1),
        );
        assert_eq!(frames.free_frames(), 1);
        assert!(frames.acquire_frame().is_ok());
        assert_eq!(frames.acquire_frame(), Err(FrameError::Exhausted));
        assert_eq!(frames.acquire_run(1), Err(FrameError::Exhausted));
    }

    #[test]
    fn test_release_out_of_range() {
        let mut frames = FrameAllocator::new();
        let beyond = PhysAddr::from_frame_index(MAX_FRAMES);
        assert_eq!(frames.release_frame(beyond), Err(FrameError::OutOfRange(beyond)));
    }
}

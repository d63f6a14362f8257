/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 32;

/// IF set, reserved bit 1 set.
pub const INITIAL_EFLAGS: u32 = 0x202;

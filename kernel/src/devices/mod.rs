//! Devices the kernel core talks to directly. Only COM1, for logging.

pub mod serial;

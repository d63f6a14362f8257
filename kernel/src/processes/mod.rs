pub mod loader;
pub mod process;
pub mod registers;
pub mod scheduler;

pub use loader::load_process;
pub use process::{LoadError, Pid, ProcessControlBlock, ProcessTable};
pub use registers::{KernelStack, Registers};
pub use scheduler::{Scheduler, Switch, SwitchFrame};

//! The kernel - processes, queues, scheduling, signals, syscalls
//!
//! Core abstractions:
//! - `Pcb`: one control block per process, owned by the process table
//! - `RunQueues`: three ready queues (one per priority) plus the blocked
//!   queue; PIDs are the opaque handles that flow between them
//! - `Kernel`: all mutable kernel state in one value, shared behind
//!   `Rc<RefCell<..>>`; `Syscalls` is the per-process handle into it
//! - `Scheduler`: owns the user-task futures and runs them one slice at
//!   a time; the only code that touches the queues while a task is
//!   suspended

pub mod console;
pub mod events;
pub mod process;
pub mod queues;
pub mod scheduler;
pub mod signal;
pub mod syscall;
pub mod task;

#[cfg(test)]
mod invariants_test;

pub use console::Console;
pub use events::EventLog;
pub use process::{ExitKind, Pcb, Pid, ProcState, ProcessTable, WaitStatus, MAX_FDS};
pub use queues::{RunQueues, NUM_PRIO};
pub use scheduler::{Scheduler, Step};
pub use signal::{HostSignal, HostSignalSlot, Signal};
pub use syscall::{Kernel, Program, Syscalls};
pub use task::{yield_now, TaskFuture};

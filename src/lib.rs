//! rill - a teaching OS that lives entirely in user space
//!
//! Design principles:
//! - One host thread drives everything; user processes are cooperative
//!   tasks that run one time slice at a time
//! - The kernel is a single value, not process-global state; syscalls go
//!   through a per-process handle that carries the caller's PID
//! - Files live in a FAT-style image file; the whole on-disk format is
//!   a packed little-endian layout you can hexdump and understand
//!
//! Layout:
//! - `kernel`: processes, queues, scheduler, signals, syscalls
//! - `fatfs`: the block-allocated filesystem and its descriptor table
//! - `shell`: line parser, job table, and the built-in programs
//! - `boot`: wires the pieces together for the `rill` binary

pub mod boot;
pub mod errno;
pub mod fatfs;
pub mod kernel;
pub mod shell;

pub use errno::{Errno, Result};

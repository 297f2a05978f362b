//! Kernel error kinds
//!
//! One enum for every way a syscall can fail. Syscalls return
//! `Result<T, Errno>`; the `Display` impl is the perror string table, so
//! the shell can print `name: message` without its own lookup.

/// Every error a syscall can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted (e.g. signalling init)
    NotPermitted,
    /// Invalid argument (bad priority, bad seek, bad open mode, ...)
    InvalidArgument,
    /// Out of memory
    OutOfMemory,
    /// No such process
    NoSuchProcess,
    /// No child processes to wait on
    NoChild,
    /// Invalid file descriptor
    BadFd,
    /// Underlying host I/O failed
    Io,
    /// No space left on the filesystem image
    NoSpace,
    /// File is read-only
    ReadOnly,
    /// No filesystem is mounted
    NotMounted,
    /// The global descriptor table is full
    TableFull,
    /// Another descriptor holds this file open for writing
    FileInUse,
    /// Permission denied
    PermissionDenied,
    /// The process file-descriptor table is full
    TooManyOpenFiles,
    /// No such file
    NoSuchFile,
    /// File already exists
    Exists,
    /// Entry is a directory, not a regular file
    IsDirectory,
    /// File name longer than a directory entry can hold
    NameTooLong,
    /// Argument list too long
    ArgListTooLong,
    /// Could not start the process task
    ThreadFailed,
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Errno::NotPermitted => "operation not permitted",
            Errno::InvalidArgument => "invalid argument",
            Errno::OutOfMemory => "out of memory",
            Errno::NoSuchProcess => "no such process",
            Errno::NoChild => "no child processes",
            Errno::BadFd => "bad file descriptor",
            Errno::Io => "I/O error",
            Errno::NoSpace => "no space left on disk",
            Errno::ReadOnly => "file is read-only",
            Errno::NotMounted => "filesystem not mounted",
            Errno::TableFull => "open file table is full",
            Errno::FileInUse => "file is in use",
            Errno::PermissionDenied => "permission denied",
            Errno::TooManyOpenFiles => "too many open files",
            Errno::NoSuchFile => "no such file or directory",
            Errno::Exists => "file already exists",
            Errno::IsDirectory => "not a regular file",
            Errno::NameTooLong => "file name too long",
            Errno::ArgListTooLong => "argument list too long",
            Errno::ThreadFailed => "thread creation failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Errno {}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Errno::NoSuchFile,
            ErrorKind::PermissionDenied => Errno::PermissionDenied,
            ErrorKind::AlreadyExists => Errno::Exists,
            ErrorKind::InvalidInput => Errno::InvalidArgument,
            _ => Errno::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Errno>;

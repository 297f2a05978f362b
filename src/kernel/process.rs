//! Process control blocks and the process table
//!
//! The process table is the sole owner of every PCB, indexed directly by
//! PID. Parent/child links are plain PIDs resolved through the table, so
//! the (potentially cyclic) process graph never turns into an ownership
//! cycle.

use bitflags::bitflags;

use crate::errno::{Errno, Result};

/// Fixed capacity of the process table; PIDs never wrap.
pub const MAX_PROCS: usize = 1024;
/// Size of the per-process file-descriptor table.
pub const MAX_FDS: usize = 32;
/// Longest command name kept in a PCB.
pub const MAX_NAME: usize = 32;
/// Priority assigned to freshly spawned processes (0 is highest).
pub const DEFAULT_PRIO: usize = 1;

/// Bound a command name to what a PCB stores.
pub fn bounded_name(name: &str) -> String {
    if name.len() <= MAX_NAME {
        name.to_string()
    } else {
        name.chars().take(MAX_NAME).collect()
    }
}

/// Process identifier. PID 0 is reserved as "invalid"; init is PID 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl Pid {
    pub const INIT: Pid = Pid(1);
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-visible process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Ready,
    Running,
    Blocked,
    Stopped,
    Zombie,
}

impl ProcState {
    /// One-letter code used by `ps`.
    pub fn code(&self) -> char {
        match self {
            ProcState::Ready | ProcState::Running => 'R',
            ProcState::Blocked => 'B',
            ProcState::Stopped => 'S',
            ProcState::Zombie => 'Z',
        }
    }
}

/// How (whether) the process has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    None,
    Exited,
    Signaled,
    Stopped,
}

bitflags! {
    /// The wait status word reported by `waitpid`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitStatus: u8 {
        const EXITED = 0b001;
        const SIGNALED = 0b010;
        const STOPPED = 0b100;
    }
}

/// One process control block.
pub struct Pcb {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub state: ProcState,
    /// Priority 0..=2, 0 highest.
    pub prio: usize,
    /// Absolute tick at which to wake; 0 means "not a timed sleep".
    pub wake_tick: u64,
    /// One-shot edge so waitpid reports a stop exactly once.
    pub stopped_reported: bool,
    pub exit: ExitKind,
    pub cmd_name: String,
    /// Deep-copied argument vector, argv[0] included.
    pub args: Vec<String>,
    /// Children, in spawn order.
    pub children: Vec<Pid>,
    /// Local FD table: slot -> global descriptor key.
    pub fds: [Option<usize>; MAX_FDS],
}

impl Pcb {
    fn new(pid: Pid) -> Pcb {
        Pcb {
            pid,
            ppid: None,
            state: ProcState::Ready,
            prio: DEFAULT_PRIO,
            wake_tick: 0,
            stopped_reported: false,
            exit: ExitKind::None,
            cmd_name: String::new(),
            args: Vec::new(),
            children: Vec::new(),
            fds: [None; MAX_FDS],
        }
    }

    /// First free local FD slot at or above 3.
    pub fn free_fd_slot(&self) -> Option<usize> {
        (3..MAX_FDS).find(|&i| self.fds[i].is_none())
    }

    pub fn is_alive(&self) -> bool {
        self.state != ProcState::Zombie
    }
}

/// PID -> PCB, fixed capacity, monotonically increasing PID allocator.
pub struct ProcessTable {
    slots: Vec<Option<Pcb>>,
    next_pid: u32,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        let mut slots = Vec::with_capacity(MAX_PROCS);
        slots.resize_with(MAX_PROCS, || None);
        ProcessTable { slots, next_pid: 1 }
    }

    /// Allocate a PCB in state READY (not yet enqueued). With a parent,
    /// the FD table is inherited and the child is appended to the
    /// parent's child list.
    pub fn create(&mut self, parent: Option<Pid>) -> Result<Pid> {
        if self.next_pid as usize >= MAX_PROCS {
            return Err(Errno::OutOfMemory);
        }
        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let mut pcb = Pcb::new(pid);
        if let Some(ppid) = parent {
            let parent_pcb = self.get_mut(ppid).ok_or(Errno::NoSuchProcess)?;
            pcb.ppid = Some(ppid);
            pcb.fds = parent_pcb.fds;
            parent_pcb.children.push(pid);
        }

        self.slots[pid.0 as usize] = Some(pcb);
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots.get_mut(pid.0 as usize)?.as_mut()
    }

    /// Free a PCB slot outright. Callers handle unlinking from parents.
    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        self.slots.get_mut(pid.0 as usize)?.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Live PIDs, ascending.
    pub fn pids(&self) -> Vec<Pid> {
        self.iter().map(|p| p.pid).collect()
    }

    /// Drop every PCB. Shutdown only.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assigns_increasing_pids() {
        let mut table = ProcessTable::new();
        let a = table.create(None).unwrap();
        let b = table.create(Some(a)).unwrap();
        assert_eq!(a, Pid(1));
        assert_eq!(b, Pid(2));
        assert_eq!(table.get(b).unwrap().ppid, Some(a));
        assert_eq!(table.get(a).unwrap().children, vec![b]);
    }

    #[test]
    fn test_child_inherits_fd_table() {
        let mut table = ProcessTable::new();
        let a = table.create(None).unwrap();
        {
            let pcb = table.get_mut(a).unwrap();
            pcb.fds[0] = Some(0);
            pcb.fds[1] = Some(1);
            pcb.fds[5] = Some(42);
        }
        let b = table.create(Some(a)).unwrap();
        let child = table.get(b).unwrap();
        assert_eq!(child.fds[0], Some(0));
        assert_eq!(child.fds[5], Some(42));
    }

    #[test]
    fn test_free_fd_slot_skips_standard_streams() {
        let mut table = ProcessTable::new();
        let a = table.create(None).unwrap();
        let pcb = table.get_mut(a).unwrap();
        assert_eq!(pcb.free_fd_slot(), Some(3));
        pcb.fds[3] = Some(7);
        assert_eq!(pcb.free_fd_slot(), Some(4));
    }

    #[test]
    fn test_default_priority() {
        let mut table = ProcessTable::new();
        let a = table.create(None).unwrap();
        assert_eq!(table.get(a).unwrap().prio, 1);
        assert_eq!(table.get(a).unwrap().state, ProcState::Ready);
    }
}

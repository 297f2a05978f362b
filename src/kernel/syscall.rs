//! The kernel and its syscall surface
//!
//! All mutable kernel state lives in one `Kernel` value shared behind
//! `Rc<RefCell<..>>`. User programs never see it directly: each process
//! gets a `Syscalls` handle (the shared kernel plus its own PID) and
//! every system call goes through that handle. Blocking calls are
//! `async` and suspend the caller's task; everything else borrows the
//! kernel briefly and returns.
//!
//! Borrow discipline: no borrow is ever held across an `.await`. The
//! scheduler owns the task futures outside the `RefCell`, so polling a
//! task that immediately makes syscalls cannot double-borrow.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info};

use super::console::Console;
use super::events::EventLog;
use super::process::{ExitKind, Pid, ProcState, ProcessTable, WaitStatus, MAX_FDS};
use super::queues::{RunQueues, NUM_PRIO};
use super::signal::{HostSignal, HostSignalSlot, Signal};
use super::task::{halt, yield_now, TaskFuture, UserTask};
use crate::errno::{Errno, Result};
use crate::fatfs::{mkfs as fat_mkfs, FatFs, OpenMode, Volume, Whence};

/// Entry point of a user program: it receives its syscall handle and a
/// deep-copied argument vector, and returns the task future to run.
pub type Program = fn(Syscalls, Vec<String>) -> TaskFuture;

/// Fixed schedule realizing the 9:6:4 priority weighting. A rotating
/// cursor walks this; each slot names the preferred ready queue.
const SCHEDULE: [usize; 19] = [0, 1, 0, 2, 0, 1, 0, 2, 0, 1, 0, 1, 0, 2, 0, 1, 0, 2, 1];

/// A row of `ps` output.
#[derive(Debug, Clone)]
pub struct ProcSnapshot {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub prio: usize,
    pub state: ProcState,
    pub cmd: String,
}

pub struct Kernel {
    pub(crate) procs: ProcessTable,
    pub(crate) queues: RunQueues,
    pub(crate) fs: Option<FatFs>,
    pub(crate) events: EventLog,
    pub(crate) console: Console,
    pub(crate) host_signals: HostSignalSlot,
    pub(crate) tick: u64,
    pub(crate) current: Option<Pid>,
    pub(crate) foreground: Option<Pid>,
    shutdown: bool,
    schedule_idx: usize,
    pending_tasks: Vec<UserTask>,
}

impl Kernel {
    pub fn new(events: EventLog, console: Console) -> Kernel {
        Kernel {
            procs: ProcessTable::new(),
            queues: RunQueues::new(),
            fs: None,
            events,
            console,
            host_signals: HostSignalSlot::new(),
            tick: 0,
            current: None,
            foreground: None,
            shutdown: false,
            schedule_idx: 0,
            pending_tasks: Vec::new(),
        }
    }

    /// Shareable handle for the host side (terminal hooks) to record
    /// interrupt/stop events into.
    pub fn host_signal_slot(&self) -> HostSignalSlot {
        self.host_signals.clone()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    // ========== FILESYSTEM LIFECYCLE ==========

    /// Format a fresh image. Refused while a filesystem is mounted.
    pub fn mkfs(&mut self, path: &Path, fat_blocks: usize, size_index: usize) -> Result<()> {
        if self.fs.is_some() {
            return Err(Errno::NotPermitted);
        }
        fat_mkfs(path, fat_blocks, size_index)
    }

    pub fn mount(&mut self, path: &Path) -> Result<()> {
        if self.fs.is_some() {
            return Err(Errno::NotPermitted);
        }
        self.fs = Some(FatFs::new(Volume::mount(path)?));
        Ok(())
    }

    pub fn unmount(&mut self) -> Result<()> {
        match self.fs.take() {
            Some(fs) => fs.unmount(),
            None => Err(Errno::NotMounted),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }

    /// Snapshot of every live process.
    pub fn processes(&self) -> Vec<ProcSnapshot> {
        self.procs
            .iter()
            .map(|p| ProcSnapshot {
                pid: p.pid,
                ppid: p.ppid,
                prio: p.prio,
                state: p.state,
                cmd: p.cmd_name.clone(),
            })
            .collect()
    }

    pub fn process_state(&self, pid: Pid) -> Option<ProcState> {
        self.procs.get(pid).map(|p| p.state)
    }

    /// The process whose slice is in progress, if any.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    fn fs_mut(&mut self) -> Result<&mut FatFs> {
        self.fs.as_mut().ok_or(Errno::NotMounted)
    }

    // ========== EVENT LOG ==========

    pub(crate) fn log_event(&mut self, event: &str, pid: Pid) {
        let Kernel { procs, events, tick, .. } = self;
        if let Some(pcb) = procs.get(pid) {
            events.record(*tick, event, pcb);
        }
    }

    fn log_nice(&mut self, pid: Pid, old_prio: usize, new_prio: usize) {
        let Kernel { procs, events, tick, .. } = self;
        if let Some(pcb) = procs.get(pid) {
            events.record_nice(*tick, pcb, old_prio, new_prio);
        }
    }

    // ========== QUEUE TRANSITIONS ==========

    /// Queue a READY process on the ready queue of its priority.
    pub(crate) fn enqueue(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.get(pid) else { return };
        if pcb.state != ProcState::Ready || pcb.prio >= NUM_PRIO {
            return;
        }
        self.queues.push_ready(pcb.prio, pid);
    }

    pub(crate) fn dequeue(&mut self, prio: usize) -> Option<Pid> {
        self.queues.pop_ready(prio)
    }

    /// Move a process to the blocked queue.
    pub(crate) fn block(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.get_mut(pid) else { return };
        let prio = pcb.prio;
        pcb.state = ProcState::Blocked;
        self.queues.remove_ready(prio, pid);
        self.queues.push_blocked(pid);
        self.log_event("BLOCKED", pid);
    }

    /// Back to ready; the counterpart of `block`.
    pub(crate) fn unblock(&mut self, pid: Pid) {
        if self.procs.get(pid).is_none() {
            return;
        }
        self.queues.remove_blocked(pid);
        if let Some(pcb) = self.procs.get_mut(pid) {
            pcb.state = ProcState::Ready;
        }
        self.enqueue(pid);
        self.log_event("UNBLOCKED", pid);
    }

    /// Stop a process: out of every queue, and the parent waiting in an
    /// indefinite wait is woken so it can observe the state change.
    pub(crate) fn stop(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.get_mut(pid) else { return };
        let prio = pcb.prio;
        pcb.state = ProcState::Stopped;
        pcb.stopped_reported = false;
        let parent = pcb.ppid;
        self.queues.remove_ready(prio, pid);
        self.queues.remove_blocked(pid);
        if let Some(pp) = parent {
            if let Some(ppcb) = self.procs.get(pp) {
                if ppcb.state == ProcState::Blocked && ppcb.wake_tick == 0 {
                    self.unblock(pp);
                }
            }
        }
        self.log_event("STOPPED", pid);
    }

    /// Resume a stopped process.
    pub(crate) fn continue_(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.get_mut(pid) else { return };
        if pcb.state != ProcState::Stopped {
            return;
        }
        pcb.state = ProcState::Ready;
        self.enqueue(pid);
        self.log_event("CONTINUED", pid);
    }

    /// Wake every sleeper whose deadline has passed.
    pub(crate) fn tick_sleep_check(&mut self) {
        for pid in self.queues.blocked_pids() {
            let due = match self.procs.get(pid) {
                Some(pcb) => pcb.wake_tick > 0 && pcb.wake_tick <= self.tick,
                None => false,
            };
            if due {
                if let Some(pcb) = self.procs.get_mut(pid) {
                    pcb.wake_tick = 0;
                }
                self.unblock(pid);
            }
        }
    }

    /// Re-home a READY process between ready queues; logs NICE.
    pub(crate) fn set_priority(&mut self, pid: Pid, prio: usize) {
        let Some(pcb) = self.procs.get_mut(pid) else { return };
        if prio >= NUM_PRIO || pcb.prio == prio {
            return;
        }
        let old = pcb.prio;
        let state = pcb.state;
        pcb.prio = prio;
        self.log_nice(pid, old, prio);
        if state == ProcState::Ready {
            self.queues.remove_ready(old, pid);
            self.enqueue(pid);
        }
    }

    pub(crate) fn remove_from_queues(&mut self, pid: Pid) {
        self.queues.remove_everywhere(pid);
    }

    /// Weighted pick: advance the schedule cursor until it lands on a
    /// non-empty ready queue. Empty system picks 0 (caller idles).
    pub(crate) fn pick_queue(&mut self) -> usize {
        let has: Vec<bool> = (0..NUM_PRIO)
            .map(|p| !self.queues.ready_is_empty(p))
            .collect();
        if !has.iter().any(|&b| b) {
            return 0;
        }
        for _ in 0..SCHEDULE.len() {
            let q = SCHEDULE[self.schedule_idx];
            self.schedule_idx = (self.schedule_idx + 1) % SCHEDULE.len();
            if has[q] {
                return q;
            }
        }
        0
    }

    // ========== PROCESS LIFECYCLE ==========

    /// Transition a process to ZOMBIE: out of all queues, every FD slot
    /// at index 3 and above closed, children re-parented to init, the
    /// waiting parent woken. Idempotent once the process is a zombie.
    pub(crate) fn terminate(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.get(pid) else { return };
        if pcb.state == ProcState::Zombie {
            return;
        }
        if pcb.exit == ExitKind::Signaled {
            self.log_event("SIGNALED", pid);
        }

        self.remove_from_queues(pid);

        // FD cleanup happens before the state flips: no GDT entry may
        // outlive its process.
        let keys: Vec<usize> = {
            let pcb = match self.procs.get_mut(pid) {
                Some(p) => p,
                None => return,
            };
            (3..MAX_FDS).filter_map(|i| pcb.fds[i].take()).collect()
        };
        if let Some(fs) = self.fs.as_mut() {
            for key in keys {
                let _ = fs.close(key);
            }
        }

        if let Some(pcb) = self.procs.get_mut(pid) {
            pcb.state = ProcState::Zombie;
        }
        self.log_event("ZOMBIE", pid);

        if pid != Pid::INIT {
            self.adopt_orphans(pid);
        }

        let parent = self.procs.get(pid).and_then(|p| p.ppid);
        if let Some(pp) = parent {
            if let Some(ppcb) = self.procs.get(pp) {
                if ppcb.state == ProcState::Blocked && ppcb.wake_tick == 0 {
                    self.unblock(pp);
                }
            }
        }
    }

    /// Re-parent every child of `pid` to init. Init is woken if it was
    /// in an indefinite wait and just gained a zombie to reap.
    fn adopt_orphans(&mut self, pid: Pid) {
        let children: Vec<Pid> = match self.procs.get_mut(pid) {
            Some(pcb) => std::mem::take(&mut pcb.children),
            None => return,
        };
        let mut has_zombie = false;
        for child in children {
            if let Some(cpcb) = self.procs.get_mut(child) {
                cpcb.ppid = Some(Pid::INIT);
                if cpcb.state == ProcState::Zombie {
                    has_zombie = true;
                }
            }
            if let Some(init) = self.procs.get_mut(Pid::INIT) {
                init.children.push(child);
            }
            self.log_event("ORPHAN", child);
        }
        if has_zombie {
            if let Some(init) = self.procs.get(Pid::INIT) {
                if init.state == ProcState::Blocked && init.wake_tick == 0 {
                    self.unblock(Pid::INIT);
                }
            }
        }
    }

    /// Reap one ZOMBIE child: unlink it from the parent and free the
    /// PCB slot. The scheduler drops the task future separately.
    pub(crate) fn reap_zombie(&mut self, parent: Pid, child: Pid) {
        let is_zombie_child = {
            let Some(ppcb) = self.procs.get(parent) else { return };
            ppcb.children.contains(&child)
                && self
                    .procs
                    .get(child)
                    .map(|c| c.state == ProcState::Zombie)
                    .unwrap_or(false)
        };
        if !is_zombie_child {
            return;
        }
        self.log_event("WAITED", child);
        if let Some(ppcb) = self.procs.get_mut(parent) {
            if let Some(i) = ppcb.children.iter().position(|&c| c == child) {
                ppcb.children.remove(i);
            }
        }
        self.procs.remove(child);
    }

    /// Shutdown path: every PCB is released unconditionally. The
    /// scheduler has already dropped (cancelled) the task futures.
    pub(crate) fn kill_all(&mut self) {
        let pids = self.procs.pids();
        debug!("kill_all: releasing {} processes", pids.len());
        for pid in pids {
            self.remove_from_queues(pid);
        }
        self.procs.clear();
        self.current = None;
        self.foreground = None;
    }

    // ========== SIGNALS ==========

    /// Apply a kernel signal to a process.
    pub(crate) fn deliver_signal(&mut self, pid: Pid, sig: Signal) {
        match sig {
            Signal::Term => {
                let alive = self
                    .procs
                    .get(pid)
                    .map(|p| p.state != ProcState::Zombie)
                    .unwrap_or(false);
                if alive {
                    if let Some(pcb) = self.procs.get_mut(pid) {
                        pcb.exit = ExitKind::Signaled;
                    }
                    self.terminate(pid);
                }
            }
            Signal::Stop => {
                let alive = self
                    .procs
                    .get(pid)
                    .map(|p| p.state != ProcState::Zombie)
                    .unwrap_or(false);
                if alive {
                    self.stop(pid);
                }
            }
            Signal::Cont => self.continue_(pid),
            Signal::Chld => {}
        }
    }

    /// Drain the host-signal slot and relay to the foreground process.
    /// Nothing happens without a foreground process, and init never
    /// receives terminal signals.
    pub(crate) fn check_host_signals(&mut self) {
        let Some(host_sig) = self.host_signals.take() else { return };
        let Some(fg) = self.foreground else { return };
        if fg == Pid::INIT || self.procs.get(fg).is_none() {
            return;
        }
        let sig = match host_sig {
            HostSignal::Interrupt => Signal::Term,
            HostSignal::TerminalStop => Signal::Stop,
            HostSignal::TerminalQuit => return,
        };
        debug!("relaying host signal {:?} to foreground {}", host_sig, fg);
        self.deliver_signal(fg, sig);
    }

    // ========== SCHEDULER HOOKS ==========

    pub(crate) fn begin_slice(&mut self, pid: Pid) {
        self.current = Some(pid);
        if let Some(pcb) = self.procs.get_mut(pid) {
            pcb.state = ProcState::Running;
        }
        self.log_event("SCHEDULE", pid);
    }

    /// A slice ended: a process that is still RUNNING simply used up its
    /// time and goes back on its ready queue.
    pub(crate) fn end_slice(&mut self, pid: Pid) {
        if let Some(pcb) = self.procs.get_mut(pid) {
            if pcb.state == ProcState::Running {
                pcb.state = ProcState::Ready;
                self.enqueue(pid);
            }
        }
        self.current = None;
    }

    /// The task future ran to completion. Falling off the end of a
    /// program is an implicit exit.
    pub(crate) fn task_returned(&mut self, pid: Pid) {
        let alive = self
            .procs
            .get(pid)
            .map(|p| p.state != ProcState::Zombie)
            .unwrap_or(false);
        if alive {
            if let Some(pcb) = self.procs.get_mut(pid) {
                pcb.exit = ExitKind::Exited;
            }
            self.log_event("EXITED", pid);
            self.terminate(pid);
        }
    }

    pub(crate) fn advance_tick(&mut self) {
        self.tick += 1;
    }

    pub(crate) fn take_pending_tasks(&mut self) -> Vec<UserTask> {
        std::mem::take(&mut self.pending_tasks)
    }

    fn resolve_fd(&self, pid: Pid, fd: usize) -> Result<usize> {
        if fd >= MAX_FDS {
            return Err(Errno::BadFd);
        }
        self.procs
            .get(pid)
            .ok_or(Errno::NoSuchProcess)?
            .fds[fd]
            .ok_or(Errno::BadFd)
    }
}

// ============================================================================
// Syscall handle
// ============================================================================

/// The per-process view of the kernel: the syscall surface.
#[derive(Clone)]
pub struct Syscalls {
    kernel: Rc<RefCell<Kernel>>,
    pid: Pid,
}

impl Syscalls {
    pub(crate) fn new(kernel: Rc<RefCell<Kernel>>, pid: Pid) -> Syscalls {
        Syscalls { kernel, pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn kernel_ref(&self) -> &Rc<RefCell<Kernel>> {
        &self.kernel
    }

    // ========== PROCESS SYSCALLS ==========

    /// Create and start a child process running `prog`. With a
    /// redirection path the child enters through a wrapper that rewires
    /// its FD table before (and after) the program runs.
    pub fn spawn(
        &self,
        prog: Program,
        argv: Vec<String>,
        stdin_file: Option<&str>,
        stdout_file: Option<&str>,
        append: bool,
    ) -> Result<Pid> {
        let child = {
            let mut k = self.kernel.borrow_mut();
            let child = k.procs.create(Some(self.pid))?;
            {
                let pcb = k.procs.get_mut(child).ok_or(Errno::NoSuchProcess)?;
                pcb.cmd_name = match argv.first() {
                    Some(name) => super::process::bounded_name(name),
                    None => "<unknown>".to_string(),
                };
                pcb.args = argv.clone();
            }
            k.log_event("CREATE", child);
            child
        };

        // The constructor may touch the kernel, so no borrow is held
        // while the future is built.
        let child_sys = Syscalls::new(self.kernel.clone(), child);
        let future: TaskFuture = if stdin_file.is_some() || stdout_file.is_some() {
            Box::pin(redirect_entry(
                child_sys,
                prog,
                argv,
                stdin_file.map(String::from),
                stdout_file.map(String::from),
                append,
            ))
        } else {
            prog(child_sys, argv)
        };

        let mut k = self.kernel.borrow_mut();
        k.pending_tasks.push(UserTask { pid: child, future });
        k.enqueue(child);
        Ok(child)
    }

    /// Wait for a child to change state. `target` of `None` matches any
    /// child. Returns `Ok(None)` only with `nohang` when nothing has
    /// changed; otherwise blocks until a child exits, is signalled, or
    /// stops (a stop is reported exactly once).
    pub async fn waitpid(
        &self,
        target: Option<Pid>,
        nohang: bool,
    ) -> Result<Option<(Pid, WaitStatus)>> {
        {
            let k = self.kernel.borrow();
            let pcb = k.procs.get(self.pid).ok_or(Errno::NoSuchProcess)?;
            if pcb.children.is_empty() {
                return Err(Errno::NoChild);
            }
        }

        loop {
            let found = {
                let mut k = self.kernel.borrow_mut();
                let children: Vec<Pid> = k
                    .procs
                    .get(self.pid)
                    .ok_or(Errno::NoSuchProcess)?
                    .children
                    .clone();

                let mut found = None;
                for child in children {
                    if let Some(t) = target {
                        if child != t {
                            continue;
                        }
                    }
                    let Some(cpcb) = k.procs.get(child) else { continue };
                    match cpcb.state {
                        ProcState::Zombie => {
                            let status = match cpcb.exit {
                                ExitKind::Exited => WaitStatus::EXITED,
                                ExitKind::Signaled => WaitStatus::SIGNALED,
                                ExitKind::Stopped => WaitStatus::STOPPED,
                                ExitKind::None => WaitStatus::empty(),
                            };
                            k.reap_zombie(self.pid, child);
                            found = Some((child, status));
                            break;
                        }
                        ProcState::Stopped if !cpcb.stopped_reported => {
                            if let Some(c) = k.procs.get_mut(child) {
                                c.stopped_reported = true;
                            }
                            found = Some((child, WaitStatus::STOPPED));
                            break;
                        }
                        _ => {}
                    }
                }

                if found.is_none() && !nohang {
                    // Indefinite wait: wake-tick 0 marks "until a child
                    // changes state", not a timed sleep.
                    if let Some(pcb) = k.procs.get_mut(self.pid) {
                        pcb.wake_tick = 0;
                    }
                    k.block(self.pid);
                }
                found
            };

            match found {
                Some(res) => return Ok(Some(res)),
                None if nohang => return Ok(None),
                None => yield_now().await,
            }
        }
    }

    /// Send a signal by number (0 term, 1 stop, 2 cont). Init is
    /// untouchable.
    pub fn kill(&self, pid: Pid, sig_num: i32) -> Result<()> {
        if pid == Pid::INIT {
            return Err(Errno::NotPermitted);
        }
        let sig = Signal::from_num(sig_num).ok_or(Errno::InvalidArgument)?;
        let mut k = self.kernel.borrow_mut();
        if k.procs.get(pid).is_none() {
            return Err(Errno::NoSuchProcess);
        }
        if sig == Signal::Term {
            if let Some(pcb) = k.procs.get_mut(pid) {
                pcb.exit = ExitKind::Signaled;
            }
        }
        k.deliver_signal(pid, sig);
        Ok(())
    }

    /// Exit the calling process. The task never resumes past this.
    pub async fn exit(&self) {
        {
            let mut k = self.kernel.borrow_mut();
            let alive = k
                .procs
                .get(self.pid)
                .map(|p| p.state != ProcState::Zombie)
                .unwrap_or(false);
            if alive {
                if let Some(pcb) = k.procs.get_mut(self.pid) {
                    pcb.exit = ExitKind::Exited;
                }
                k.log_event("EXITED", self.pid);
                k.terminate(self.pid);
            }
        }
        halt().await;
    }

    /// Change a process's priority.
    pub fn nice(&self, pid: Pid, prio: usize) -> Result<()> {
        if prio >= NUM_PRIO {
            return Err(Errno::InvalidArgument);
        }
        let mut k = self.kernel.borrow_mut();
        if k.procs.get(pid).is_none() {
            return Err(Errno::NoSuchProcess);
        }
        k.set_priority(pid, prio);
        Ok(())
    }

    /// Sleep for `ticks` scheduler ticks. Premature wakes (stop/cont)
    /// re-enter the sleep until the deadline passes.
    pub async fn sleep(&self, ticks: u64) {
        if ticks == 0 {
            return;
        }
        {
            let mut k = self.kernel.borrow_mut();
            let deadline = k.tick + ticks;
            if let Some(pcb) = k.procs.get_mut(self.pid) {
                pcb.wake_tick = deadline;
            }
        }
        loop {
            let sleeping = {
                let mut k = self.kernel.borrow_mut();
                let now = k.tick;
                let still = k
                    .procs
                    .get(self.pid)
                    .map(|p| p.wake_tick > 0 && now < p.wake_tick)
                    .unwrap_or(false);
                if still {
                    k.block(self.pid);
                }
                still
            };
            if !sleeping {
                return;
            }
            yield_now().await;
        }
    }

    pub fn shutdown(&self) {
        info!("shutdown requested by {}", self.pid);
        self.kernel.borrow_mut().request_shutdown();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.kernel.borrow().shutdown_requested()
    }

    /// Nominate the process that owns the terminal (None releases it).
    pub fn set_foreground(&self, pid: Option<Pid>) {
        self.kernel.borrow_mut().foreground = pid;
    }

    /// Snapshot of every process, for `ps`.
    pub fn processes(&self) -> Vec<ProcSnapshot> {
        self.kernel.borrow().processes()
    }

    // ========== FILE SYSCALLS ==========

    /// Open a file, binding a free local FD slot (>= 3) to a fresh
    /// descriptor-table entry.
    pub fn open(&self, name: &str, mode: OpenMode) -> Result<usize> {
        let mut k = self.kernel.borrow_mut();
        let slot = k
            .procs
            .get(self.pid)
            .ok_or(Errno::NoSuchProcess)?
            .free_fd_slot()
            .ok_or(Errno::TooManyOpenFiles)?;
        let key = k.fs_mut()?.open(name, mode)?;
        if let Some(pcb) = k.procs.get_mut(self.pid) {
            pcb.fds[slot] = Some(key);
        }
        Ok(slot)
    }

    /// Read up to `n` bytes. FD 0 reads the console and yields slices
    /// until input arrives (or EOF); files read synchronously.
    pub async fn read(&self, fd: usize, n: usize) -> Result<Vec<u8>> {
        let key = self.kernel.borrow().resolve_fd(self.pid, fd)?;
        if key == 0 {
            loop {
                {
                    let mut k = self.kernel.borrow_mut();
                    k.console.pump();
                    if let Some(data) = k.console.take(n) {
                        return Ok(data);
                    }
                }
                yield_now().await;
            }
        }

        let mut k = self.kernel.borrow_mut();
        let mut buf = vec![0u8; n];
        let got = k.fs_mut()?.read(key, &mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    /// Write to a descriptor. Keys 1/2 go to the host terminal whether
    /// or not a filesystem is mounted.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let key = self.kernel.borrow().resolve_fd(self.pid, fd)?;
        match key {
            0 => Err(Errno::PermissionDenied),
            1 => {
                std::io::stdout().write_all(buf).map_err(|_| Errno::Io)?;
                std::io::stdout().flush().ok();
                Ok(buf.len())
            }
            2 => {
                std::io::stderr().write_all(buf).map_err(|_| Errno::Io)?;
                Ok(buf.len())
            }
            key => self.kernel.borrow_mut().fs_mut()?.write(key, buf),
        }
    }

    /// Convenience for text output.
    pub fn write_str(&self, fd: usize, text: &str) -> Result<usize> {
        self.write(fd, text.as_bytes())
    }

    pub fn close(&self, fd: usize) -> Result<()> {
        let mut k = self.kernel.borrow_mut();
        let key = k.resolve_fd(self.pid, fd)?;
        k.fs_mut()?.close(key)?;
        if let Some(pcb) = k.procs.get_mut(self.pid) {
            pcb.fds[fd] = None;
        }
        Ok(())
    }

    pub fn lseek(&self, fd: usize, offset: i64, whence: Whence) -> Result<u64> {
        let mut k = self.kernel.borrow_mut();
        let key = k.resolve_fd(self.pid, fd)?;
        k.fs_mut()?.seek(key, offset, whence)
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        self.kernel.borrow_mut().fs_mut()?.unlink(name)
    }

    pub fn chmod(&self, name: &str, mode_word: u8) -> Result<()> {
        self.kernel.borrow_mut().fs_mut()?.chmod(name, mode_word)
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.kernel.borrow_mut().fs_mut()?.rename(src, dst)
    }

    pub fn check_executable(&self, name: &str) -> Result<()> {
        self.kernel.borrow_mut().fs_mut()?.check_executable(name)
    }

    /// List one file or the whole root directory through the caller's
    /// stdout (so redirection applies).
    pub fn ls(&self, filename: Option<&str>) -> Result<()> {
        let lines = {
            let mut k = self.kernel.borrow_mut();
            let mut lines = Vec::new();
            k.fs_mut()?
                .scan_dir(filename, |e| lines.push(crate::fatfs::ops::format_dirent(e)))?;
            lines
        };
        for line in lines {
            self.write_str(1, &line)?;
            self.write_str(1, "\n")?;
        }
        Ok(())
    }

    /// Pull a host file into a writable descriptor (`cp -h SRC DST`).
    pub fn copy_from_host(&self, host_path: &str, fd: usize) -> Result<()> {
        let mut k = self.kernel.borrow_mut();
        let key = k.resolve_fd(self.pid, fd)?;
        k.fs_mut()?.copy_from_host(Path::new(host_path), key)
    }

    /// Push a readable descriptor out to a host file (`cp SRC -h DST`).
    pub fn copy_to_host(&self, fd: usize, host_path: &str) -> Result<()> {
        let mut k = self.kernel.borrow_mut();
        let key = k.resolve_fd(self.pid, fd)?;
        k.fs_mut()?.copy_to_host(key, Path::new(host_path))
    }

    // ========== FILESYSTEM LIFECYCLE (shell subroutines) ==========

    pub fn mkfs(&self, path: &str, fat_blocks: usize, size_index: usize) -> Result<()> {
        self.kernel
            .borrow_mut()
            .mkfs(Path::new(path), fat_blocks, size_index)
    }

    pub fn mount(&self, path: &str) -> Result<()> {
        self.kernel.borrow_mut().mount(Path::new(path))
    }

    pub fn unmount(&self) -> Result<()> {
        self.kernel.borrow_mut().unmount()
    }
}

// ============================================================================
// Redirection wrapper
// ============================================================================

/// Restores the redirected FD slots on every exit path, including
/// cancellation (the guard drops with the future).
struct RedirectGuard {
    sys: Syscalls,
    /// `Some(original_key)` per stream iff that stream was redirected.
    saved_stdin: Option<Option<usize>>,
    saved_stdout: Option<Option<usize>>,
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        let mut k = self.sys.kernel.borrow_mut();
        for (slot, saved) in [(0usize, self.saved_stdin), (1usize, self.saved_stdout)] {
            let Some(original) = saved else { continue };
            let current = k
                .procs
                .get(self.sys.pid)
                .and_then(|p| p.fds[slot]);
            if current != original {
                if let (Some(key), Some(fs)) = (current, k.fs.as_mut()) {
                    let _ = fs.close(key);
                }
                if let Some(pcb) = k.procs.get_mut(self.sys.pid) {
                    pcb.fds[slot] = original;
                }
            }
        }
    }
}

/// Child-side entry for spawns with redirection: open stdout first
/// (truncation must win), then stdin, splice the new keys into slots
/// 1/0, then run the real program.
async fn redirect_entry(
    sys: Syscalls,
    prog: Program,
    argv: Vec<String>,
    stdin_file: Option<String>,
    stdout_file: Option<String>,
    append: bool,
) {
    if append {
        if let (Some(i), Some(o)) = (&stdin_file, &stdout_file) {
            if i == o {
                let _ = sys.write_str(
                    2,
                    "error: input and output files cannot be the same in append mode\n",
                );
                sys.exit().await;
            }
        }
    }

    let (saved0, saved1) = {
        let k = sys.kernel.borrow();
        match k.procs.get(sys.pid) {
            Some(pcb) => (pcb.fds[0], pcb.fds[1]),
            None => return,
        }
    };
    let _guard = RedirectGuard {
        sys: sys.clone(),
        saved_stdin: stdin_file.is_some().then_some(saved0),
        saved_stdout: stdout_file.is_some().then_some(saved1),
    };

    if let Some(path) = &stdout_file {
        let mode = if append { OpenMode::Append } else { OpenMode::Write };
        match sys.open(path, mode) {
            Ok(fd) => sys.move_fd(fd, 1),
            Err(e) => {
                let _ = sys.write_str(2, &format!("{}: {}\n", path, e));
                sys.exit().await;
            }
        }
    }

    if let Some(path) = &stdin_file {
        match sys.open(path, OpenMode::Read) {
            Ok(fd) => sys.move_fd(fd, 0),
            Err(e) => {
                let _ = sys.write_str(2, &format!("{}: {}\n", path, e));
                sys.exit().await;
            }
        }
    }

    prog(sys.clone(), argv).await;
}

impl Syscalls {
    /// Move a descriptor key between local FD slots (redirection only).
    fn move_fd(&self, from: usize, to: usize) {
        let mut k = self.kernel.borrow_mut();
        if let Some(pcb) = k.procs.get_mut(self.pid) {
            pcb.fds[to] = pcb.fds[from].take();
        }
    }
}

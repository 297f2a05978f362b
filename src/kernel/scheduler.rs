//! The scheduler loop
//!
//! One iteration = one time slice:
//! 1. pump console input and drain any pending host signal
//! 2. bail out if shutdown was requested
//! 3. weighted-pick a ready queue and dequeue its head; idle if empty
//! 4. mark it RUNNING, log SCHEDULE, and poll its task once
//! 5. wake due sleepers, requeue the task if it is still RUNNING,
//!    advance the tick
//!
//! The scheduler owns the task futures and is the only place they are
//! polled or dropped, always outside any kernel borrow; dropping a
//! future is cancellation, and a `RedirectGuard` living inside it may
//! borrow the kernel on the way down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use log::{debug, info};

use super::process::{Pid, ProcState};
use super::syscall::{Kernel, Program, Syscalls};
use super::task::{poll_once, TaskFuture};

/// What one `step` did; `run` exits on `Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A process ran for the slice.
    Ran,
    /// No runnable process; the slice idled.
    Idle,
    /// The shutdown flag is set.
    Shutdown,
}

pub struct Scheduler {
    kernel: Rc<RefCell<Kernel>>,
    tasks: HashMap<Pid, TaskFuture>,
    slice: Duration,
}

impl Scheduler {
    /// `slice` is the wall-clock length of a tick in `run`; zero
    /// disables pacing (tests drive `step` directly).
    pub fn new(kernel: Rc<RefCell<Kernel>>, slice: Duration) -> Scheduler {
        Scheduler {
            kernel,
            tasks: HashMap::new(),
            slice,
        }
    }

    pub fn kernel(&self) -> Rc<RefCell<Kernel>> {
        self.kernel.clone()
    }

    /// Create a parentless root process (init) running `prog` at
    /// priority 0 with the standard streams installed, and enqueue it.
    pub fn spawn_root(&mut self, name: &str, prog: Program) -> crate::Result<Pid> {
        let pid = {
            let mut k = self.kernel.borrow_mut();
            let pid = k.procs.create(None)?;
            {
                let pcb = k
                    .procs
                    .get_mut(pid)
                    .ok_or(crate::Errno::NoSuchProcess)?;
                pcb.cmd_name = name.to_string();
                pcb.args = vec![name.to_string()];
                pcb.prio = 0;
                pcb.fds[0] = Some(0);
                pcb.fds[1] = Some(1);
                pcb.fds[2] = Some(2);
            }
            k.log_event("CREATE", pid);
            k.enqueue(pid);
            pid
        };
        let sys = Syscalls::new(self.kernel.clone(), pid);
        let future = prog(sys, vec![name.to_string()]);
        self.tasks.insert(pid, future);
        Ok(pid)
    }

    /// Run until shutdown, pacing each slice to the configured length.
    pub fn run(&mut self) {
        info!("scheduler running ({}ms slices)", self.slice.as_millis());
        loop {
            if self.step() == Step::Shutdown {
                break;
            }
            if !self.slice.is_zero() {
                std::thread::sleep(self.slice);
            }
        }
        info!("scheduler exiting: shutdown requested");
    }

    /// Execute exactly one slice.
    pub fn step(&mut self) -> Step {
        let picked = {
            let mut k = self.kernel.borrow_mut();
            k.console.pump();
            k.check_host_signals();
            if k.shutdown_requested() {
                return Step::Shutdown;
            }
            let prio = k.pick_queue();
            match k.dequeue(prio) {
                Some(pid) => {
                    k.begin_slice(pid);
                    Some(pid)
                }
                None => {
                    k.tick_sleep_check();
                    k.advance_tick();
                    None
                }
            }
        };

        let Some(pid) = picked else {
            self.adopt_pending();
            return Step::Idle;
        };

        // Poll outside the borrow: the task will reborrow through its
        // syscall handle.
        let completed = match self.tasks.get_mut(&pid) {
            Some(future) => poll_once(future) == Poll::Ready(()),
            None => true,
        };

        {
            let mut k = self.kernel.borrow_mut();
            if completed {
                k.task_returned(pid);
            }
            k.tick_sleep_check();
            k.end_slice(pid);
            k.advance_tick();
        }

        self.adopt_pending();
        self.reap_tasks();
        Step::Ran
    }

    /// Convenience for tests: run up to `n` slices, stopping early on
    /// shutdown.
    pub fn run_slices(&mut self, n: usize) {
        for _ in 0..n {
            if self.step() == Step::Shutdown {
                break;
            }
        }
    }

    /// Move tasks spawned during the last slice into the task map.
    fn adopt_pending(&mut self) {
        let pending = self.kernel.borrow_mut().take_pending_tasks();
        for task in pending {
            self.tasks.insert(task.pid, task.future);
        }
    }

    /// Drop the futures of zombie (or reaped) processes. Dropping is the
    /// cancellation point, so it must happen outside any kernel borrow.
    fn reap_tasks(&mut self) {
        let dead: Vec<Pid> = {
            let k = self.kernel.borrow();
            self.tasks
                .keys()
                .filter(|&&pid| {
                    k.procs
                        .get(pid)
                        .map(|p| p.state == ProcState::Zombie)
                        .unwrap_or(true)
                })
                .copied()
                .collect()
        };
        for pid in dead {
            if let Some(future) = self.tasks.remove(&pid) {
                debug!("dropping task for {}", pid);
                drop(future);
            }
        }
    }

    /// Shutdown teardown: cancel every task, then release every PCB.
    pub fn kill_all(&mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        drop(tasks);
        self.kernel.borrow_mut().kill_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::console::Console;
    use crate::kernel::events::EventLog;
    use crate::kernel::task::yield_now;
    use crate::kernel::task::TaskFuture;

    fn test_scheduler() -> Scheduler {
        let kernel = Rc::new(RefCell::new(Kernel::new(
            EventLog::disabled(),
            Console::detached(),
        )));
        Scheduler::new(kernel, Duration::ZERO)
    }

    fn busy_forever(_sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
        Box::pin(async {
            loop {
                yield_now().await;
            }
        })
    }

    fn exit_immediately(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
        Box::pin(async move {
            sys.exit().await;
        })
    }

    #[test]
    fn test_idle_when_no_ready_process() {
        let mut sched = test_scheduler();
        assert_eq!(sched.step(), Step::Idle);
        assert_eq!(sched.kernel().borrow().tick(), 1);
    }

    #[test]
    fn test_root_process_runs_and_requeues() {
        let mut sched = test_scheduler();
        let pid = sched.spawn_root("init", busy_forever).unwrap();
        assert_eq!(sched.step(), Step::Ran);
        let k = sched.kernel();
        let kernel = k.borrow();
        // Used its slice without blocking: back to READY, queued again.
        assert_eq!(kernel.procs.get(pid).unwrap().state, ProcState::Ready);
        assert!(kernel.queues.contains_ready(0, pid));
    }

    #[test]
    fn test_exit_makes_zombie_and_drops_task() {
        let mut sched = test_scheduler();
        let pid = sched.spawn_root("init", exit_immediately).unwrap();
        sched.step();
        assert_eq!(
            sched.kernel().borrow().procs.get(pid).unwrap().state,
            ProcState::Zombie
        );
        assert!(!sched.tasks.contains_key(&pid));
    }

    #[test]
    fn test_shutdown_stops_run() {
        let mut sched = test_scheduler();
        fn shutdown_prog(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
            Box::pin(async move {
                sys.shutdown();
                sys.exit().await;
            })
        }
        sched.spawn_root("init", shutdown_prog).unwrap();
        assert_eq!(sched.step(), Step::Ran);
        assert_eq!(sched.step(), Step::Shutdown);
    }

    #[test]
    fn test_spawned_child_gets_scheduled() {
        let mut sched = test_scheduler();
        fn spawner(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
            Box::pin(async move {
                sys.spawn(busy_forever, vec!["busy".into()], None, None, false)
                    .unwrap();
                loop {
                    yield_now().await;
                }
            })
        }
        sched.spawn_root("init", spawner).unwrap();
        sched.run_slices(4);
        let k = sched.kernel();
        let kernel = k.borrow();
        let pids = kernel.procs.pids();
        assert_eq!(pids.len(), 2);
        // The child defaulted to priority 1 and is queued there.
        let child = pids[1];
        assert_eq!(kernel.procs.get(child).unwrap().prio, 1);
    }

    #[test]
    fn test_kill_all_clears_everything() {
        let mut sched = test_scheduler();
        sched.spawn_root("init", busy_forever).unwrap();
        sched.run_slices(2);
        sched.kill_all();
        assert!(sched.tasks.is_empty());
        assert!(sched.kernel().borrow().procs.pids().is_empty());
    }
}

//! Kernel invariant checks
//!
//! Structural properties that must hold after any sequence of state
//! transitions:
//! - a READY process sits in exactly one ready queue (its priority's)
//! - a BLOCKED process sits in the blocked queue
//! - STOPPED and ZOMBIE processes sit in no queue at all
//! - a terminated process holds no FD above 2

use std::cell::RefCell;
use std::rc::Rc;

use super::console::Console;
use super::events::EventLog;
use super::process::{Pid, ProcState, MAX_FDS};
use super::queues::NUM_PRIO;
use super::signal::Signal;
use super::syscall::Kernel;

fn kernel() -> Rc<RefCell<Kernel>> {
    Rc::new(RefCell::new(Kernel::new(
        EventLog::disabled(),
        Console::detached(),
    )))
}

/// Assert the queue-membership invariant for every live process.
fn check_queues(k: &Kernel) {
    for pcb in k.procs.iter() {
        let pid = pcb.pid;
        let ready_count: usize = (0..NUM_PRIO)
            .filter(|&p| k.queues.contains_ready(p, pid))
            .count();
        let in_blocked = k.queues.contains_blocked(pid);

        match pcb.state {
            ProcState::Ready => {
                assert_eq!(ready_count, 1, "{} READY but in {} queues", pid, ready_count);
                assert!(
                    k.queues.contains_ready(pcb.prio, pid),
                    "{} queued at the wrong priority",
                    pid
                );
                assert!(!in_blocked, "{} READY but also blocked", pid);
            }
            ProcState::Blocked => {
                assert_eq!(ready_count, 0, "{} BLOCKED but on a ready queue", pid);
                assert!(in_blocked, "{} BLOCKED but missing from blocked queue", pid);
            }
            ProcState::Stopped | ProcState::Zombie => {
                assert_eq!(ready_count, 0, "{} {:?} but on a ready queue", pid, pcb.state);
                assert!(!in_blocked, "{} {:?} but on blocked queue", pid, pcb.state);
            }
            ProcState::Running => {}
        }
    }
}

fn spawn_raw(k: &Rc<RefCell<Kernel>>, parent: Option<Pid>, prio: usize) -> Pid {
    let mut kernel = k.borrow_mut();
    let pid = kernel.procs.create(parent).unwrap();
    kernel.procs.get_mut(pid).unwrap().prio = prio;
    kernel.enqueue(pid);
    pid
}

#[test]
fn test_invariants_through_random_transitions() {
    let k = kernel();
    let init = spawn_raw(&k, None, 0);
    let mut pids = vec![init];
    for prio in [0, 1, 2, 1, 2] {
        pids.push(spawn_raw(&k, Some(init), prio));
    }
    check_queues(&k.borrow());

    // A fixed scripted walk through every transition kind.
    {
        let mut kernel = k.borrow_mut();
        kernel.block(pids[1]);
        kernel.stop(pids[2]);
        kernel.set_priority(pids[3], 0);
        check_queues(&kernel);

        kernel.unblock(pids[1]);
        kernel.continue_(pids[2]);
        check_queues(&kernel);

        kernel.deliver_signal(pids[4], Signal::Stop);
        kernel.deliver_signal(pids[4], Signal::Cont);
        kernel.deliver_signal(pids[5], Signal::Term);
        check_queues(&kernel);

        // Sleep then wake by tick.
        kernel.procs.get_mut(pids[3]).unwrap().wake_tick = 2;
        kernel.block(pids[3]);
        check_queues(&kernel);
        kernel.advance_tick();
        kernel.advance_tick();
        kernel.tick_sleep_check();
        check_queues(&kernel);
        assert_eq!(
            kernel.procs.get(pids[3]).unwrap().state,
            ProcState::Ready
        );
    }
}

#[test]
fn test_terminated_process_holds_no_high_fds() {
    let k = kernel();
    let init = spawn_raw(&k, None, 0);
    let child = spawn_raw(&k, Some(init), 1);
    {
        let mut kernel = k.borrow_mut();
        let pcb = kernel.procs.get_mut(child).unwrap();
        // Fake a few open descriptors; no filesystem is mounted, so the
        // close calls are skipped, but the slots must still empty.
        pcb.fds[3] = Some(7);
        pcb.fds[17] = Some(9);
        kernel.terminate(child);
    }
    let kernel = k.borrow();
    let pcb = kernel.procs.get(child).unwrap();
    assert_eq!(pcb.state, ProcState::Zombie);
    for i in 3..MAX_FDS {
        assert!(pcb.fds[i].is_none(), "fd slot {} survived terminate", i);
    }
    check_queues(&kernel);
}

#[test]
fn test_every_child_reparented_on_terminate() {
    let k = kernel();
    let init = spawn_raw(&k, None, 0);
    let parent = spawn_raw(&k, Some(init), 1);
    let kids: Vec<Pid> = (0..3).map(|_| spawn_raw(&k, Some(parent), 1)).collect();

    k.borrow_mut().terminate(parent);

    let kernel = k.borrow();
    for kid in kids {
        assert_eq!(kernel.procs.get(kid).unwrap().ppid, Some(Pid::INIT));
        assert!(kernel.procs.get(init).unwrap().children.contains(&kid));
    }
    check_queues(&kernel);
}

//! End-to-end scenarios across the scheduler, the syscall surface, and
//! the filesystem.
//!
//! Each test formats its own throwaway image, boots a kernel with a
//! detached console and an unpaced scheduler, installs a purpose-built
//! root process, and drives slices by hand. Results computed inside
//! user processes are written to files on the image and read back after
//! unmount.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rill::fatfs::{mkfs, FatFs, OpenMode, Volume, Whence};
use rill::kernel::task::{yield_now, TaskFuture};
use rill::kernel::{
    Console, EventLog, HostSignal, Kernel, Pid, ProcState, Scheduler, Step, Syscalls, WaitStatus,
};

fn temp_image(tag: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("rill-it-{}-{}-{}.img", tag, std::process::id(), n))
}

/// Fresh image + kernel + unpaced scheduler.
fn harness(tag: &str, events: EventLog) -> (Scheduler, PathBuf) {
    let img = temp_image(tag);
    mkfs(&img, 2, 0).unwrap();
    let mut kernel = Kernel::new(events, Console::detached());
    kernel.mount(&img).unwrap();
    let kernel = Rc::new(RefCell::new(kernel));
    (Scheduler::new(kernel, Duration::ZERO), img)
}

/// Run the scheduler until it reports shutdown (bounded).
fn run_to_shutdown(sched: &mut Scheduler, max_slices: usize) {
    for _ in 0..max_slices {
        if sched.step() == Step::Shutdown {
            return;
        }
    }
    panic!("scheduler did not shut down within {} slices", max_slices);
}

/// Read a whole file out of an unmounted image.
fn read_file(img: &PathBuf, name: &str) -> Vec<u8> {
    let mut fs = FatFs::new(Volume::mount(img).unwrap());
    let fd = fs.open(name, OpenMode::Read).unwrap();
    let mut buf = vec![0u8; 65536];
    let n = fs.read(fd, &mut buf).unwrap();
    fs.close(fd).unwrap();
    buf.truncate(n);
    buf
}

fn write_result(sys: &Syscalls, name: &str, text: &str) {
    let fd = sys.open(name, OpenMode::Write).unwrap();
    sys.write(fd, text.as_bytes()).unwrap();
    sys.close(fd).unwrap();
}

// ============================================================================
// Scenario: write/read round trip, plus deferred delete (fs only)
// ============================================================================

#[test]
fn test_fs_hello_roundtrip() {
    let img = temp_image("hello");
    mkfs(&img, 1, 0).unwrap();
    let mut fs = FatFs::new(Volume::mount(&img).unwrap());

    let fd = fs.open("a", OpenMode::Write).unwrap();
    assert_eq!(fs.write(fd, b"hello").unwrap(), 5);
    fs.close(fd).unwrap();

    let fd = fs.open("a", OpenMode::Read).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
    fs.close(fd).unwrap();
    std::fs::remove_file(&img).ok();
}

#[test]
fn test_fs_unlink_while_open_single_active_entry() {
    let img = temp_image("unlinkopen");
    mkfs(&img, 1, 0).unwrap();
    let mut fs = FatFs::new(Volume::mount(&img).unwrap());

    let fd = fs.open("a", OpenMode::Write).unwrap();
    fs.write(fd, b"hi").unwrap();
    fs.unlink("a").unwrap();

    // A second "a" coexists with the tombstoned one.
    let fd2 = fs.open("a", OpenMode::Write).unwrap();
    assert!(fd2 >= 3);
    fs.close(fd).unwrap();

    let mut names = Vec::new();
    fs.scan_dir(None, |e| names.push(e.name_str())).unwrap();
    assert_eq!(names, vec!["a".to_string()]);

    // Deferred-delete correctness: the data written through the old
    // descriptor died with it.
    fs.close(fd2).unwrap();
    fs.unlink("a").unwrap();
    assert_eq!(fs.open("a", OpenMode::Read).is_err(), true);
    std::fs::remove_file(&img).ok();
}

#[test]
fn test_fs_write_seek_read_any_sequence() {
    let img = temp_image("wsr");
    mkfs(&img, 1, 0).unwrap();
    let mut fs = FatFs::new(Volume::mount(&img).unwrap());

    let payload: Vec<u8> = (0..900u32).map(|i| (i % 241) as u8).collect();
    let fd = fs.open("blob", OpenMode::Write).unwrap();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());
    fs.seek(fd, 0, Whence::Set).unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open("blob", OpenMode::Read).unwrap();
    let mut back = vec![0u8; 2048];
    let n = fs.read(fd, &mut back).unwrap();
    assert_eq!(&back[..n], &payload[..]);
    fs.close(fd).unwrap();
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: sleeping child, blocking wait
// ============================================================================

fn prog_sleep5(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        sys.sleep(5).await;
        sys.exit().await;
    })
}

fn init_wait_for_sleeper(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let child = sys
            .spawn(prog_sleep5, vec!["sleep5".to_string()], None, None, false)
            .unwrap();
        let result = sys.waitpid(Some(child), false).await;
        let text = match result {
            Ok(Some((pid, status))) if status.contains(WaitStatus::EXITED) => {
                format!("exited {}", pid)
            }
            other => format!("unexpected {:?}", other),
        };
        write_result(&sys, "result", &text);
        sys.shutdown();
        sys.exit().await;
    })
}

#[test]
fn test_blocking_wait_on_sleeping_child() {
    let (mut sched, img) = harness("wait", EventLog::disabled());
    sched.spawn_root("init", init_wait_for_sleeper).unwrap();

    // Slice 1: init spawns and blocks in wait. Slice 2: the child
    // enters its sleep and blocks. Both are now blocked.
    sched.run_slices(2);
    {
        let k = sched.kernel();
        let kernel = k.borrow();
        assert_eq!(kernel.process_state(Pid(1)), Some(ProcState::Blocked));
        assert_eq!(kernel.process_state(Pid(2)), Some(ProcState::Blocked));
    }

    run_to_shutdown(&mut sched, 100);
    sched.kill_all();
    sched.kernel().borrow_mut().unmount().unwrap();

    assert_eq!(read_file(&img, "result"), b"exited 2");
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: 9:4 weighting between priorities 0 and 2
// ============================================================================

fn prog_busy(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    let _ = sys;
    Box::pin(async {
        loop {
            yield_now().await;
        }
    })
}

fn init_weighting(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let fast = sys
            .spawn(prog_busy, vec!["busy-hi".to_string()], None, None, false)
            .unwrap();
        sys.nice(fast, 0).unwrap();
        for name in ["busy-lo-a", "busy-lo-b"] {
            let slow = sys
                .spawn(prog_busy, vec![name.to_string()], None, None, false)
                .unwrap();
            sys.nice(slow, 2).unwrap();
        }
        // Block forever; the busy children own the machine now.
        let _ = sys.waitpid(None, false).await;
    })
}

#[test]
fn test_schedule_ratio_nine_to_four() {
    let log_path = std::env::temp_dir().join(format!("rill-sched-{}.log", std::process::id()));
    let (mut sched, img) = harness("ratio", EventLog::to_file(&log_path));
    sched.spawn_root("init", init_weighting).unwrap();

    // Many full schedule cycles; the first few slices of setup noise
    // wash out.
    sched.run_slices(500);

    let text = std::fs::read_to_string(&log_path).unwrap();
    let mut hi = 0usize;
    let mut lo = 0usize;
    for line in text.lines() {
        if !line.contains("SCHEDULE") {
            continue;
        }
        if line.contains("busy-hi") {
            hi += 1;
        } else if line.contains("busy-lo") {
            lo += 1;
        }
    }
    assert!(hi > 100, "high-priority process barely ran: {}", hi);
    // Expect hi/lo ~= 9/4 = 2.25.
    let ratio = hi as f64 / lo as f64;
    assert!(
        (1.9..=2.6).contains(&ratio),
        "ratio {} out of range (hi {} lo {})",
        ratio,
        hi,
        lo
    );

    std::fs::remove_file(&log_path).ok();
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: FD cleanup on terminate
// ============================================================================

fn prog_open_write_exit(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let fd = sys.open("log", OpenMode::Write).unwrap();
        sys.write(fd, b"X").unwrap();
        // Exit without closing: terminate must do it.
        sys.exit().await;
    })
}

fn init_fd_cleanup(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let child = sys
            .spawn(
                prog_open_write_exit,
                vec!["writer".to_string()],
                None,
                None,
                false,
            )
            .unwrap();
        sys.waitpid(Some(child), false).await.unwrap();

        // The child never closed "log"; if its descriptor survived, a
        // second writer would be refused.
        let text = match sys.open("log", OpenMode::Write) {
            Ok(fd) => {
                sys.close(fd).unwrap();
                "reopened".to_string()
            }
            Err(e) => format!("refused: {}", e),
        };
        write_result(&sys, "result", &text);
        sys.shutdown();
        sys.exit().await;
    })
}

#[test]
fn test_fd_cleanup_on_terminate() {
    let (mut sched, img) = harness("fdclean", EventLog::disabled());
    sched.spawn_root("init", init_fd_cleanup).unwrap();
    run_to_shutdown(&mut sched, 100);
    sched.kill_all();
    sched.kernel().borrow_mut().unmount().unwrap();
    assert_eq!(read_file(&img, "result"), b"reopened");
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: init is unkillable
// ============================================================================

fn prog_kill_init(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let text = match sys.kill(Pid::INIT, 0) {
            Err(rill::Errno::NotPermitted) => "denied".to_string(),
            other => format!("unexpected {:?}", other),
        };
        write_result(&sys, "result", &text);
        sys.exit().await;
    })
}

fn init_unkillable(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let child = sys
            .spawn(prog_kill_init, vec!["killer".to_string()], None, None, false)
            .unwrap();
        sys.waitpid(Some(child), false).await.unwrap();
        sys.shutdown();
        sys.exit().await;
    })
}

#[test]
fn test_init_cannot_be_killed() {
    let (mut sched, img) = harness("killinit", EventLog::disabled());
    sched.spawn_root("init", init_unkillable).unwrap();

    sched.run_slices(3);
    // Init survived the attempt (it is blocked in wait, not dead).
    let state = sched.kernel().borrow().process_state(Pid::INIT);
    assert!(matches!(
        state,
        Some(ProcState::Blocked) | Some(ProcState::Ready) | Some(ProcState::Running)
    ));

    run_to_shutdown(&mut sched, 100);
    sched.kill_all();
    sched.kernel().borrow_mut().unmount().unwrap();
    assert_eq!(read_file(&img, "result"), b"denied");
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: host interrupt relays to the foreground process
// ============================================================================

fn init_foreground_interrupt(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let child = sys
            .spawn(prog_busy, vec!["busy-fg".to_string()], None, None, false)
            .unwrap();
        sys.set_foreground(Some(child));
        let text = match sys.waitpid(Some(child), false).await {
            Ok(Some((_, status))) if status.contains(WaitStatus::SIGNALED) => {
                "signaled".to_string()
            }
            other => format!("unexpected {:?}", other),
        };
        sys.set_foreground(None);
        write_result(&sys, "result", &text);
        sys.shutdown();
        sys.exit().await;
    })
}

#[test]
fn test_host_interrupt_kills_foreground() {
    let (mut sched, img) = harness("ctrlc", EventLog::disabled());
    sched.spawn_root("init", init_foreground_interrupt).unwrap();

    // Let the busy child run a few slices, then deliver Ctrl-C.
    sched.run_slices(4);
    let slot = sched.kernel().borrow().host_signal_slot();
    slot.notify(HostSignal::Interrupt);

    run_to_shutdown(&mut sched, 100);
    sched.kill_all();
    sched.kernel().borrow_mut().unmount().unwrap();
    assert_eq!(read_file(&img, "result"), b"signaled");
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: stop/continue with wait reporting
// ============================================================================

fn init_stop_cont(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let child = sys
            .spawn(prog_busy, vec!["busy-sc".to_string()], None, None, false)
            .unwrap();

        sys.kill(child, 1).unwrap(); // stop
        let stopped = matches!(
            sys.waitpid(Some(child), false).await,
            Ok(Some((p, s))) if p == child && s.contains(WaitStatus::STOPPED)
        );
        // The stop is an edge: a second nohang wait reports nothing.
        let quiet = matches!(sys.waitpid(Some(child), true).await, Ok(None));

        sys.kill(child, 2).unwrap(); // continue
        sys.sleep(2).await;
        sys.kill(child, 0).unwrap(); // terminate
        let reaped = matches!(
            sys.waitpid(Some(child), false).await,
            Ok(Some((p, s))) if p == child && s.contains(WaitStatus::SIGNALED)
        );

        write_result(
            &sys,
            "result",
            &format!("{} {} {}", stopped, quiet, reaped),
        );
        sys.shutdown();
        sys.exit().await;
    })
}

#[test]
fn test_stop_continue_term_reporting() {
    let (mut sched, img) = harness("stopcont", EventLog::disabled());
    sched.spawn_root("init", init_stop_cont).unwrap();
    run_to_shutdown(&mut sched, 200);
    sched.kill_all();
    sched.kernel().borrow_mut().unmount().unwrap();
    assert_eq!(read_file(&img, "result"), b"true true true");
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: orphans are adopted by init
// ============================================================================

fn prog_orphan_child(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    let _ = sys;
    Box::pin(async {
        loop {
            yield_now().await;
        }
    })
}

fn prog_orphan_parent(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        sys.spawn(
            prog_orphan_child,
            vec!["orphan".to_string()],
            None,
            None,
            false,
        )
        .unwrap();
        sys.exit().await;
    })
}

fn init_orphans(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let parent = sys
            .spawn(
                prog_orphan_parent,
                vec!["parent".to_string()],
                None,
                None,
                false,
            )
            .unwrap();
        sys.waitpid(Some(parent), false).await.unwrap();
        // The grandchild lives on as our own child now.
        loop {
            yield_now().await;
        }
    })
}

#[test]
fn test_orphan_adoption() {
    let (mut sched, img) = harness("orphan", EventLog::disabled());
    sched.spawn_root("init", init_orphans).unwrap();
    sched.run_slices(20);

    let k = sched.kernel();
    let kernel = k.borrow();
    let procs = kernel.processes();
    let orphan = procs
        .iter()
        .find(|p| p.cmd == "orphan")
        .expect("orphan process missing");
    assert_eq!(orphan.ppid, Some(Pid::INIT));
    // Its original parent is reaped and gone.
    assert!(!procs.iter().any(|p| p.cmd == "parent"));
    drop(kernel);

    sched.kill_all();
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: spawn with stdout redirection
// ============================================================================

fn init_redirect(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let child = sys
            .spawn(
                rill::shell::builtins::u_echo,
                vec!["echo".to_string(), "hello".to_string(), "redirect".to_string()],
                None,
                Some("out.txt"),
                false,
            )
            .unwrap();
        sys.waitpid(Some(child), false).await.unwrap();
        sys.shutdown();
        sys.exit().await;
    })
}

#[test]
fn test_spawn_with_stdout_redirection() {
    let (mut sched, img) = harness("redirect", EventLog::disabled());
    sched.spawn_root("init", init_redirect).unwrap();
    run_to_shutdown(&mut sched, 100);
    sched.kill_all();
    sched.kernel().borrow_mut().unmount().unwrap();
    assert_eq!(read_file(&img, "out.txt"), b"hello redirect\n");
    std::fs::remove_file(&img).ok();
}

// ============================================================================
// Scenario: zombies linger until reaped
// ============================================================================

fn prog_exit_now(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        sys.exit().await;
    })
}

fn init_zombie(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        sys.spawn(prog_exit_now, vec!["ghost".to_string()], None, None, false)
            .unwrap();
        // Deliberately never wait.
        loop {
            yield_now().await;
        }
    })
}

#[test]
fn test_zombie_persists_until_reaped() {
    let (mut sched, img) = harness("zombie", EventLog::disabled());
    sched.spawn_root("init", init_zombie).unwrap();
    sched.run_slices(10);

    let k = sched.kernel();
    let state = k.borrow().process_state(Pid(2));
    assert_eq!(state, Some(ProcState::Zombie));

    sched.kill_all();
    std::fs::remove_file(&img).ok();
}

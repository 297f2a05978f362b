//! The shell
//!
//! A user program like any other: it talks to the kernel exclusively
//! through its `Syscalls` handle. Interactive mode reads the console
//! line by line; script mode reads commands from a filesystem file
//! (which must carry the execute bit). Job control is shell-local
//! bookkeeping on top of spawn/waitpid/kill.

pub mod builtins;
pub mod jobs;
pub mod parser;

use crate::errno::Errno;
use crate::fatfs::OpenMode;
use crate::kernel::task::TaskFuture;
use crate::kernel::{Pid, Program, Syscalls, WaitStatus};
use jobs::{JobState, JobTable};

const PROMPT: &str = "$ ";

/// Entry point of the shell process. `argv[1]`, if present, names a
/// script file on the mounted filesystem.
pub fn shell_main(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        if argv.len() > 1 {
            run_script(sys, argv[1].clone()).await;
        } else {
            run_interactive(sys).await;
        }
    })
}

/// Map a command name to its built-in program.
fn builtin_program(name: &str) -> Option<Program> {
    match name {
        "cat" => Some(builtins::u_cat as Program),
        "sleep" => Some(builtins::u_sleep),
        "busy" => Some(builtins::u_busy),
        "echo" => Some(builtins::u_echo),
        "ls" => Some(builtins::u_ls),
        "touch" => Some(builtins::u_touch),
        "mv" => Some(builtins::u_mv),
        "cp" => Some(builtins::u_cp),
        "rm" => Some(builtins::u_rm),
        "chmod" => Some(builtins::u_chmod),
        "ps" => Some(builtins::u_ps),
        "kill" => Some(builtins::u_kill),
        "zombify" => Some(builtins::u_zombify),
        "orphanify" => Some(builtins::u_orphanify),
        _ => None,
    }
}

/// Read one line from the console. `None` means EOF with nothing
/// buffered.
async fn read_line(sys: &Syscalls) -> Option<String> {
    let mut line = Vec::new();
    loop {
        let chunk = sys.read(0, 1).await.ok()?;
        if chunk.is_empty() {
            if line.is_empty() {
                return None;
            }
            break;
        }
        if chunk[0] == b'\n' {
            break;
        }
        line.push(chunk[0]);
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

async fn run_interactive(sys: Syscalls) {
    let mut jobs = JobTable::new();

    loop {
        // The shell owns the terminal while it waits for input.
        sys.set_foreground(None);

        // Report background jobs that finished or stopped since the
        // last prompt.
        loop {
            match sys.waitpid(None, true).await {
                Ok(Some((pid, status))) => {
                    let info = jobs.find_by_pid(pid).map(|j| (j.id, j.cmd.clone()));
                    if let Some((id, cmd)) = info {
                        if status.intersects(WaitStatus::EXITED | WaitStatus::SIGNALED) {
                            let _ = sys.write_str(1, &format!("[{}] Done {}\n", id, cmd));
                            jobs.remove(pid);
                        } else if status.contains(WaitStatus::STOPPED) {
                            if let Some(job) = jobs.find_by_pid(pid) {
                                job.state = JobState::Stopped;
                            }
                            let _ = sys.write_str(1, &format!("\n[{}] Stopped {}\n", id, cmd));
                        }
                    }
                }
                _ => break,
            }
        }

        let _ = sys.write_str(1, PROMPT);
        let Some(line) = read_line(&sys).await else {
            // EOF (Ctrl-D): take the whole system down.
            let _ = sys.write_str(1, "\n");
            sys.shutdown();
            sys.exit().await;
            return;
        };

        run_command_line(&sys, &mut jobs, &line).await;
    }
}

async fn run_script(sys: Syscalls, script: String) {
    // A script must be executable; a missing file falls through to the
    // open below for the friendlier message.
    if let Err(e) = sys.check_executable(&script) {
        if e != Errno::NoSuchFile {
            let _ = sys.write_str(2, &format!("shell: permission denied: {}\n", script));
            sys.exit().await;
            return;
        }
    }

    let fd = match sys.open(&script, OpenMode::Read) {
        Ok(fd) => fd,
        Err(_) => {
            let _ = sys.write_str(2, &format!("shell: script not found: {}\n", script));
            sys.exit().await;
            return;
        }
    };

    let mut jobs = JobTable::new();
    let mut carry = String::new();
    loop {
        let data = match sys.read(fd, 4096).await {
            Ok(d) => d,
            Err(_) => break,
        };
        if data.is_empty() {
            break;
        }
        carry.push_str(&String::from_utf8_lossy(&data));
        while let Some(pos) = carry.find('\n') {
            let line: String = carry.drain(..=pos).collect();
            let line = line.trim_end_matches('\n');
            if !line.trim().is_empty() {
                run_command_line(&sys, &mut jobs, line).await;
            }
        }
    }
    if !carry.trim().is_empty() {
        let line = carry.clone();
        run_command_line(&sys, &mut jobs, &line).await;
    }

    let _ = sys.close(fd);
    sys.exit().await;
}

/// Parse and execute one command line: shell subroutines inline,
/// everything else as a spawned child with optional redirection and
/// job control.
pub async fn run_command_line(sys: &Syscalls, jobs: &mut JobTable, line: &str) {
    let parsed = match parser::parse_line(line) {
        Ok(Some(p)) => p,
        Ok(None) => return,
        Err(e) => {
            let _ = sys.write_str(2, &format!("shell: {}\n", e));
            return;
        }
    };
    let mut argv = parsed.argv;

    // nice is a prefix, the rest are complete subroutines.
    let mut priority: Option<usize> = None;
    let command = argv[0].clone();
    match command.as_str() {
        "nice" => {
            if argv.len() < 3 {
                let _ = sys.write_str(2, "nice: usage: nice <priority> <command> [args...]\n");
                return;
            }
            match argv[1].parse::<usize>() {
                Ok(p) if p <= 2 => priority = Some(p),
                _ => {
                    let _ = sys.write_str(2, "nice: invalid priority\n");
                    return;
                }
            }
            argv.drain(..2);
        }
        "man" => {
            man(sys);
            return;
        }
        "nice_pid" => {
            nice_pid(sys, &argv);
            return;
        }
        "bg" => {
            bg(sys, jobs, &argv);
            return;
        }
        "fg" => {
            fg(sys, jobs, &argv).await;
            return;
        }
        "jobs" => {
            for job in jobs.iter() {
                let _ = sys.write_str(
                    1,
                    &format!("[{}] {:<5} {:<12} {}\n", job.id, job.pid, job.state.label(), job.cmd),
                );
            }
            return;
        }
        "logout" => {
            let _ = sys.write_str(1, "Logging out...\n");
            sys.shutdown();
            sys.exit().await;
            return;
        }
        "mkfs" => {
            mkfs_cmd(sys, &argv);
            return;
        }
        "mount" => {
            match argv.get(1) {
                Some(path) => {
                    if let Err(e) = sys.mount(path) {
                        let _ = sys.write_str(2, &format!("mount: {}\n", e));
                    }
                }
                None => {
                    let _ = sys.write_str(2, "mount: invalid arguments\n");
                }
            }
            return;
        }
        "unmount" => {
            if let Err(e) = sys.unmount() {
                let _ = sys.write_str(2, &format!("unmount: {}\n", e));
            }
            return;
        }
        _ => {}
    }

    let program = builtin_program(&argv[0]);
    let cmd_label = match argv.get(1) {
        Some(arg) => format!("{} {}", argv[0], arg),
        None => argv[0].clone(),
    };

    let spawned = match program {
        Some(prog) => sys.spawn(
            prog,
            argv.clone(),
            parsed.stdin.as_deref(),
            parsed.stdout.as_deref(),
            parsed.append,
        ),
        None => {
            // Unknown commands are tried as scripts in a sub-shell.
            let sub_argv = vec!["shell".to_string(), argv[0].clone()];
            sys.spawn(
                shell_main,
                sub_argv,
                parsed.stdin.as_deref(),
                parsed.stdout.as_deref(),
                parsed.append,
            )
        }
    };

    let child = match spawned {
        Ok(pid) => pid,
        Err(e) => {
            if program.is_none() {
                let _ = sys.write_str(2, &format!("shell: command not found: {}\n", argv[0]));
            } else {
                let _ = sys.write_str(2, &format!("shell: {}\n", e));
            }
            return;
        }
    };

    if let Some(prio) = priority {
        let _ = sys.nice(child, prio);
    }

    if !parsed.background {
        sys.set_foreground(Some(child));
        if let Ok(Some((_, status))) = sys.waitpid(Some(child), false).await {
            if status.contains(WaitStatus::STOPPED) {
                let id = jobs.add(child, &cmd_label);
                if let Some(job) = jobs.find_by_pid(child) {
                    job.state = JobState::Stopped;
                }
                let _ = sys.write_str(1, &format!("\n[{}] Stopped {}\n", id, cmd_label));
            } else if status.contains(WaitStatus::SIGNALED) {
                let _ = sys.write_str(1, "\n");
            }
        }
        sys.set_foreground(None);
    } else {
        let id = jobs.add(child, &cmd_label);
        if let Some(job) = jobs.find_by_pid(child) {
            job.state = JobState::Background;
        }
        let _ = sys.write_str(1, &format!("[{}] {}\n", id, child));
        if argv[0] == "cat" {
            // A background cat would fight the shell for the console;
            // park it until someone foregrounds it.
            let _ = sys.kill(child, 1);
        }
    }
}

fn mkfs_cmd(sys: &Syscalls, argv: &[String]) {
    let (Some(path), Some(blocks), Some(idx)) = (argv.get(1), argv.get(2), argv.get(3)) else {
        let _ = sys.write_str(2, "mkfs: usage: mkfs FILE FAT_BLOCKS BLOCK_SIZE_INDEX\n");
        return;
    };
    let (Ok(blocks), Ok(idx)) = (blocks.parse::<usize>(), idx.parse::<usize>()) else {
        let _ = sys.write_str(2, "mkfs: invalid arguments\n");
        return;
    };
    match sys.mkfs(path, blocks, idx) {
        Ok(()) => {
            let _ = sys.write_str(1, &format!("filesystem '{}' created\n", path));
        }
        Err(e) => {
            let _ = sys.write_str(2, &format!("mkfs: {}\n", e));
        }
    }
}

fn nice_pid(sys: &Syscalls, argv: &[String]) {
    let (Some(prio), Some(pid)) = (argv.get(1), argv.get(2)) else {
        let _ = sys.write_str(2, "nice_pid: usage: nice_pid <priority> <pid>\n");
        return;
    };
    let Ok(prio) = prio.parse::<usize>() else {
        let _ = sys.write_str(2, "nice_pid: invalid priority\n");
        return;
    };
    let pid = match pid.parse::<u32>() {
        Ok(n) if n > 0 => Pid(n),
        _ => {
            let _ = sys.write_str(2, "nice_pid: invalid pid\n");
            return;
        }
    };
    if sys.nice(pid, prio).is_err() {
        let _ = sys.write_str(2, "nice_pid: failed to set priority\n");
    }
}

fn bg(sys: &Syscalls, jobs: &mut JobTable, argv: &[String]) {
    let job = match argv.get(1) {
        Some(arg) => match arg.parse::<u32>() {
            Ok(id) if id > 0 => jobs.find_by_id(id),
            _ => {
                let _ = sys.write_str(2, "bg: argument must be a job ID\n");
                return;
            }
        },
        None => jobs.most_recent_stopped(),
    };
    let Some(job) = job else {
        let _ = sys.write_str(2, "bg: no such job\n");
        return;
    };

    match job.state {
        JobState::Running | JobState::Background => {
            let (id, cmd) = (job.id, job.cmd.clone());
            job.state = JobState::Background;
            let _ = sys.write_str(1, &format!("[{}] {} already running in background\n", id, cmd));
        }
        JobState::Stopped => {
            job.state = JobState::Background;
            let (id, pid, cmd) = (job.id, job.pid, job.cmd.clone());
            let _ = sys.write_str(1, &format!("[{}] {}\n", id, cmd));
            if sys.kill(pid, 2).is_err() {
                let _ = sys.write_str(2, "bg: failed to continue process\n");
            }
        }
        JobState::Done => {}
    }
}

async fn fg(sys: &Syscalls, jobs: &mut JobTable, argv: &[String]) {
    let job = match argv.get(1) {
        Some(arg) => match arg.parse::<u32>() {
            Ok(id) if id > 0 => jobs.find_by_id(id),
            _ => {
                let _ = sys.write_str(2, "fg: argument must be a job ID\n");
                return;
            }
        },
        None => jobs.most_recent_stopped_or_background(),
    };
    let Some(job) = job else {
        let _ = sys.write_str(2, "fg: no current job\n");
        return;
    };

    job.state = JobState::Running;
    let (id, pid, cmd) = (job.id, job.pid, job.cmd.clone());
    let _ = sys.write_str(1, &format!("{}\n", cmd));

    // Harmless if the job is not stopped: cont only acts on STOPPED.
    let _ = sys.kill(pid, 2);

    sys.set_foreground(Some(pid));
    if let Ok(Some((_, status))) = sys.waitpid(Some(pid), false).await {
        if status.contains(WaitStatus::STOPPED) {
            if let Some(job) = jobs.find_by_pid(pid) {
                job.state = JobState::Stopped;
            }
            let _ = sys.write_str(1, &format!("\n[{}] Stopped {}\n", id, cmd));
        } else if status.contains(WaitStatus::SIGNALED) {
            jobs.remove(pid);
            let _ = sys.write_str(1, "\n");
        } else {
            jobs.remove(pid);
        }
    }
    sys.set_foreground(None);
}

fn man(sys: &Syscalls) {
    let help = "\
Shell commands:

Process management:
  ps                        - list all processes
  kill [-term|-stop|-cont] <pid> ...
                            - send a signal (default: -term)
  nice <prio> <cmd>         - run a command at priority 0-2
  nice_pid <prio> <pid>     - change the priority of a process
  sleep <seconds>           - sleep
  busy                      - spin until signalled

Files:
  cat [file ...] [-w|-a out]- concatenate files (or stdin)
  ls [file]                 - list the directory
  touch <file> ...          - create files / bump timestamps
  mv <src> <dst>            - rename a file
  cp [-h] <src> [-h] <dst>  - copy (use -h on the host side)
  rm <file> ...             - remove files
  chmod <mode> <file>       - change permissions (+rwx, -rwx, =rwx, octal)
  mkfs <file> <blocks> <bsize-index>
                            - format a new image (unmounted only)
  mount <file> / unmount    - attach / detach an image

Job control:
  jobs                      - list jobs
  bg [id]                   - continue a stopped job in the background
  fg [id]                   - bring a job to the foreground

Other:
  echo <text>               - print text
  zombify / orphanify       - process-lifecycle test programs
  logout                    - shut the system down
  man                       - this text
";
    let _ = sys.write_str(1, help);
}

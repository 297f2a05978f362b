//! Built-in user programs
//!
//! Every built-in is a `Program`: it gets its syscall handle and argv,
//! runs as its own process, and exits through the syscall surface.
//! These are deliberately thin; anything interesting happens in the
//! kernel or the filesystem.

use crate::errno::Errno;
use crate::fatfs::layout::{CHMOD_ADD, CHMOD_ASSIGN, CHMOD_REMOVE};
use crate::fatfs::OpenMode;
use crate::kernel::task::{yield_now, TaskFuture};
use crate::kernel::{Pid, Syscalls};

/// Chunk size for streaming reads.
const READ_CHUNK: usize = 4096;

/// `prefix: error message` on stderr.
fn report(sys: &Syscalls, prefix: &str, err: Errno) {
    let _ = sys.write_str(2, &format!("{}: {}\n", prefix, err));
}

/// cat [FILE ...] [-w OUT | -a OUT]
///
/// Without files, copies stdin to the output; `-w` truncates into OUT,
/// `-a` appends.
pub fn u_cat(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let mut out_name: Option<(String, OpenMode)> = None;
        let mut inputs: Vec<String> = Vec::new();

        let mut i = 1;
        while i < argv.len() {
            match argv[i].as_str() {
                "-w" | "-a" => {
                    let mode = if argv[i] == "-w" {
                        OpenMode::Write
                    } else {
                        OpenMode::Append
                    };
                    match argv.get(i + 1) {
                        Some(name) => out_name = Some((name.clone(), mode)),
                        None => {
                            let _ = sys.write_str(2, "cat: missing output file\n");
                            sys.exit().await;
                        }
                    }
                    break;
                }
                _ => inputs.push(argv[i].clone()),
            }
            i += 1;
        }

        let out_fd = match &out_name {
            Some((name, mode)) => match sys.open(name, *mode) {
                Ok(fd) => fd,
                Err(e) => {
                    report(&sys, "cat", e);
                    sys.exit().await;
                    return;
                }
            },
            None => 1,
        };

        if inputs.is_empty() {
            // stdin to output until EOF
            loop {
                match sys.read(0, READ_CHUNK).await {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => {
                        if sys.write(out_fd, &data).is_err() {
                            report(&sys, "cat", Errno::Io);
                            break;
                        }
                    }
                    Err(e) => {
                        report(&sys, "cat", e);
                        break;
                    }
                }
            }
        } else {
            for name in &inputs {
                let fd = match sys.open(name, OpenMode::Read) {
                    Ok(fd) => fd,
                    Err(e) => {
                        report(&sys, name, e);
                        continue;
                    }
                };
                loop {
                    match sys.read(fd, READ_CHUNK).await {
                        Ok(data) if data.is_empty() => break,
                        Ok(data) => {
                            if sys.write(out_fd, &data).is_err() {
                                report(&sys, "cat", Errno::Io);
                                break;
                            }
                        }
                        Err(e) => {
                            report(&sys, name, e);
                            break;
                        }
                    }
                }
                let _ = sys.close(fd);
            }
        }

        if out_name.is_some() {
            let _ = sys.close(out_fd);
        }
        sys.exit().await;
    })
}

/// sleep SECONDS (ten ticks per second)
pub fn u_sleep(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let Some(arg) = argv.get(1) else {
            let _ = sys.write_str(2, "sleep: missing operand\n");
            sys.exit().await;
            return;
        };
        let seconds: u64 = match arg.parse() {
            Ok(s) if s > 0 => s,
            _ => {
                let _ = sys.write_str(2, &format!("sleep: invalid time interval '{}'\n", arg));
                sys.exit().await;
                return;
            }
        };
        sys.sleep(seconds * 10).await;
        sys.exit().await;
    })
}

/// busy: spin until signalled away.
pub fn u_busy(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    let _ = sys;
    Box::pin(async {
        loop {
            yield_now().await;
        }
    })
}

/// echo ARGS...
pub fn u_echo(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let line = argv[1..].join(" ");
        let _ = sys.write_str(1, &line);
        let _ = sys.write_str(1, "\n");
        sys.exit().await;
    })
}

/// ls [FILE]
pub fn u_ls(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        if let Err(e) = sys.ls(argv.get(1).map(|s| s.as_str())) {
            report(&sys, "ls", e);
        }
        sys.exit().await;
    })
}

/// touch FILE...
pub fn u_touch(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        if argv.len() < 2 {
            let _ = sys.write_str(2, "touch: missing file operand\n");
            sys.exit().await;
            return;
        }
        for name in &argv[1..] {
            match sys.open(name, OpenMode::Append) {
                Ok(fd) => {
                    let _ = sys.close(fd);
                }
                Err(e) => report(&sys, "touch", e),
            }
        }
        sys.exit().await;
    })
}

/// mv SRC DST
pub fn u_mv(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        if argv.len() < 3 {
            let _ = sys.write_str(2, "mv: missing operand\n");
            sys.exit().await;
            return;
        }
        if let Err(e) = sys.rename(&argv[1], &argv[2]) {
            report(&sys, "mv", e);
        }
        sys.exit().await;
    })
}

/// cp SRC DST | cp -h HOST_SRC DST | cp SRC -h HOST_DST
pub fn u_cp(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let result = cp_run(&sys, &argv).await;
        if let Err(e) = result {
            report(&sys, "cp", e);
        }
        sys.exit().await;
    })
}

async fn cp_run(sys: &Syscalls, argv: &[String]) -> crate::Result<()> {
    if argv.get(1).map(|s| s.as_str()) == Some("-h") {
        // host -> image
        let (src, dst) = match (argv.get(2), argv.get(3)) {
            (Some(s), Some(d)) => (s, d),
            _ => return Err(Errno::InvalidArgument),
        };
        let fd = sys.open(dst, OpenMode::Write)?;
        let result = sys.copy_from_host(src, fd);
        sys.close(fd)?;
        return result;
    }

    if argv.get(2).map(|s| s.as_str()) == Some("-h") {
        // image -> host
        let (src, dst) = match (argv.get(1), argv.get(3)) {
            (Some(s), Some(d)) => (s, d),
            _ => return Err(Errno::InvalidArgument),
        };
        let fd = sys.open(src, OpenMode::Read)?;
        let result = sys.copy_to_host(fd, dst);
        sys.close(fd)?;
        return result;
    }

    // image -> image
    let (src, dst) = match (argv.get(1), argv.get(2)) {
        (Some(s), Some(d)) => (s, d),
        _ => return Err(Errno::InvalidArgument),
    };
    let src_fd = sys.open(src, OpenMode::Read)?;
    let dst_fd = match sys.open(dst, OpenMode::Write) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = sys.close(src_fd);
            return Err(e);
        }
    };
    let mut result = Ok(());
    loop {
        let data = match sys.read(src_fd, READ_CHUNK).await {
            Ok(d) => d,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        if data.is_empty() {
            break;
        }
        if let Err(e) = sys.write(dst_fd, &data) {
            result = Err(e);
            break;
        }
    }
    let _ = sys.close(src_fd);
    let _ = sys.close(dst_fd);
    result
}

/// rm FILE...
pub fn u_rm(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        if argv.len() < 2 {
            let _ = sys.write_str(2, "rm: missing operand\n");
            sys.exit().await;
            return;
        }
        for name in &argv[1..] {
            if let Err(e) = sys.unlink(name) {
                report(&sys, &format!("rm: cannot remove '{}'", name), e);
            }
        }
        sys.exit().await;
    })
}

/// chmod MODE FILE, where MODE is +rwx / -rwx / =rwx or octal.
pub fn u_chmod(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let (Some(mode_str), Some(fname)) = (argv.get(1), argv.get(2)) else {
            let _ = sys.write_str(2, "chmod: missing operand\n");
            sys.exit().await;
            return;
        };

        let mode_word = match parse_mode(mode_str) {
            Some(m) => m,
            None => {
                let _ = sys.write_str(2, &format!("chmod: invalid mode: '{}'\n", mode_str));
                sys.exit().await;
                return;
            }
        };

        if let Err(e) = sys.chmod(fname, mode_word) {
            report(&sys, "chmod", e);
        }
        sys.exit().await;
    })
}

fn parse_mode(mode_str: &str) -> Option<u8> {
    let mut chars = mode_str.chars();
    let first = chars.next()?;
    if matches!(first, '+' | '-' | '=') {
        let mut mask = 0u8;
        for c in chars {
            mask |= match c {
                'r' => 4,
                'w' => 2,
                'x' => 1,
                _ => return None,
            };
        }
        let op = match first {
            '+' => CHMOD_ADD,
            '-' => CHMOD_REMOVE,
            _ => CHMOD_ASSIGN,
        };
        Some(op | mask)
    } else {
        if !mode_str.chars().all(|c| ('0'..='7').contains(&c)) {
            return None;
        }
        mode_str.parse::<u8>().ok().filter(|&m| m <= 7)
    }
}

/// ps: one row per live PCB.
pub fn u_ps(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let _ = sys.write_str(
            1,
            &format!("     {:<6} {:<6} {:<4} {:<6} {}\n", "PID", "PPID", "PRI", "STAT", "CMD"),
        );
        for p in sys.processes() {
            let ppid = p.ppid.map(|p| p.0).unwrap_or(0);
            let cmd = if p.cmd.is_empty() { "<unknown>" } else { &p.cmd };
            let _ = sys.write_str(
                1,
                &format!(
                    "     {:<6} {:<6} {:<4} {:<6} {}\n",
                    p.pid.0,
                    ppid,
                    p.prio,
                    p.state.code(),
                    cmd
                ),
            );
        }
        sys.exit().await;
    })
}

/// kill [-term|-stop|-cont] PID...
pub fn u_kill(sys: Syscalls, argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        if argv.len() < 2 {
            let _ = sys.write_str(2, "kill: missing argument\n");
            sys.exit().await;
            return;
        }

        let mut signal = 0; // term
        let mut idx = 1;
        if argv[1].starts_with('-') {
            signal = match argv[1].as_str() {
                "-term" => 0,
                "-stop" => 1,
                "-cont" => 2,
                other => {
                    let _ = sys.write_str(2, &format!("kill: invalid signal: {}\n", other));
                    sys.exit().await;
                    return;
                }
            };
            idx = 2;
        }

        for arg in &argv[idx..] {
            let pid = match arg.parse::<u32>() {
                Ok(n) if n > 0 => Pid(n),
                _ => {
                    let _ = sys.write_str(2, &format!("kill: invalid pid: {}\n", arg));
                    continue;
                }
            };
            if let Err(e) = sys.kill(pid, signal) {
                report(&sys, &format!("kill ({})", pid), e);
            }
        }
        sys.exit().await;
    })
}

/// Child half of zombify: exits immediately, leaving a zombie until the
/// parent reaps (which zombify never does).
pub fn u_zombie_child(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        sys.exit().await;
    })
}

/// zombify: spawn a child that dies at once, then spin without reaping.
pub fn u_zombify(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let _ = sys.spawn(
            u_zombie_child,
            vec!["zombie_child".to_string()],
            None,
            None,
            false,
        );
        loop {
            yield_now().await;
        }
    })
}

/// Child half of orphanify: outlives its parent.
pub fn u_orphan_child(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    let _ = sys;
    Box::pin(async {
        loop {
            yield_now().await;
        }
    })
}

/// orphanify: spawn a long-lived child and exit, orphaning it onto init.
pub fn u_orphanify(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let _ = sys.spawn(
            u_orphan_child,
            vec!["orphan_child".to_string()],
            None,
            None,
            false,
        );
        sys.exit().await;
    })
}

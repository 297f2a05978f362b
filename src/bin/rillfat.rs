//! Standalone filesystem maintenance shell.
//!
//! Formats, mounts and inspects images without booting the OS:
//!
//!   rillfat# mkfs disk.img 1 0
//!   rillfat# mount disk.img
//!   rillfat# cp -h hosts.txt hosts
//!   rillfat# ls
//!
//! Commands: mkfs, mount, unmount, ls, touch, cat [-w|-a OUT], chmod,
//! rm, mv, cp [-h], exit.

use std::io::{BufRead, Write};
use std::path::Path;
use std::process::ExitCode;

use rill::errno::Errno;
use rill::fatfs::ops::format_dirent;
use rill::fatfs::{mkfs, FatFs, OpenMode, Volume};

struct Session {
    fs: Option<FatFs>,
}

impl Session {
    fn fs_mut(&mut self) -> Result<&mut FatFs, Errno> {
        self.fs.as_mut().ok_or(Errno::NotMounted)
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let mut session = Session { fs: None };

    let stdin = std::io::stdin();
    loop {
        eprint!("rillfat# ");
        std::io::stderr().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("error reading command: {}", e);
                continue;
            }
        }

        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }
        if args[0] == "exit" || args[0] == "quit" {
            break;
        }
        if let Err(e) = dispatch(&mut session, &args) {
            eprintln!("{}: {}", args[0], e);
        }
    }

    if let Some(fs) = session.fs.take() {
        if let Err(e) = fs.unmount() {
            eprintln!("unmount: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn dispatch(session: &mut Session, args: &[&str]) -> Result<(), Errno> {
    match args[0] {
        "mkfs" => {
            if session.fs.is_some() {
                return Err(Errno::NotPermitted);
            }
            let (Some(path), Some(blocks), Some(idx)) = (args.get(1), args.get(2), args.get(3))
            else {
                eprintln!("usage: mkfs FILE FAT_BLOCKS BLOCK_SIZE_INDEX");
                return Ok(());
            };
            let blocks: usize = blocks.parse().map_err(|_| Errno::InvalidArgument)?;
            let idx: usize = idx.parse().map_err(|_| Errno::InvalidArgument)?;
            mkfs(Path::new(path), blocks, idx)?;
            println!("filesystem '{}' created", path);
            Ok(())
        }
        "mount" => {
            if session.fs.is_some() {
                return Err(Errno::NotPermitted);
            }
            let Some(path) = args.get(1) else {
                eprintln!("usage: mount FILE");
                return Ok(());
            };
            session.fs = Some(FatFs::new(Volume::mount(Path::new(path))?));
            println!("filesystem '{}' mounted", path);
            Ok(())
        }
        "unmount" => {
            match session.fs.take() {
                Some(fs) => {
                    fs.unmount()?;
                    println!("filesystem unmounted");
                    Ok(())
                }
                None => Err(Errno::NotMounted),
            }
        }
        "ls" => {
            let fs = session.fs_mut()?;
            let mut lines = Vec::new();
            fs.scan_dir(args.get(1).copied(), |e| lines.push(format_dirent(e)))?;
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        }
        "touch" => {
            if args.len() < 2 {
                eprintln!("usage: touch FILE ...");
                return Ok(());
            }
            let fs = session.fs_mut()?;
            for name in &args[1..] {
                let fd = fs.open(name, OpenMode::Append)?;
                fs.close(fd)?;
            }
            Ok(())
        }
        "cat" => cat(session.fs_mut()?, args),
        "chmod" => {
            let (Some(mode), Some(name)) = (args.get(1), args.get(2)) else {
                eprintln!("usage: chmod PERM FILE");
                return Ok(());
            };
            let mode: u8 = mode.parse().map_err(|_| Errno::InvalidArgument)?;
            if mode > 7 {
                return Err(Errno::InvalidArgument);
            }
            session.fs_mut()?.chmod(name, mode)
        }
        "rm" => {
            if args.len() < 2 {
                eprintln!("usage: rm FILE ...");
                return Ok(());
            }
            let fs = session.fs_mut()?;
            for name in &args[1..] {
                if let Err(e) = fs.unlink(name) {
                    eprintln!("rm: cannot remove '{}': {}", name, e);
                }
            }
            Ok(())
        }
        "mv" => {
            let (Some(src), Some(dst)) = (args.get(1), args.get(2)) else {
                eprintln!("usage: mv SRC DST");
                return Ok(());
            };
            session.fs_mut()?.rename(src, dst)
        }
        "cp" => cp(session.fs_mut()?, args),
        other => {
            eprintln!("command not found: {}", other);
            Ok(())
        }
    }
}

/// cat [FILE ...] [-w OUT | -a OUT]; with no files, copies stdin.
fn cat(fs: &mut FatFs, args: &[&str]) -> Result<(), Errno> {
    let mut out: Option<(usize, OpenMode)> = None;
    let mut inputs = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i] {
            "-w" | "-a" => {
                let mode = if args[i] == "-w" {
                    OpenMode::Write
                } else {
                    OpenMode::Append
                };
                let Some(name) = args.get(i + 1) else {
                    return Err(Errno::NoSuchFile);
                };
                out = Some((fs.open(name, mode)?, mode));
                break;
            }
            name => inputs.push(name),
        }
        i += 1;
    }

    let out_fd = out.map(|(fd, _)| fd).unwrap_or(1);
    let mut status = Ok(());

    if inputs.is_empty() {
        status = fs.copy_stream(0, out_fd);
    } else {
        for name in inputs {
            match fs.open(name, OpenMode::Read) {
                Ok(fd) => {
                    if let Err(e) = fs.copy_stream(fd, out_fd) {
                        status = Err(e);
                    }
                    fs.close(fd)?;
                }
                Err(e) => {
                    eprintln!("cat: {}: {}", name, e);
                    status = Err(e);
                }
            }
        }
    }

    if out_fd != 1 {
        fs.close(out_fd)?;
    }
    status
}

/// cp SRC DST (image), cp -h SRC DST (host to image), cp SRC -h DST
/// (image to host).
fn cp(fs: &mut FatFs, args: &[&str]) -> Result<(), Errno> {
    if args.get(1) == Some(&"-h") {
        let (Some(src), Some(dst)) = (args.get(2), args.get(3)) else {
            return Err(Errno::InvalidArgument);
        };
        let fd = fs.open(dst, OpenMode::Write)?;
        let result = fs.copy_from_host(Path::new(src), fd);
        fs.close(fd)?;
        return result;
    }

    if args.get(2) == Some(&"-h") {
        let (Some(src), Some(dst)) = (args.get(1), args.get(3)) else {
            return Err(Errno::InvalidArgument);
        };
        let fd = fs.open(src, OpenMode::Read)?;
        let result = fs.copy_to_host(fd, Path::new(dst));
        fs.close(fd)?;
        return result;
    }

    let (Some(src), Some(dst)) = (args.get(1), args.get(2)) else {
        return Err(Errno::InvalidArgument);
    };
    let src_fd = fs.open(src, OpenMode::Read)?;
    let dst_fd = match fs.open(dst, OpenMode::Write) {
        Ok(fd) => fd,
        Err(e) => {
            fs.close(src_fd)?;
            return Err(e);
        }
    };
    let result = fs.copy_stream(src_fd, dst_fd);
    fs.close(src_fd)?;
    fs.close(dst_fd)?;
    result
}

//! Boot wiring
//!
//! Brings the machine up in the order the pieces depend on each other:
//! mount the filesystem image, create init (PID 1, priority 0), enter
//! the scheduler loop, and on shutdown tear everything down and
//! unmount.
//!
//! Init's job: spawn the shell at priority 0, then sit in a blocking
//! wait reaping whatever children it is handed (its own shell plus any
//! adopted orphans). If the shell dies without a shutdown request, init
//! restarts it.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};

use crate::kernel::task::TaskFuture;
use crate::kernel::{Console, EventLog, Kernel, Pid, Scheduler, Syscalls};
use crate::shell;
use crate::Result;

/// Default slice length: one tick per ~100 ms.
pub const SLICE: Duration = Duration::from_millis(100);

pub struct BootConfig {
    /// Filesystem image to mount.
    pub image: PathBuf,
    /// Scheduler event log destination; `None` disables it.
    pub event_log: Option<PathBuf>,
    /// Tick pacing; `Duration::ZERO` runs unpaced (tests).
    pub slice: Duration,
}

/// Bring the system up, run it to shutdown, tear it down.
pub fn boot(config: BootConfig) -> Result<()> {
    let events = match &config.event_log {
        Some(path) => EventLog::to_file(path),
        None => EventLog::disabled(),
    };
    let mut kernel = Kernel::new(events, Console::stdin());
    kernel.mount(&config.image)?;
    info!("mounted {}", config.image.display());

    let kernel = Rc::new(RefCell::new(kernel));
    let mut sched = Scheduler::new(kernel.clone(), config.slice);
    sched.spawn_root("init", init_main)?;
    sched.run();

    sched.kill_all();
    kernel.borrow_mut().unmount()?;
    info!("clean shutdown");
    Ok(())
}

/// PID 1. Spawns and babysits the shell, reaps orphans, and exits only
/// on shutdown.
pub fn init_main(sys: Syscalls, _argv: Vec<String>) -> TaskFuture {
    Box::pin(async move {
        let mut shell_pid = match spawn_shell(&sys) {
            Some(pid) => pid,
            None => {
                let _ = sys.write_str(2, "init: failed to spawn shell\n");
                sys.shutdown();
                sys.exit().await;
                return;
            }
        };

        loop {
            if sys.shutdown_requested() {
                sys.exit().await;
                return;
            }

            let waited = sys.waitpid(None, false).await;

            if sys.shutdown_requested() {
                sys.exit().await;
                return;
            }

            match waited {
                Ok(Some((pid, _status))) if pid == shell_pid => {
                    // The shell died without logging out; bring it back.
                    warn!("shell exited unexpectedly, restarting");
                    match spawn_shell(&sys) {
                        Some(pid) => shell_pid = pid,
                        None => {
                            let _ = sys.write_str(2, "init: failed to restart shell\n");
                            sys.shutdown();
                            sys.exit().await;
                            return;
                        }
                    }
                }
                // Adopted orphans are reaped inside waitpid itself;
                // stops of adopted children need no action either.
                Ok(_) => {}
                Err(_) => {
                    // No children should be impossible for init; treat
                    // it as a fatal wiring error.
                    let _ = sys.write_str(2, "init: wait failed\n");
                    sys.shutdown();
                    sys.exit().await;
                    return;
                }
            }
        }
    })
}

fn spawn_shell(sys: &Syscalls) -> Option<Pid> {
    let pid = sys
        .spawn(shell::shell_main, vec!["shell".to_string()], None, None, false)
        .ok()?;
    // The interactive shell runs at the highest priority.
    sys.nice(pid, 0).ok();
    Some(pid)
}

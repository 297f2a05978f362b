//! Scheduler event log
//!
//! Append-only, one line per event, keyed by tick. The kernel writes and
//! never reads it; the format is for humans (and for the scheduling-
//! fairness tests, which count SCHEDULE lines per priority).
//!
//! Line format: `[ tick:5 ] EVENT pid prio cmd`; NICE lines carry the
//! old and new priorities instead of a single priority column.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::warn;

use super::process::Pcb;

pub struct EventLog {
    out: Option<BufWriter<File>>,
}

impl EventLog {
    /// Log to `path`, truncating any previous run. If the file cannot be
    /// created the log is disabled rather than failing boot.
    pub fn to_file(path: &Path) -> EventLog {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        match File::create(path) {
            Ok(f) => EventLog {
                out: Some(BufWriter::new(f)),
            },
            Err(e) => {
                warn!("event log disabled: cannot create {}: {}", path.display(), e);
                EventLog { out: None }
            }
        }
    }

    pub fn disabled() -> EventLog {
        EventLog { out: None }
    }

    /// Record one lifecycle event for a process.
    pub fn record(&mut self, tick: u64, event: &str, pcb: &Pcb) {
        if let Some(out) = &mut self.out {
            let _ = writeln!(
                out,
                "[{:5}] {:<10} {:<5} {:<4} {}",
                tick, event, pcb.pid, pcb.prio, pcb.cmd_name
            );
            let _ = out.flush();
        }
    }

    /// Priority changes log both the old and the new value.
    pub fn record_nice(&mut self, tick: u64, pcb: &Pcb, old_prio: usize, new_prio: usize) {
        if let Some(out) = &mut self.out {
            let _ = writeln!(
                out,
                "[{:5}] {:<10} {:<3} {:<3} {:<2} {}",
                tick, "NICE", pcb.pid, old_prio, new_prio, pcb.cmd_name
            );
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::ProcessTable;

    #[test]
    fn test_event_lines_are_appended() {
        let path = std::env::temp_dir().join(format!("rill-events-{}.log", std::process::id()));
        let mut table = ProcessTable::new();
        let pid = table.create(None).unwrap();
        table.get_mut(pid).unwrap().cmd_name = "init".to_string();

        let mut log = EventLog::to_file(&path);
        log.record(0, "CREATE", table.get(pid).unwrap());
        log.record(3, "SCHEDULE", table.get(pid).unwrap());
        log.record_nice(4, table.get(pid).unwrap(), 1, 0);
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("CREATE"));
        assert!(lines[0].contains("init"));
        assert!(lines[1].starts_with("[    3]"));
        assert!(lines[2].contains("NICE"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_disabled_log_is_silent() {
        let mut table = ProcessTable::new();
        let pid = table.create(None).unwrap();
        let mut log = EventLog::disabled();
        log.record(0, "CREATE", table.get(pid).unwrap());
    }
}

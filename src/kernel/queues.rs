//! Ready and blocked queues
//!
//! Pure containers of PIDs. State transitions and event logging live on
//! `Kernel`, which is the only caller while a user task is suspended, so
//! none of this needs locking.

use super::process::Pid;

/// Number of priority levels; 0 is the highest.
pub const NUM_PRIO: usize = 3;

/// Remove the first occurrence of `pid`. Returns whether it was present.
fn remove_value(v: &mut Vec<Pid>, pid: Pid) -> bool {
    if let Some(i) = v.iter().position(|&p| p == pid) {
        v.remove(i);
        true
    } else {
        false
    }
}

pub struct RunQueues {
    ready: [Vec<Pid>; NUM_PRIO],
    blocked: Vec<Pid>,
}

impl RunQueues {
    pub fn new() -> RunQueues {
        RunQueues {
            ready: [Vec::new(), Vec::new(), Vec::new()],
            blocked: Vec::new(),
        }
    }

    pub fn push_ready(&mut self, prio: usize, pid: Pid) {
        if prio < NUM_PRIO {
            self.ready[prio].push(pid);
        }
    }

    /// Pop the head of one ready queue.
    pub fn pop_ready(&mut self, prio: usize) -> Option<Pid> {
        if prio >= NUM_PRIO || self.ready[prio].is_empty() {
            return None;
        }
        Some(self.ready[prio].remove(0))
    }

    pub fn ready_is_empty(&self, prio: usize) -> bool {
        self.ready[prio].is_empty()
    }

    pub fn remove_ready(&mut self, prio: usize, pid: Pid) -> bool {
        prio < NUM_PRIO && remove_value(&mut self.ready[prio], pid)
    }

    pub fn push_blocked(&mut self, pid: Pid) {
        self.blocked.push(pid);
    }

    pub fn remove_blocked(&mut self, pid: Pid) -> bool {
        remove_value(&mut self.blocked, pid)
    }

    /// Snapshot of the blocked queue, for the sleep check.
    pub fn blocked_pids(&self) -> Vec<Pid> {
        self.blocked.clone()
    }

    /// Scrub a PID from every queue (pre-zombie cleanup).
    pub fn remove_everywhere(&mut self, pid: Pid) {
        for prio in 0..NUM_PRIO {
            remove_value(&mut self.ready[prio], pid);
        }
        remove_value(&mut self.blocked, pid);
    }

    /// Is `pid` queued as ready at exactly this priority?
    pub fn contains_ready(&self, prio: usize, pid: Pid) -> bool {
        prio < NUM_PRIO && self.ready[prio].contains(&pid)
    }

    pub fn contains_blocked(&self, pid: Pid) -> bool {
        self.blocked.contains(&pid)
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_within_priority() {
        let mut q = RunQueues::new();
        q.push_ready(1, Pid(10));
        q.push_ready(1, Pid(11));
        q.push_ready(1, Pid(12));
        assert_eq!(q.pop_ready(1), Some(Pid(10)));
        assert_eq!(q.pop_ready(1), Some(Pid(11)));
        assert_eq!(q.pop_ready(1), Some(Pid(12)));
        assert_eq!(q.pop_ready(1), None);
    }

    #[test]
    fn test_priorities_are_independent() {
        let mut q = RunQueues::new();
        q.push_ready(0, Pid(1));
        q.push_ready(2, Pid(2));
        assert!(q.ready_is_empty(1));
        assert_eq!(q.pop_ready(2), Some(Pid(2)));
        assert_eq!(q.pop_ready(0), Some(Pid(1)));
    }

    #[test]
    fn test_remove_everywhere() {
        let mut q = RunQueues::new();
        q.push_ready(1, Pid(5));
        q.push_blocked(Pid(5));
        q.remove_everywhere(Pid(5));
        assert!(!q.contains_ready(1, Pid(5)));
        assert!(!q.contains_blocked(Pid(5)));
    }

    #[test]
    fn test_remove_by_value_only_first() {
        let mut v = vec![Pid(1), Pid(2), Pid(1)];
        assert!(remove_value(&mut v, Pid(1)));
        assert_eq!(v, vec![Pid(2), Pid(1)]);
        assert!(!remove_value(&mut v, Pid(9)));
    }
}

//! Terminal input
//!
//! The scheduler must never block on the host terminal, so a dedicated
//! reader thread pulls lines from stdin and hands them over a channel.
//! The kernel drains the channel once per slice into a byte buffer;
//! a process reading FD 0 takes from the buffer and yields its slice
//! while the buffer is empty.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::thread;

use log::debug;

pub struct Console {
    rx: Option<Receiver<String>>,
    buf: VecDeque<u8>,
    eof: bool,
}

impl Console {
    /// A console fed by a host stdin reader thread.
    pub fn stdin() -> Console {
        let (tx, rx) = channel();
        thread::Builder::new()
            .name("rill-console".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    match line {
                        Ok(mut l) => {
                            l.push('\n');
                            if tx.send(l).is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                }
                // Channel drops here; the kernel sees EOF.
            })
            .ok();
        Console {
            rx: Some(rx),
            buf: VecDeque::new(),
            eof: false,
        }
    }

    /// A console with no host behind it; tests feed it with
    /// `push_input` and may end it with `close_input`.
    pub fn detached() -> Console {
        Console {
            rx: None,
            buf: VecDeque::new(),
            eof: false,
        }
    }

    /// Drain whatever the reader thread has produced so far.
    pub fn pump(&mut self) {
        let Some(rx) = &self.rx else { return };
        loop {
            match rx.try_recv() {
                Ok(line) => self.buf.extend(line.into_bytes()),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    debug!("console input reached EOF");
                    self.eof = true;
                    self.rx = None;
                    return;
                }
            }
        }
    }

    /// Take up to `n` buffered bytes. `None` means "nothing yet, try
    /// again next slice"; `Some(empty)` means EOF.
    pub fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if !self.buf.is_empty() {
            let take = n.min(self.buf.len());
            return Some(self.buf.drain(..take).collect());
        }
        if self.eof {
            return Some(Vec::new());
        }
        None
    }

    pub fn push_input(&mut self, text: &str) {
        self.buf.extend(text.bytes());
    }

    pub fn close_input(&mut self) {
        self.eof = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_console_take() {
        let mut c = Console::detached();
        assert_eq!(c.take(10), None);
        c.push_input("hi\n");
        assert_eq!(c.take(2), Some(b"hi".to_vec()));
        assert_eq!(c.take(10), Some(b"\n".to_vec()));
        assert_eq!(c.take(10), None);
        c.close_input();
        assert_eq!(c.take(10), Some(Vec::new()));
    }

    #[test]
    fn test_buffered_input_survives_eof() {
        let mut c = Console::detached();
        c.push_input("tail");
        c.close_input();
        // Buffered bytes drain before EOF is reported.
        assert_eq!(c.take(10), Some(b"tail".to_vec()));
        assert_eq!(c.take(10), Some(Vec::new()));
    }
}

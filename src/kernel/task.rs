//! User-task primitive
//!
//! A user process is a future polled by the scheduler, one poll per time
//! slice. The contract with user code:
//! - returning `Pending` suspends until the scheduler runs you again
//! - `yield_now().await` is the explicit safe point for busy code
//! - dropping the future is cancellation; blocking syscalls await across
//!   it cleanly
//!
//! There is no reactor and no real waker; the scheduler alone decides
//! who gets polled, so tasks are driven with a no-op waker.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker;

use super::process::Pid;

/// The future type a user program compiles down to. Everything runs on
/// one host thread, so no `Send` bound.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// A spawned task waiting to be adopted by the scheduler.
pub struct UserTask {
    pub pid: Pid,
    pub future: TaskFuture,
}

/// Drive a task for one slice.
pub fn poll_once(future: &mut TaskFuture) -> Poll<()> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    future.as_mut().poll(&mut cx)
}

/// Yield the current slice: pending on the first poll, ready after.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

pub struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.polled {
            Poll::Ready(())
        } else {
            self.polled = true;
            Poll::Pending
        }
    }
}

/// Never completes. Used after exit: the process is a zombie, nothing
/// should run if the scheduler ever polled it again.
pub fn halt() -> Halt {
    Halt
}

pub struct Halt;

impl Future for Halt {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yield_now_pends_once() {
        let mut task: TaskFuture = Box::pin(async {
            yield_now().await;
        });
        assert_eq!(poll_once(&mut task), Poll::Pending);
        assert_eq!(poll_once(&mut task), Poll::Ready(()));
    }

    #[test]
    fn test_halt_never_completes() {
        let mut task: TaskFuture = Box::pin(async {
            halt().await;
        });
        for _ in 0..10 {
            assert_eq!(poll_once(&mut task), Poll::Pending);
        }
    }

    #[test]
    fn test_slices_interleave() {
        use std::cell::Cell;
        use std::rc::Rc;

        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        let mut task: TaskFuture = Box::pin(async move {
            for _ in 0..3 {
                c.set(c.get() + 1);
                yield_now().await;
            }
        });
        assert_eq!(poll_once(&mut task), Poll::Pending);
        assert_eq!(counter.get(), 1);
        assert_eq!(poll_once(&mut task), Poll::Pending);
        assert_eq!(counter.get(), 2);
        assert_eq!(poll_once(&mut task), Poll::Pending);
        assert_eq!(counter.get(), 3);
        assert_eq!(poll_once(&mut task), Poll::Ready(()));
    }
}

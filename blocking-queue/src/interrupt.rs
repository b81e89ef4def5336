//! Cooperative interruption of blocked threads.
//!
//! Every thread owns an interrupt status. [`current`] hands out an
//! [`Interrupter`] for the calling thread, which any other thread may use to
//! raise that status. A thread blocked inside a queue operation is woken up
//! and the operation returns [`Interrupted`](crate::Interrupted). A status
//! raised while the thread is not blocked stays pending until the next
//! blocking call, which then fails immediately.
//!
//! Observing the status through a failed queue operation or through
//! [`interrupted`] clears it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

thread_local! {
    static CURRENT: Arc<Status> = Arc::new(Status {
        interrupted: AtomicBool::new(false),
        thread: thread::current(),
    });
}

struct Status {
    interrupted: AtomicBool,
    thread: Thread,
}

/// A handle to raise the interrupt status of one thread.
#[derive(Clone)]
pub struct Interrupter(Arc<Status>);

impl Interrupter {
    /// Interrupts the owning thread, waking it up if it is parked inside a
    /// queue operation.
    pub fn interrupt(&self) {
        self.0.interrupted.store(true, Ordering::Release);
        // Unparking also covers a thread about to park: the token is kept.
        self.0.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.interrupted.load(Ordering::Acquire)
    }

    pub fn thread(&self) -> &Thread {
        &self.0.thread
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("thread", &self.0.thread.id())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Returns the [`Interrupter`] of the calling thread.
pub fn current() -> Interrupter {
    CURRENT.with(|s| Interrupter(s.clone()))
}

/// Tests and clears the interrupt status of the calling thread.
pub fn interrupted() -> bool {
    CURRENT.with(|s| s.interrupted.swap(false, Ordering::AcqRel))
}

/// Tests the interrupt status of the calling thread without clearing it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|s| s.interrupted.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_per_thread() {
        let this = current();
        std::thread::scope(|cx| {
            cx.spawn(|| {
                let other = current();
                assert_ne!(other.thread().id(), this.thread().id());
                this.interrupt();
                assert!(!is_interrupted());
            });
        });
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
        assert!(!this.is_interrupted());
    }

    #[test]
    fn interrupt_unparks() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|cx| {
            cx.spawn(move || {
                tx.send(current()).unwrap();
                while !is_interrupted() {
                    std::thread::park();
                }
                assert!(interrupted());
            });
            rx.recv().unwrap().interrupt();
        });
    }
}

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, Thread};
use std::time::Instant;

use slab::Slab;

use crate::error::Interrupted;
use crate::interrupt;

/// A lock domain: one mutex guarding one end of the queue, plus a single
/// condition threads may wait on while holding it.
///
/// Waiting threads park themselves instead of sharing a `Condvar`, so that an
/// [`Interrupter`](crate::interrupt::Interrupter) can wake exactly the thread
/// it belongs to without touching this lock.
pub(crate) struct Domain<T> {
    state: Mutex<State<T>>,
}

pub(crate) type Guard<'a, T> = MutexGuard<'a, State<T>>;

pub(crate) struct State<T> {
    pub end: T,
    waiters: Slab<Waiter>,
}

enum Waiter {
    Parked(Thread),
    Notified,
}

impl<T> Domain<T> {
    pub fn new(end: T) -> Self {
        Self {
            state: Mutex::new(State {
                end,
                waiters: Slab::new(),
            }),
        }
    }

    // No critical section can leave the chain half-linked, so a poisoned
    // lock is still consistent.
    pub fn lock(&self) -> Guard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the lock, failing if the calling thread has a pending
    /// interrupt or is interrupted while blocked on the mutex.
    pub fn lock_interruptibly(&self) -> Result<Guard<'_, T>, Interrupted> {
        if interrupt::interrupted() {
            tracing::debug!("interrupted before acquiring lock");
            return Err(Interrupted);
        }
        let guard = self.lock();
        if interrupt::interrupted() {
            drop(guard);
            tracing::debug!("interrupted while acquiring lock");
            return Err(Interrupted);
        }
        Ok(guard)
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .end
    }

    /// Releases `guard`, parks until notified, interrupted, `deadline` is
    /// reached or a spurious wakeup happens, and then reacquires the lock.
    ///
    /// Callers must re-check their condition after this returns. On
    /// interruption the lock is released before returning.
    pub fn wait<'a>(
        &'a self,
        mut guard: Guard<'a, T>,
        deadline: Option<Instant>,
    ) -> Result<Guard<'a, T>, Interrupted> {
        if interrupt::interrupted() {
            drop(guard);
            tracing::debug!("interrupted before waiting");
            return Err(Interrupted);
        }

        let key = guard.waiters.insert(Waiter::Parked(thread::current()));
        drop(guard);
        match deadline {
            Some(deadline) => {
                thread::park_timeout(deadline.saturating_duration_since(Instant::now()))
            },
            None => thread::park(),
        }
        let mut guard = self.lock();

        let notified = matches!(guard.waiters.remove(key), Waiter::Notified);
        if interrupt::interrupted() {
            // Pass on a notification this thread is no longer going to act on.
            if notified {
                guard.notify_one();
            }
            drop(guard);
            tracing::debug!(notified, "interrupted while waiting");
            return Err(Interrupted);
        }
        Ok(guard)
    }
}

impl<T> State<T> {
    /// Wakes up one parked waiter, returning whether there was any.
    pub fn notify_one(&mut self) -> bool {
        let Some((_, waiter)) = self
            .waiters
            .iter_mut()
            .find(|(_, w)| matches!(w, Waiter::Parked(_)))
        else {
            return false;
        };
        match mem::replace(waiter, Waiter::Notified) {
            Waiter::Parked(thread) => thread.unpark(),
            Waiter::Notified => unreachable!("invalid waiter state"),
        }
        true
    }

    #[cfg(test)]
    fn parked(&self) -> usize {
        self.waiters
            .iter()
            .filter(|(_, w)| matches!(w, Waiter::Parked(_)))
            .count()
    }
}

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::domain::{Domain, Guard};
use crate::error::{Interrupted, OfferError, QueueError};

struct Node<E> {
    item: Option<E>,
    next: AtomicPtr<Node<E>>,
}

impl<E> Node<E> {
    fn alloc(item: Option<E>) -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(Self {
            item,
            next: AtomicPtr::new(ptr::null_mut()),
        })))
    }
}

/// A bounded FIFO queue with blocking `put` and `take`.
///
/// Elements live in a singly-linked chain that starts with a sentinel node.
/// Producers only touch the tail under the put lock and consumers only touch
/// the head under the take lock, so one producer and one consumer never
/// contend on the same mutex. The two sides share nothing but an atomic
/// element count. Whenever an operation moves the queue out of the state the
/// other side may be waiting on (empty to non-empty, full to non-full), it
/// briefly takes the other side's lock to wake one waiter there.
pub struct BoundedBlockingQueue<E> {
    capacity: usize,
    count: CachePadded<AtomicUsize>,
    // Guards `head`, the sentinel. Its successor is the front element.
    takes: CachePadded<Domain<NonNull<Node<E>>>>,
    // Guards `tail`, the last linked node.
    puts: CachePadded<Domain<NonNull<Node<E>>>>,
}

// SAFETY: Nodes are only reached through the locks, each end by one side, and
// elements are moved across threads.
unsafe impl<E: Send> Send for BoundedBlockingQueue<E> {}
unsafe impl<E: Send> Sync for BoundedBlockingQueue<E> {}

#[derive(Clone, Copy)]
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

impl Wait {
    fn timeout(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Forever, Self::Until)
    }

    /// Returns the deadline to park with, or `None` if waiting is over.
    fn deadline(self) -> Option<Option<Instant>> {
        match self {
            Self::Never => None,
            Self::Until(deadline) if Instant::now() >= deadline => None,
            Self::Until(deadline) => Some(Some(deadline)),
            Self::Forever => Some(None),
        }
    }
}

enum Refused {
    /// Gave up waiting for the queue to become non-full or non-empty.
    Exhausted,
    Interrupted,
}

impl<E> BoundedBlockingQueue<E> {
    /// Creates a queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidArgument);
        }
        Ok(Self::with_capacity(capacity))
    }

    /// Creates a queue bounded only by `usize::MAX`.
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        let sentinel = Node::alloc(None);
        Self {
            capacity,
            count: CachePadded::new(AtomicUsize::new(0)),
            takes: CachePadded::new(Domain::new(sentinel)),
            puts: CachePadded::new(Domain::new(sentinel)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a snapshot of the number of elements.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.size()
    }

    /// Inserts `element` at the tail, waiting for free capacity if needed.
    ///
    /// Returns [`Interrupted`] if the calling thread is interrupted before
    /// or while waiting, in which case `element` is dropped and the queue is
    /// left unchanged.
    pub fn put(&self, element: E) -> Result<(), Interrupted> {
        match self.insert(element, Wait::Forever) {
            Ok(()) => Ok(()),
            Err((_, Refused::Interrupted)) => Err(Interrupted),
            Err((_, Refused::Exhausted)) => unreachable!("blocking put never gives up"),
        }
    }

    /// Like [`put`](Self::put), but rejects an absent element with
    /// [`QueueError::NullArgument`] before touching the queue.
    pub fn put_opt(&self, element: Option<E>) -> Result<(), QueueError> {
        let element = element.ok_or(QueueError::NullArgument)?;
        Ok(self.put(element)?)
    }

    /// Inserts `element` if the queue is not full, or hands it back.
    pub fn offer(&self, element: E) -> Result<(), E> {
        if self.size() == self.capacity {
            return Err(element);
        }
        self.insert(element, Wait::Never).map_err(|(e, _)| e)
    }

    /// Inserts `element`, waiting at most `timeout` for free capacity.
    pub fn offer_timeout(&self, element: E, timeout: Duration) -> Result<(), OfferError<E>> {
        self.insert(element, Wait::timeout(timeout))
            .map_err(|(e, refused)| match refused {
                Refused::Exhausted => OfferError::Timeout(e),
                Refused::Interrupted => OfferError::Interrupted(e),
            })
    }

    /// Removes the front element, waiting for one to arrive if needed.
    ///
    /// Returns [`Interrupted`] if the calling thread is interrupted before
    /// or while waiting, in which case nothing is removed.
    pub fn take(&self) -> Result<E, Interrupted> {
        match self.remove(Wait::Forever) {
            Ok(e) => Ok(e),
            Err(Refused::Interrupted) => Err(Interrupted),
            Err(Refused::Exhausted) => unreachable!("blocking take never gives up"),
        }
    }

    /// Removes the front element if there is any.
    pub fn poll(&self) -> Option<E> {
        if self.is_empty() {
            return None;
        }
        self.remove(Wait::Never).ok()
    }

    /// Removes the front element, waiting at most `timeout` for one.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<E>, Interrupted> {
        match self.remove(Wait::timeout(timeout)) {
            Ok(e) => Ok(Some(e)),
            Err(Refused::Exhausted) => Ok(None),
            Err(Refused::Interrupted) => Err(Interrupted),
        }
    }

    fn insert(&self, element: E, wait: Wait) -> Result<(), (E, Refused)> {
        let mut tail = match wait {
            Wait::Never => self.puts.lock(),
            _ => match self.puts.lock_interruptibly() {
                Ok(guard) => guard,
                Err(Interrupted) => return Err((element, Refused::Interrupted)),
            },
        };

        while self.count.load(Ordering::Acquire) == self.capacity {
            let Some(deadline) = wait.deadline() else {
                return Err((element, Refused::Exhausted));
            };
            tail = match self.puts.wait(tail, deadline) {
                Ok(guard) => guard,
                Err(Interrupted) => return Err((element, Refused::Interrupted)),
            };
        }

        let c = self.enqueue(&mut tail, element);
        if c + 1 < self.capacity {
            tail.notify_one();
        }
        drop(tail);

        if c == 0 {
            self.signal_not_empty();
        }
        Ok(())
    }

    fn remove(&self, wait: Wait) -> Result<E, Refused> {
        let mut head = match wait {
            Wait::Never => self.takes.lock(),
            _ => self
                .takes
                .lock_interruptibly()
                .map_err(|_| Refused::Interrupted)?,
        };

        while self.count.load(Ordering::Acquire) == 0 {
            let Some(deadline) = wait.deadline() else {
                return Err(Refused::Exhausted);
            };
            head = self
                .takes
                .wait(head, deadline)
                .map_err(|_| Refused::Interrupted)?;
        }

        let (element, c) = self.dequeue(&mut head);
        if c > 1 {
            head.notify_one();
        }
        drop(head);

        if c == self.capacity {
            self.signal_not_full();
        }
        Ok(element)
    }

    /// Links `element` after the tail and returns the count before insertion.
    fn enqueue(&self, tail: &mut Guard<'_, NonNull<Node<E>>>, element: E) -> usize {
        let node = Node::alloc(Some(element));
        // SAFETY: The tail node stays alive while the put lock is held: the
        // take side only frees a node once a successor has been counted,
        // which never holds for the tail.
        unsafe { (*tail.end.as_ptr()).next.store(node.as_ptr(), Ordering::Release) };
        tail.end = node;
        // `Release` publishes the link to a consumer observing the count.
        self.count.fetch_add(1, Ordering::AcqRel)
    }

    /// Unlinks the front element and returns it with the count before
    /// removal. The caller must have observed a non-zero count.
    fn dequeue(&self, head: &mut Guard<'_, NonNull<Node<E>>>) -> (E, usize) {
        let sentinel = head.end;
        // SAFETY: A non-zero count means the successor was linked and
        // published before it was counted.
        let first = unsafe { (*sentinel.as_ptr()).next.load(Ordering::Acquire) };
        debug_assert!(!first.is_null(), "invalid queue state");
        // SAFETY: The put side only ever stores into `next` of this node, and
        // the old sentinel is unreachable for it.
        let element = unsafe {
            let first = NonNull::new_unchecked(first);
            head.end = first;
            drop(Box::from_raw(sentinel.as_ptr()));
            (*first.as_ptr()).item.take()
        };
        let c = self.count.fetch_sub(1, Ordering::AcqRel);
        (element.expect("invalid queue state"), c)
    }

    /// Wakes up a consumer waiting for the queue to become non-empty.
    fn signal_not_empty(&self) {
        let woken = self.takes.lock().notify_one();
        tracing::trace!(woken, "signaled not empty");
    }

    /// Wakes up a producer waiting for the queue to become non-full.
    fn signal_not_full(&self) {
        let woken = self.puts.lock().notify_one();
        tracing::trace!(woken, "signaled not full");
    }
}

impl<E> Default for BoundedBlockingQueue<E> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<E> fmt::Debug for BoundedBlockingQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedBlockingQueue")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl<E> Drop for BoundedBlockingQueue<E> {
    fn drop(&mut self) {
        let mut node = self.takes.get_mut().as_ptr();
        while !node.is_null() {
            // SAFETY: Every node from the sentinel on is exclusively owned by
            // the queue, and the sentinel holds no element.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt;

    #[test]
    fn zero_capacity() {
        assert_eq!(
            BoundedBlockingQueue::<i32>::new(0).unwrap_err(),
            QueueError::InvalidArgument
        );
        assert!(BoundedBlockingQueue::<i32>::new(1).is_ok());
    }

    #[test]
    fn unbounded_by_default() {
        let q = BoundedBlockingQueue::<u8>::default();
        assert_eq!(q.capacity(), usize::MAX);
        assert_eq!(q.remaining_capacity(), usize::MAX);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_order() {
        let input = std::iter::repeat_with(fastrand::alphanumeric)
            .take(64)
            .collect::<Vec<_>>();
        let q = BoundedBlockingQueue::new(input.len()).unwrap();
        for c in input.iter().copied() {
            q.put(c).unwrap();
        }
        assert_eq!(q.size(), input.len());
        assert_eq!(q.remaining_capacity(), 0);

        let output = std::iter::repeat_with(|| q.take().unwrap())
            .take(input.len())
            .collect::<Vec<_>>();
        assert_eq!(output, input);
        assert!(q.is_empty());
    }

    #[test]
    fn interrupt_while_acquiring_lock() {
        let (tx, rx) = std::sync::mpsc::channel();
        let q = BoundedBlockingQueue::new(2).unwrap();

        std::thread::scope(|cx| {
            let held = q.puts.lock();
            let producer = cx.spawn(|| {
                tx.send(interrupt::current()).unwrap();
                let r = q.put(1);
                (r, interrupt::is_interrupted())
            });
            let interrupter = rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            interrupter.interrupt();
            drop(held);
            assert_eq!(producer.join().unwrap(), (Err(Interrupted), false));
        });
        assert!(q.is_empty());

        q.put(2).unwrap();
        std::thread::scope(|cx| {
            let held = q.takes.lock();
            let consumer = cx.spawn(|| {
                tx.send(interrupt::current()).unwrap();
                let r = q.take();
                (r, interrupt::is_interrupted())
            });
            let interrupter = rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            interrupter.interrupt();
            drop(held);
            assert_eq!(consumer.join().unwrap(), (Err(Interrupted), false));
        });
        assert_eq!(q.size(), 1);
        assert_eq!(q.take(), Ok(2));
    }

    #[test]
    fn null_rejected() {
        let q = BoundedBlockingQueue::new(2).unwrap();
        q.put_opt(Some(1)).unwrap();
        assert_eq!(q.put_opt(None), Err(QueueError::NullArgument));
        assert_eq!(q.size(), 1);
        assert_eq!(q.take(), Ok(1));
    }

    #[test]
    fn offer_and_poll() {
        let q = BoundedBlockingQueue::new(2).unwrap();
        assert_eq!(q.poll(), None);
        assert_eq!(q.offer('a'), Ok(()));
        assert_eq!(q.offer('b'), Ok(()));
        assert_eq!(q.offer('c'), Err('c'));
        assert_eq!(q.size(), 2);
        assert_eq!(q.poll(), Some('a'));
        assert_eq!(q.offer('c'), Ok(()));
        assert_eq!(q.poll(), Some('b'));
        assert_eq!(q.poll(), Some('c'));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn timeouts_elapse() {
        let q = BoundedBlockingQueue::new(1).unwrap();
        assert_eq!(q.poll_timeout(Duration::from_millis(10)), Ok(None));
        q.put(1).unwrap();

        let now = Instant::now();
        let err = q.offer_timeout(2, Duration::from_millis(20)).unwrap_err();
        assert!(now.elapsed() >= Duration::from_millis(20));
        assert!(err.is_timeout());
        assert_eq!(err.into_inner(), 2);

        assert_eq!(q.poll_timeout(Duration::MAX), Ok(Some(1)));
        assert_eq!(q.offer_timeout(3, Duration::ZERO), Ok(()));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn pending_interrupt() {
        let q = BoundedBlockingQueue::new(1).unwrap();

        interrupt::current().interrupt();
        assert_eq!(q.put(1), Err(Interrupted));
        assert!(q.is_empty());
        q.put(1).unwrap();

        interrupt::current().interrupt();
        assert_eq!(q.take(), Err(Interrupted));
        assert_eq!(q.size(), 1);

        interrupt::current().interrupt();
        assert_eq!(q.offer_timeout(2, Duration::ZERO), Err(OfferError::Interrupted(2)));
        // Non-blocking operations ignore the status and leave it pending.
        interrupt::current().interrupt();
        assert_eq!(q.poll(), Some(1));
        assert!(interrupt::interrupted());
    }

    #[test]
    fn drop_remaining() {
        use std::sync::atomic::AtomicUsize;

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter;
        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }

        let q = BoundedBlockingQueue::new(8).unwrap();
        for _ in 0..5 {
            q.put(DropCounter).unwrap();
        }
        drop(q.take().unwrap());
        drop(q.take().unwrap());
        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), 2);
        drop(q);
        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), 5);
    }
}

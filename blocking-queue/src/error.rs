use std::fmt;

/// A blocking operation was aborted because the calling thread was
/// [interrupted](crate::interrupt::Interrupter::interrupt).
///
/// The aborted call has made no change to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted while waiting on the queue")
    }
}

impl std::error::Error for Interrupted {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was constructed with a zero capacity.
    InvalidArgument,
    /// An absent element was passed to [`put_opt`].
    ///
    /// [`put_opt`]: crate::BoundedBlockingQueue::put_opt
    NullArgument,
    Interrupted,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => f.write_str("capacity must be positive"),
            Self::NullArgument => f.write_str("element must not be absent"),
            Self::Interrupted => fmt::Display::fmt(&Interrupted, f),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<Interrupted> for QueueError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Error returned by [`offer_timeout`], carrying back the rejected element.
///
/// [`offer_timeout`]: crate::BoundedBlockingQueue::offer_timeout
#[derive(PartialEq, Eq)]
pub enum OfferError<E> {
    /// The queue stayed full for the whole timeout.
    Timeout(E),
    Interrupted(E),
}

impl<E> OfferError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Timeout(e) | Self::Interrupted(e) => e,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

// Elements are not required to be `Debug`.
impl<E> fmt::Debug for OfferError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(_) => f.write_str("Timeout(..)"),
            Self::Interrupted(_) => f.write_str("Interrupted(..)"),
        }
    }
}

impl<E> fmt::Display for OfferError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(_) => f.write_str("timed out waiting for free capacity"),
            Self::Interrupted(_) => fmt::Display::fmt(&Interrupted, f),
        }
    }
}

impl<E> std::error::Error for OfferError<E> {}

//! A bounded blocking FIFO queue with separate locks for producers and
//! consumers.
//!
//! ```
//! use blocking_queue::BoundedBlockingQueue;
//!
//! let queue = BoundedBlockingQueue::new(16).unwrap();
//! std::thread::scope(|cx| {
//!     cx.spawn(|| {
//!         for i in 0..100 {
//!             queue.put(i).unwrap();
//!         }
//!     });
//!     for i in 0..100 {
//!         assert_eq!(queue.take(), Ok(i));
//!     }
//! });
//! ```

mod domain;
mod error;
pub mod interrupt;
mod queue;

pub use self::error::{Interrupted, OfferError, QueueError};
pub use self::interrupt::Interrupter;
pub use self::queue::BoundedBlockingQueue;

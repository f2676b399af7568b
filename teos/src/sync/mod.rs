//! Kernel synchronization primitives.
//!
//! Two sleeping primitives built directly on the scheduler:
//!
//! - [`Semaphore`]: a counting semaphore whose waiters are parked thread
//!   descriptors. Every rendezvous in the kernel (load barriers, join
//!   barriers, user-visible semaphores) is one of these, which is what
//!   makes missed wakeups impossible: a producer ups exactly once, a
//!   consumer downs exactly once, and the count remembers an early signal.
//! - [`Lock`]: mutual exclusion with an owner, built on a binary
//!   semaphore. Under strict-priority scheduling it implements priority
//!   donation, transitively along chains of blocked lock holders.
//!
//! Both types must live at a stable address for as long as any thread can
//! be blocked on them (boxed, or inside a leaked/refcounted owner): a
//! blocked thread records where it waits so that process teardown can
//! extract it.

mod lock;
mod semaphore;

pub use lock::Lock;
pub(crate) use lock::refresh_priority as refresh_thread_priority;
pub use semaphore::Semaphore;

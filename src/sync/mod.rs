//! Synchronization primitives internal to the runtime: the guard spinlock
//! used by the scheduler and by each mutex, and the mutex itself.

pub mod mutex;
mod spin;

pub use mutex::Mutex;
pub use spin::GuardFlag;

//! Admission control primitives built on the shared cache: dedup gate,
//! per-chat distributed lock, and fixed-window rate controller.
//!
//! Each primitive resolves `CacheUnavailable` to a documented default: the
//! dedup gate fails open (availability over exactness), the lock and the rate
//! controller fail closed (duplicate-processing risk over unbounded load).

pub mod dedup;
pub mod lock;
pub mod rate;

pub use dedup::DedupGate;
pub use lock::{ChatLock, LockHandle};
pub use rate::{RateController, RateScope, RateVerdict};

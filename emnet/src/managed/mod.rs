//! Containers with a capacity fixed at construction.
//!
//! Protocol state such as next-hop entries and connection control blocks is referenced from
//! timers and deferred signals long after the code that created it returned. Those references are
//! plain [`Key`]s that are checked on every lookup instead of pointers, so a stale reference to a
//! freed entry is detected rather than aliasing its successor.
//!
//! [`Key`]: slotmap/struct.Key.html
pub mod slotmap;

pub use self::slotmap::{Key, SlotMap};

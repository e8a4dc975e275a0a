//! Drop-in alias surface.
//!
//! Every name here is a re-export of the crate's own items, never a
//! re-implementation, so the exported items are identical to the ones the
//! selected backend defines. Code written against this module and code
//! written against the crate root observe the very same types, selected
//! once at build time by the platform shim.

pub use crate::error::{Error, Result};
pub use crate::event::{Event, Filter, Interest};
pub use crate::notifier::{Events, Notifier};

#[cfg(target_os = "linux")]
pub use crate::notifier::epoll::Epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use crate::notifier::kqueue::{KChange, KFilter, KFlag, Kqueue};

use std::os::unix::io::RawFd;

use bitflags::bitflags;

bitflags! {
    /// The set of conditions watched on, or observed ready on, a file
    /// descriptor.
    ///
    /// `EDGE` and `ONESHOT` are delivery modifiers rather than conditions:
    /// they control whether a condition is reported once per state
    /// transition, or once and then disabled.
    pub struct Interest: u32 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
        const PRIORITY = 0b0000_0100;
        const ERROR    = 0b0000_1000;
        const HANGUP   = 0b0001_0000;
        const EDGE     = 0b0010_0000;
        const ONESHOT  = 0b0100_0000;
    }
}

impl Interest {
    pub fn is_readable(&self) -> bool {
        self.contains(Interest::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Interest::WRITABLE)
    }

    pub fn is_priority(&self) -> bool {
        self.contains(Interest::PRIORITY)
    }

    pub fn is_error(&self) -> bool {
        self.contains(Interest::ERROR)
    }

    pub fn is_hangup(&self) -> bool {
        self.contains(Interest::HANGUP)
    }

    pub fn is_edge(&self) -> bool {
        self.contains(Interest::EDGE)
    }

    pub fn is_oneshot(&self) -> bool {
        self.contains(Interest::ONESHOT)
    }

    /// Registration filters implied by this mask.
    ///
    /// A registration is keyed by `(descriptor, filter)`. epoll holds a
    /// single registration per descriptor; kqueue holds one per filter, so
    /// a mask covering both conditions produces two kernel entries.
    pub fn filters(self) -> impl Iterator<Item = Filter> {
        [Filter::Read, Filter::Write]
            .into_iter()
            .filter(move |f| match f {
                Filter::Read => self.is_readable(),
                Filter::Write => self.is_writable(),
            })
    }
}

/// The filter component of a registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Filter {
    Read,
    Write,
}

/// A single readiness notification returned by a wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    fd: RawFd,
    readiness: Interest,
    token: u64,
}

impl Event {
    pub(crate) fn new(fd: RawFd, readiness: Interest, token: u64) -> Event {
        Event {
            fd,
            readiness,
            token,
        }
    }

    /// The watched descriptor the notification refers to.
    ///
    /// On the epoll backend the kernel echoes a single 64-bit word per
    /// event; with the default token that word is the descriptor itself,
    /// and a caller-supplied token takes its place. On kqueue the
    /// descriptor and token travel separately and both are exact.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Conditions observed ready.
    pub fn readiness(&self) -> Interest {
        self.readiness
    }

    /// The token supplied at registration.
    pub fn token(&self) -> u64 {
        self.token
    }
}

#[cfg(test)]
mod tests {
    use super::{Filter, Interest};

    #[test]
    fn filters_follow_mask() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert_eq!(
            both.filters().collect::<Vec<_>>(),
            [Filter::Read, Filter::Write]
        );
        assert_eq!(
            Interest::WRITABLE.filters().collect::<Vec<_>>(),
            [Filter::Write]
        );
        assert_eq!(Interest::HANGUP.filters().count(), 0);
    }

    #[test]
    fn modifiers_do_not_imply_conditions() {
        let evts = Interest::READABLE | Interest::EDGE | Interest::ONESHOT;
        assert!(evts.is_readable());
        assert!(!evts.is_writable());
        assert!(evts.is_edge());
        assert!(evts.is_oneshot());
    }
}

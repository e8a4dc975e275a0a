use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::slice;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::event::{Event, Interest};

bitflags! {
    struct EpollFlag: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLPRI = libc::EPOLLPRI as u32;
        const EPOLLOUT = libc::EPOLLOUT as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
        const EPOLLRDHUP = libc::EPOLLRDHUP as u32;
        const EPOLLET = libc::EPOLLET as u32;
        const EPOLLONESHOT = libc::EPOLLONESHOT as u32;
    }
}

impl From<Interest> for EpollFlag {
    fn from(evts: Interest) -> EpollFlag {
        let mut flags = EpollFlag::empty();

        if evts.is_readable() {
            flags.insert(EpollFlag::EPOLLIN);
        }
        if evts.is_writable() {
            flags.insert(EpollFlag::EPOLLOUT);
        }
        if evts.is_priority() {
            flags.insert(EpollFlag::EPOLLPRI);
        }
        if evts.is_error() {
            flags.insert(EpollFlag::EPOLLERR);
        }
        if evts.is_hangup() {
            flags.insert(EpollFlag::EPOLLRDHUP);
        }
        if evts.is_edge() {
            flags.insert(EpollFlag::EPOLLET);
        }
        if evts.is_oneshot() {
            flags.insert(EpollFlag::EPOLLONESHOT);
        }

        flags
    }
}

impl From<EpollFlag> for Interest {
    fn from(flags: EpollFlag) -> Interest {
        let mut evts = Interest::empty();

        if flags.contains(EpollFlag::EPOLLIN) {
            evts.insert(Interest::READABLE);
        }
        if flags.contains(EpollFlag::EPOLLOUT) {
            evts.insert(Interest::WRITABLE);
        }
        if flags.contains(EpollFlag::EPOLLPRI) {
            evts.insert(Interest::PRIORITY);
        }
        if flags.contains(EpollFlag::EPOLLERR) {
            evts.insert(Interest::ERROR);
        }
        if flags.contains(EpollFlag::EPOLLHUP) || flags.contains(EpollFlag::EPOLLRDHUP) {
            evts.insert(Interest::HANGUP);
        }

        evts
    }
}

fn epoll_create() -> io::Result<OwnedFd> {
    let res = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(res) })
    }
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, event: &mut libc::epoll_event) -> io::Result<()> {
    let res = unsafe { libc::epoll_ctl(epfd, op, fd, event) };

    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event], timeout: libc::c_int) -> io::Result<usize> {
    let res = unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout,
        )
    };

    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// A handle owning one epoll instance.
///
/// Watched descriptors remain owned by the caller; the handle only ever
/// closes its own descriptor. Closing is idempotent, and dropping an
/// unclosed handle closes it.
pub struct Epoll {
    epfd: Option<OwnedFd>,
    events: Vec<libc::epoll_event>,
    registered: usize,
}

impl Epoll {
    pub fn new() -> Result<Epoll> {
        let epfd = epoll_create().map_err(Error::Resource)?;

        Ok(Epoll {
            epfd: Some(epfd),
            events: Vec::new(),
            registered: 0,
        })
    }

    fn epfd(&self) -> Result<RawFd> {
        match &self.epfd {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(Error::Closed),
        }
    }

    /// The raw epoll descriptor, for interop with lower-level polling.
    pub fn fileno(&self) -> Result<RawFd> {
        self.epfd()
    }

    pub fn is_closed(&self) -> bool {
        self.epfd.is_none()
    }

    /// Release the epoll descriptor. A second close is a no-op; every
    /// other operation afterwards fails with `Error::Closed`.
    pub fn close(&mut self) {
        self.epfd.take();
    }

    /// Add a watch for `fd`, keyed by the descriptor itself.
    pub fn register(&mut self, fd: RawFd, evts: Interest) -> Result<()> {
        self.register_tagged(fd, evts, fd as u64)
    }

    /// Add a watch for `fd` carrying a caller-chosen token. The token
    /// occupies the kernel's per-event data word, so it replaces the
    /// descriptor in returned events.
    pub fn register_tagged(&mut self, fd: RawFd, evts: Interest, token: u64) -> Result<()> {
        let epfd = self.epfd()?;
        check_registerable(fd, evts)?;

        let mut ev = libc::epoll_event {
            events: EpollFlag::from(evts).bits(),
            u64: token,
        };

        match epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) {
            Ok(()) => {
                self.registered += 1;
                Ok(())
            }
            Err(err) => Err(match err.raw_os_error() {
                Some(libc::EEXIST) => Error::AlreadyRegistered { fd },
                Some(libc::EBADF) | Some(libc::EPERM) => Error::InvalidDescriptor { fd, source: err },
                _ => Error::Resource(err),
            }),
        }
    }

    /// Replace the interest mask of an existing watch.
    pub fn modify(&mut self, fd: RawFd, evts: Interest) -> Result<()> {
        self.modify_tagged(fd, evts, fd as u64)
    }

    /// Replace the interest mask and token of an existing watch.
    pub fn modify_tagged(&mut self, fd: RawFd, evts: Interest, token: u64) -> Result<()> {
        let epfd = self.epfd()?;
        check_registerable(fd, evts)?;

        let mut ev = libc::epoll_event {
            events: EpollFlag::from(evts).bits(),
            u64: token,
        };

        match epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) {
            Ok(()) => Ok(()),
            Err(err) => Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::NotRegistered { fd },
                Some(libc::EBADF) | Some(libc::EPERM) => Error::InvalidDescriptor { fd, source: err },
                _ => Error::Resource(err),
            }),
        }
    }

    /// Remove the watch for `fd`.
    ///
    /// A descriptor the caller already closed is not an error: the kernel
    /// drops closed descriptors from the interest set on its own, so the
    /// watch is gone either way.
    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        let epfd = self.epfd()?;

        // The kernel ignores the event argument for EPOLL_CTL_DEL but old
        // kernels reject a null pointer, so hand it a zeroed one.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };

        match epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) {
            Ok(()) => {
                self.registered = self.registered.saturating_sub(1);
                Ok(())
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EBADF) => {
                    self.registered = self.registered.saturating_sub(1);
                    Ok(())
                }
                Some(libc::ENOENT) => Err(Error::NotRegistered { fd }),
                _ => Err(Error::Resource(err)),
            },
        }
    }

    /// Block until a watched condition is ready, `timeout` elapses, or
    /// forever when `timeout` is `None`. `Some(Duration::ZERO)` polls.
    ///
    /// Signal interruption is retried against an absolute deadline
    /// computed up front, so retries never extend the total wait. The
    /// timeout is truncated to whole milliseconds, never rounded up past
    /// the caller's deadline.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Events<'_>> {
        let epfd = self.epfd()?;

        let want = self.registered.max(1);
        self.events.clear();
        self.events
            .resize(want, libc::epoll_event { events: 0, u64: 0 });

        let deadline = timeout.map(|t| Instant::now() + t);

        let nevents = loop {
            let millis = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
                }
            };

            match epoll_wait(epfd, &mut self.events, millis) {
                Ok(n) => break n,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            break 0;
                        }
                    }
                }
                Err(err) => return Err(Error::Resource(err)),
            }
        };

        self.events.truncate(nevents);
        Ok(Events(self.events.iter()))
    }
}

fn check_registerable(fd: RawFd, evts: Interest) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvalidDescriptor {
            fd,
            source: io::Error::from_raw_os_error(libc::EBADF),
        });
    }
    if evts.is_empty() {
        return Err(Error::EmptyInterest { fd });
    }
    Ok(())
}

fn from_epoll(epev: &libc::epoll_event) -> Event {
    let flags = EpollFlag::from_bits_truncate(epev.events);
    let token = epev.u64;
    Event::new(token as RawFd, flags.into(), token)
}

/// Iterator over the events returned by one wait call.
pub struct Events<'a>(slice::Iter<'a, libc::epoll_event>);

impl<'a> Iterator for Events<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(from_epoll)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<'a> ExactSizeIterator for Events<'a> {}

impl<'a> DoubleEndedIterator for Events<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.0.next_back().map(from_epoll)
    }
}

impl FromRawFd for Epoll {
    /// Adopt an already-created epoll descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open epoll descriptor, and ownership passes to the
    /// returned handle.
    unsafe fn from_raw_fd(fd: RawFd) -> Epoll {
        Epoll {
            epfd: Some(OwnedFd::from_raw_fd(fd)),
            events: Vec::new(),
            registered: 0,
        }
    }
}

use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::slice;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::event::{Event, Filter, Interest};

/// The kernel filters a watch can be keyed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum KFilter {
    Read = libc::EVFILT_READ,
    Write = libc::EVFILT_WRITE,
}

impl KFilter {
    // Only the two descriptor filters are reachable through this
    // interface, so anything else read back from the kernel is a read.
    fn from_raw(raw: i16) -> KFilter {
        if raw == libc::EVFILT_WRITE {
            KFilter::Write
        } else {
            KFilter::Read
        }
    }
}

impl From<Filter> for KFilter {
    fn from(filter: Filter) -> KFilter {
        match filter {
            Filter::Read => KFilter::Read,
            Filter::Write => KFilter::Write,
        }
    }
}

bitflags! {
    /// Actions and status bits carried by a change or returned event.
    pub struct KFlag: u16 {
        const EV_ADD = libc::EV_ADD;
        const EV_DELETE = libc::EV_DELETE;
        const EV_ENABLE = libc::EV_ENABLE;
        const EV_DISABLE = libc::EV_DISABLE;
        const EV_ONESHOT = libc::EV_ONESHOT;
        const EV_CLEAR = libc::EV_CLEAR;
        const EV_RECEIPT = libc::EV_RECEIPT;
        const EV_EOF = libc::EV_EOF;
        const EV_ERROR = libc::EV_ERROR;
    }
}

/// One entry of a kevent changelist, and the shape events come back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KChange {
    pub ident: usize,
    pub filter: KFilter,
    pub flags: KFlag,
    pub fflags: u32,
    pub data: isize,
    pub udata: u64,
}

impl KChange {
    pub fn new(ident: usize, filter: KFilter) -> KChange {
        KChange {
            ident,
            filter,
            flags: KFlag::EV_ADD,
            fflags: 0,
            data: 0,
            udata: 0,
        }
    }

    // Field-by-field into a zeroed kevent: the struct grew extension
    // fields on some systems, and zero is the right value for all of them.
    fn to_raw(&self) -> libc::kevent {
        let mut kev: libc::kevent = unsafe { mem::zeroed() };
        kev.ident = self.ident as libc::uintptr_t;
        kev.filter = self.filter as i16 as _;
        kev.flags = self.flags.bits() as _;
        kev.fflags = self.fflags as _;
        kev.data = self.data as _;
        kev.udata = self.udata as _;
        kev
    }

    fn from_raw(kev: &libc::kevent) -> KChange {
        KChange {
            ident: kev.ident as usize,
            filter: KFilter::from_raw(kev.filter as i16),
            flags: KFlag::from_bits_truncate(kev.flags as u16),
            fflags: kev.fflags as u32,
            data: kev.data as isize,
            udata: kev.udata as u64,
        }
    }
}

fn kqueue() -> io::Result<OwnedFd> {
    let res = unsafe { libc::kqueue() };

    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(res) })
    }
}

fn kevent(
    kq: RawFd,
    changelist: &[libc::kevent],
    eventlist: &mut [libc::kevent],
    timeout: Option<&libc::timespec>,
) -> io::Result<usize> {
    let tspec = timeout.map_or(ptr::null(), |t| t as *const libc::timespec);

    let res = unsafe {
        libc::kevent(
            kq,
            changelist.as_ptr(),
            changelist.len() as libc::c_int,
            eventlist.as_mut_ptr(),
            eventlist.len() as libc::c_int,
            tspec,
        )
    };

    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

const IMMEDIATE: libc::timespec = unsafe { mem::zeroed() };

fn timespec_from(dur: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_nsec: dur.subsec_nanos() as libc::c_long,
    }
}

fn raw_change(fd: RawFd, filter: KFilter, flags: KFlag, udata: u64) -> libc::kevent {
    KChange {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata,
    }
    .to_raw()
}

/// A handle owning one kqueue instance.
///
/// Watched descriptors remain owned by the caller; the handle only ever
/// closes its own descriptor. Closing is idempotent, and dropping an
/// unclosed handle closes it.
pub struct Kqueue {
    kqfd: Option<OwnedFd>,
    events: Vec<libc::kevent>,
    registered: usize,
}

impl Kqueue {
    pub fn new() -> Result<Kqueue> {
        let kqfd = kqueue().map_err(Error::Resource)?;

        Ok(Kqueue {
            kqfd: Some(kqfd),
            events: Vec::new(),
            registered: 0,
        })
    }

    fn kqfd(&self) -> Result<RawFd> {
        match &self.kqfd {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(Error::Closed),
        }
    }

    /// The raw kqueue descriptor, for interop with lower-level polling.
    pub fn fileno(&self) -> Result<RawFd> {
        self.kqfd()
    }

    pub fn is_closed(&self) -> bool {
        self.kqfd.is_none()
    }

    /// Release the kqueue descriptor. A second close is a no-op; every
    /// other operation afterwards fails with `Error::Closed`.
    pub fn close(&mut self) {
        self.kqfd.take();
    }

    /// Submit a changelist and collect up to `max_events` ready events in
    /// one `kevent` call. `None` blocks indefinitely.
    ///
    /// The kernel applies the changelist before sleeping, so a retry after
    /// signal interruption re-enters the wait with an empty changelist
    /// rather than re-submitting it.
    pub fn control(
        &mut self,
        changes: &[KChange],
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<KChange>> {
        let kqfd = self.kqfd()?;

        let raw: Vec<libc::kevent> = changes.iter().map(KChange::to_raw).collect();
        let mut out: Vec<libc::kevent> = vec![unsafe { mem::zeroed() }; max_events];

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending: &[libc::kevent] = &raw;

        let nevents = loop {
            let tspec = deadline.map(|deadline| {
                timespec_from(deadline.saturating_duration_since(Instant::now()))
            });

            match kevent(kqfd, pending, &mut out, tspec.as_ref()) {
                Ok(n) => break n,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {
                    pending = &[];
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            break 0;
                        }
                    }
                }
                Err(err) => return Err(Error::Resource(err)),
            }
        };

        out.truncate(nevents);
        Ok(out.iter().map(KChange::from_raw).collect())
    }

    /// Add a watch for `fd`, keyed by the descriptor itself.
    ///
    /// `EV_ADD` is an upsert: re-registering an existing `(fd, filter)`
    /// pair updates it, and the same fd under the other filter is a
    /// distinct registration, not a conflict.
    pub fn register(&mut self, fd: RawFd, evts: Interest) -> Result<()> {
        self.register_tagged(fd, evts, fd as u64)
    }

    /// Add a watch for `fd` carrying a caller-chosen token, delivered back
    /// through the `udata` field of matching events.
    pub fn register_tagged(&mut self, fd: RawFd, evts: Interest, token: u64) -> Result<()> {
        let kqfd = self.kqfd()?;
        check_registerable(fd, evts)?;

        apply_interest(kqfd, fd, evts, token)?;
        self.registered += 1;
        Ok(())
    }

    /// Replace the interest mask of an existing watch.
    pub fn modify(&mut self, fd: RawFd, evts: Interest) -> Result<()> {
        self.modify_tagged(fd, evts, fd as u64)
    }

    /// Replace the interest mask and token of an existing watch.
    ///
    /// kqueue has no in-place edit, so the watch is removed and
    /// re-submitted under the same key; mask, token, and the edge/one-shot
    /// modifiers are all replaced by the new registration.
    pub fn modify_tagged(&mut self, fd: RawFd, evts: Interest, token: u64) -> Result<()> {
        let kqfd = self.kqfd()?;
        check_registerable(fd, evts)?;

        let dropped = delete_filters(kqfd, fd)?;
        if dropped == 0 {
            return Err(Error::NotRegistered { fd });
        }

        apply_interest(kqfd, fd, evts, token)
    }

    /// Remove the watch for `fd`.
    ///
    /// A descriptor the caller already closed is not an error: the kernel
    /// drops closed descriptors from the queue on its own, so the watch is
    /// gone either way.
    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        let kqfd = self.kqfd()?;

        let dropped = delete_filters(kqfd, fd)?;
        if dropped == 0 {
            return Err(Error::NotRegistered { fd });
        }

        self.registered = self.registered.saturating_sub(1);
        Ok(())
    }

    /// Block until a watched condition is ready, `timeout` elapses, or
    /// forever when `timeout` is `None`. `Some(Duration::ZERO)` polls.
    ///
    /// Signal interruption is retried against an absolute deadline
    /// computed up front, so retries never extend the total wait. The
    /// timeout is handed to the kernel at nanosecond resolution.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Events<'_>> {
        let kqfd = self.kqfd()?;

        let want = self.registered.max(1);
        self.events.clear();
        self.events.resize(want, unsafe { mem::zeroed() });

        let deadline = timeout.map(|t| Instant::now() + t);

        let nevents = loop {
            let tspec = deadline.map(|deadline| {
                timespec_from(deadline.saturating_duration_since(Instant::now()))
            });

            match kevent(kqfd, &[], &mut self.events, tspec.as_ref()) {
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
    // Only the read and write filters install kernel state; a mask without
    // either registers nothing.
    if evts.filters().next().is_none() {
        return Err(Error::EmptyInterest { fd });
    }
    Ok(())
}

/// Submit `EV_ADD` registrations for every filter the mask implies.
/// `EV_RECEIPT` forces per-change status instead of a blended error.
fn apply_interest(kqfd: RawFd, fd: RawFd, evts: Interest, token: u64) -> Result<()> {
    let mut flags = KFlag::EV_ADD | KFlag::EV_ENABLE | KFlag::EV_RECEIPT;
    if evts.is_edge() {
        flags |= KFlag::EV_CLEAR;
    }
    if evts.is_oneshot() {
        flags |= KFlag::EV_ONESHOT;
    }

    let changes: Vec<libc::kevent> = evts
        .filters()
        .map(|filter| raw_change(fd, filter.into(), flags, token))
        .collect();

    let mut receipts: [libc::kevent; 2] = unsafe { mem::zeroed() };
    let n = kevent(kqfd, &changes, &mut receipts[..changes.len()], Some(&IMMEDIATE))
        .map_err(Error::Resource)?;

    for receipt in receipts.iter().take(n) {
        match receipt.data as i32 {
            0 => {}
            errno @ (libc::EBADF | libc::EPERM | libc::ENODEV) => {
                return Err(Error::InvalidDescriptor {
                    fd,
                    source: io::Error::from_raw_os_error(errno),
                })
            }
            errno => return Err(Error::Resource(io::Error::from_raw_os_error(errno))),
        }
    }

    Ok(())
}

/// Delete both filters for `fd`, returning how many actually existed.
/// `ENOENT` receipts mean the filter was never there; `EBADF` means the
/// caller closed the descriptor first, which counts as removed.
fn delete_filters(kqfd: RawFd, fd: RawFd) -> Result<usize> {
    let probes = [
        raw_change(fd, KFilter::Read, KFlag::EV_DELETE | KFlag::EV_RECEIPT, 0),
        raw_change(fd, KFilter::Write, KFlag::EV_DELETE | KFlag::EV_RECEIPT, 0),
    ];

    let mut receipts: [libc::kevent; 2] = unsafe { mem::zeroed() };
    let n = kevent(kqfd, &probes, &mut receipts, Some(&IMMEDIATE)).map_err(Error::Resource)?;

    let mut dropped = 0;
    for receipt in receipts.iter().take(n) {
        match receipt.data as i32 {
            0 | libc::EBADF => dropped += 1,
            libc::ENOENT => {}
            errno => return Err(Error::Resource(io::Error::from_raw_os_error(errno))),
        }
    }

    Ok(dropped)
}

fn from_kevent(kev: &libc::kevent) -> Event {
    let mut readiness = match KFilter::from_raw(kev.filter as i16) {
        KFilter::Read => Interest::READABLE,
        KFilter::Write => Interest::WRITABLE,
    };

    let flags = KFlag::from_bits_truncate(kev.flags as u16);
    if flags.contains(KFlag::EV_EOF) {
        readiness.insert(Interest::HANGUP);
    }
    if flags.contains(KFlag::EV_ERROR) {
        readiness.insert(Interest::ERROR);
    }

    Event::new(kev.ident as RawFd, readiness, kev.udata as u64)
}

/// Iterator over the events returned by one wait call.
pub struct Events<'a>(slice::Iter<'a, libc::kevent>);

impl<'a> Iterator for Events<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(from_kevent)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<'a> ExactSizeIterator for Events<'a> {}

impl<'a> DoubleEndedIterator for Events<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.0.next_back().map(from_kevent)
    }
}

impl FromRawFd for Kqueue {
    /// Adopt an already-created kqueue descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open kqueue descriptor, and ownership passes to the
    /// returned handle.
    unsafe fn from_raw_fd(fd: RawFd) -> Kqueue {
        Kqueue {
            kqfd: Some(OwnedFd::from_raw_fd(fd)),
            events: Vec::new(),
            registered: 0,
        }
    }
}

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use rouse::{Error, Interest, Notifier};

struct Pipe {
    read: RawFd,
    write: RawFd,
}

impl Pipe {
    fn new() -> io::Result<Pipe> {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe {
            read: fds[0],
            write: fds[1],
        })
    }

    fn close_read(&mut self) {
        if self.read >= 0 {
            unsafe { libc::close(self.read) };
            self.read = -1;
        }
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::read(
                self.read,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len() as libc::size_t,
            )
        };
        match ret {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::write(
                self.write,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::size_t,
            )
        };
        match ret {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            if self.read >= 0 {
                libc::close(self.read);
            }
            if self.write >= 0 {
                libc::close(self.write);
            }
        }
    }
}

#[test]
fn test_create_close() {
    let mut notifier = Notifier::new().unwrap();
    assert!(!notifier.is_closed());
    assert!(notifier.fileno().is_ok());

    notifier.close();
    assert!(notifier.is_closed());
    notifier.close();
    assert!(notifier.is_closed());

    assert!(matches!(notifier.fileno(), Err(Error::Closed)));
    assert!(matches!(
        notifier.register(0, Interest::READABLE),
        Err(Error::Closed)
    ));
    assert!(matches!(
        notifier.wait(Some(Duration::ZERO)).map(|_| ()),
        Err(Error::Closed)
    ));
}

#[test]
fn test_idle_poll() {
    let pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe.read, Interest::READABLE).unwrap();
    assert_eq!(notifier.wait(Some(Duration::ZERO)).unwrap().count(), 0);
}

#[test]
fn test_roundtrip() {
    let mut pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe.read, Interest::READABLE).unwrap();
    pipe.write_all(b"x").unwrap();

    let events: Vec<_> = notifier
        .wait(Some(Duration::from_secs(2)))
        .unwrap()
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].fd(), pipe.read);
    assert!(events[0].readiness().is_readable());
}

#[test]
fn test_wait_blocking() {
    fn count_events(notifier: &mut Notifier) -> usize {
        // Both descriptors are already ready, so the indefinite wait
        // returns without blocking.
        notifier.wait(None).unwrap().count()
    }

    let mut pipe1 = Pipe::new().unwrap();
    let mut pipe2 = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe1.read, Interest::READABLE).unwrap();
    notifier.register(pipe2.read, Interest::READABLE).unwrap();

    pipe1.write_all(b"twelve bytes").unwrap();
    assert_eq!(count_events(&mut notifier), 1);
    pipe2.write_all(b"more data").unwrap();
    assert_eq!(count_events(&mut notifier), 2);

    let mut buf = [0; 12];
    assert_eq!(pipe1.read(&mut buf).unwrap(), 12);
    assert_eq!(count_events(&mut notifier), 1);
}

#[test]
fn test_unregister() {
    fn first_fd(notifier: &mut Notifier) -> RawFd {
        notifier.wait(None).unwrap().next().unwrap().fd()
    }

    let mut pipe1 = Pipe::new().unwrap();
    let mut pipe2 = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe1.read, Interest::READABLE).unwrap();
    notifier.register(pipe2.read, Interest::READABLE).unwrap();
    pipe1.write_all(b"abc").unwrap();
    pipe2.write_all(b"def").unwrap();

    notifier.unregister(pipe1.read).unwrap();
    assert_eq!(first_fd(&mut notifier), pipe2.read);
    notifier.register(pipe1.read, Interest::READABLE).unwrap();
    notifier.unregister(pipe2.read).unwrap();
    assert_eq!(first_fd(&mut notifier), pipe1.read);
}

// kqueue's add is an upsert, so only epoll reports a duplicate.
#[cfg(target_os = "linux")]
#[test]
fn test_duplicate_register() {
    let pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe.read, Interest::READABLE).unwrap();
    assert!(matches!(
        notifier.register(pipe.read, Interest::READABLE),
        Err(Error::AlreadyRegistered { .. })
    ));
}

#[test]
fn test_absent_registration() {
    let pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    assert!(matches!(
        notifier.modify(pipe.read, Interest::READABLE),
        Err(Error::NotRegistered { .. })
    ));
    assert!(matches!(
        notifier.unregister(pipe.read),
        Err(Error::NotRegistered { .. })
    ));
}

#[test]
fn test_modify_replaces_mask() {
    let pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    // A pipe's write end is never readable, so nothing fires...
    notifier.register(pipe.write, Interest::READABLE).unwrap();
    assert_eq!(notifier.wait(Some(Duration::ZERO)).unwrap().count(), 0);

    // ...until the watch is swapped to writability.
    notifier.modify(pipe.write, Interest::WRITABLE).unwrap();
    let events: Vec<_> = notifier.wait(Some(Duration::ZERO)).unwrap().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].fd(), pipe.write);
    assert!(events[0].readiness().is_writable());
}

#[test]
fn test_stale_fd_unregister() {
    let mut pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe.read, Interest::READABLE).unwrap();
    pipe.close_read();

    notifier.unregister(pipe.read).unwrap();
    assert_eq!(notifier.wait(Some(Duration::ZERO)).unwrap().count(), 0);
}

#[test]
fn test_timeout_elapses() {
    let pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier.register(pipe.read, Interest::READABLE).unwrap();

    let start = Instant::now();
    let count = notifier.wait(Some(Duration::from_millis(150))).unwrap().count();
    let elapsed = start.elapsed();

    assert_eq!(count, 0);
    assert!(elapsed >= Duration::from_millis(140), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
}

#[test]
fn test_rejected_preconditions() {
    let pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    assert!(matches!(
        notifier.register(pipe.read, Interest::empty()),
        Err(Error::EmptyInterest { .. })
    ));
    assert!(matches!(
        notifier.register(-1, Interest::READABLE),
        Err(Error::InvalidDescriptor { .. })
    ));
}

#[test]
fn test_token_echo() {
    let mut pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier
        .register_tagged(pipe.read, Interest::READABLE, 0xDEAD)
        .unwrap();
    pipe.write_all(b"x").unwrap();

    let events: Vec<_> = notifier
        .wait(Some(Duration::from_secs(2)))
        .unwrap()
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token(), 0xDEAD);
}

#[test]
fn test_edge_reports_once() {
    let mut pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier
        .register(pipe.read, Interest::READABLE | Interest::EDGE)
        .unwrap();
    pipe.write_all(b"x").unwrap();

    assert_eq!(notifier.wait(Some(Duration::from_secs(2))).unwrap().count(), 1);
    // No new transition, so the edge is not re-reported.
    assert_eq!(notifier.wait(Some(Duration::ZERO)).unwrap().count(), 0);
}

#[test]
fn test_oneshot_disables() {
    let mut pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    notifier
        .register(pipe.read, Interest::READABLE | Interest::ONESHOT)
        .unwrap();
    pipe.write_all(b"x").unwrap();

    assert_eq!(notifier.wait(Some(Duration::from_secs(2))).unwrap().count(), 1);
    assert_eq!(notifier.wait(Some(Duration::ZERO)).unwrap().count(), 0);
}

#[test]
fn test_compat_identity() {
    use std::any::TypeId;

    assert_eq!(
        TypeId::of::<Notifier>(),
        TypeId::of::<rouse::compat::Notifier>()
    );
    assert_eq!(TypeId::of::<Error>(), TypeId::of::<rouse::compat::Error>());
    assert_eq!(
        TypeId::of::<Interest>(),
        TypeId::of::<rouse::compat::Interest>()
    );
    assert_eq!(
        TypeId::of::<rouse::Event>(),
        TypeId::of::<rouse::compat::Event>()
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_backend_identity() {
    use std::any::TypeId;

    assert_eq!(TypeId::of::<Notifier>(), TypeId::of::<rouse::Epoll>());
    assert_eq!(
        TypeId::of::<rouse::Epoll>(),
        TypeId::of::<rouse::compat::Epoll>()
    );
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
#[test]
fn test_control_batch() {
    use rouse::{KChange, KFilter, KFlag};

    let mut pipe = Pipe::new().unwrap();
    let mut notifier = Notifier::new().unwrap();

    // Submit the change without collecting events.
    let add = KChange {
        flags: KFlag::EV_ADD | KFlag::EV_ENABLE,
        ..KChange::new(pipe.read as usize, KFilter::Read)
    };
    let out = notifier.control(&[add], 0, Some(Duration::ZERO)).unwrap();
    assert!(out.is_empty());

    pipe.write_all(b"x").unwrap();

    let out = notifier
        .control(&[], 1, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].ident, pipe.read as usize);
    assert_eq!(out[0].filter, KFilter::Read);
}

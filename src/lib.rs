mod error;
mod event;
mod notifier;

pub mod compat;

pub use error::{Error, Result};
pub use event::{Event, Filter, Interest};
pub use notifier::{Events, Notifier};

#[cfg(target_os = "linux")]
pub use notifier::epoll::Epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use notifier::kqueue::{KChange, KFilter, KFlag, Kqueue};

use std::io;
use std::os::unix::io::AsRawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

pub trait NonBlocking {
    fn set_nonblock(&mut self) -> io::Result<()>;
    fn set_block(&mut self) -> io::Result<()>;
}

impl<T> NonBlocking for T
where
    T: AsRawFd,
{
    fn set_nonblock(&mut self) -> io::Result<()> {
        let rawfd = self.as_raw_fd();
        let bits = fcntl(rawfd, FcntlArg::F_GETFL).map_err(from_nix)?;
        let mut flags = OFlag::from_bits_truncate(bits);
        flags.insert(OFlag::O_NONBLOCK);
        fcntl(rawfd, FcntlArg::F_SETFL(flags)).map_err(from_nix)?;
        Ok(())
    }

    fn set_block(&mut self) -> io::Result<()> {
        let rawfd = self.as_raw_fd();
        let bits = fcntl(rawfd, FcntlArg::F_GETFL).map_err(from_nix)?;
        let mut flags = OFlag::from_bits_truncate(bits);
        flags.remove(OFlag::O_NONBLOCK);
        fcntl(rawfd, FcntlArg::F_SETFL(flags)).map_err(from_nix)?;
        Ok(())
    }
}

fn from_nix(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

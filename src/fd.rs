use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;

/// Owning handle for an OS file descriptor.
///
/// At most one descriptor is owned at a time and it is closed when the
/// handle is dropped. Duplication is explicit: `try_clone` performs an
/// OS-level `dup` and yields an independent descriptor. Moving a handle
/// transfers ownership; `reset` closes the previous descriptor before
/// adopting a new one.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    pub fn new(fd: RawFd) -> Self {
        Fd(fd)
    }

    /// A handle that owns nothing.
    pub fn invalid() -> Self {
        Fd(-1)
    }

    pub fn get(&self) -> RawFd {
        self.0
    }

    pub fn valid(&self) -> bool {
        self.0 >= 0
    }

    /// Close the current descriptor (if any) and adopt `fd`.
    pub fn reset(&mut self, fd: RawFd) {
        if self.0 == fd {
            return;
        }
        self.close_if_valid();
        self.0 = fd;
    }

    /// Surrender ownership without closing.
    pub fn release(&mut self) -> RawFd {
        let fd = self.0;
        self.0 = -1;
        fd
    }

    /// Duplicate the descriptor with `dup`, yielding an independent handle.
    pub fn try_clone(&self) -> nix::Result<Fd> {
        unistd::dup(self.0).map(Fd)
    }

    fn close_if_valid(&mut self) {
        if self.0 >= 0 {
            unistd::close(self.0).ok();
            self.0 = -1;
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        self.close_if_valid();
    }
}

/// Put a descriptor into non-blocking mode, preserving its other flags.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

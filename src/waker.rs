use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Cross-thread wakeup backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are added (native endian) to the count; reads must also be
/// 8 bytes and reset the count to 0. The loop registers the fd as a read
/// channel; [`wake`] makes the ongoing `epoll_wait` return promptly.
///
/// [`wake`]: Waker::wake
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow.
                // Reset the counter and wake again.
                self.drain();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Reset the counter to 0. The wakeup channel's read callback must call
    /// this, or the level-triggered fd keeps the loop spinning.
    #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(_) => {}
            // Not woken yet; nothing to drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::error!("failed to drain wakeup eventfd: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

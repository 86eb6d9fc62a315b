use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Size of the cheap-prepend region reserved at the front of every buffer.
pub const CHEAP_PREPEND: usize = 8;

/// Initial capacity of the readable + writable region.
pub const INITIAL_SIZE: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// Growable byte buffer used for connection input and output.
///
/// The underlying storage is one contiguous region with three cursors:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// 0      <=      read_index   <=   write_index    <=     size
/// ```
///
/// The prepend region lets a codec cheaply put a length header in front of
/// content that is already in place, without shifting it. Retrieving all
/// content resets both cursors back to [`CHEAP_PREPEND`].
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `capacity` writable bytes (plus the prepend
    /// region).
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + capacity],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// The readable content, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
        self.check_invariants();
    }

    /// Consumes everything and resets the cursors to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes and returns `len` readable bytes.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    /// Consumes and returns the whole readable content.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Offset of the first CRLF within the readable content.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(CRLF.len()).position(|w| w == CRLF)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
        self.check_invariants();
    }

    /// Appends a `u32` in network byte order.
    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Writes `data` immediately in front of the readable content.
    ///
    /// Requires `data.len() <= prependable_bytes()`; the prepend region is
    /// sized for fixed-width length headers.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        let start = self.read_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.check_invariants();
    }

    /// Prepends a `u32` in network byte order.
    pub fn prepend_u32(&mut self, value: u32) {
        self.prepend(&value.to_be_bytes());
    }

    /// Reads a `u32` in network byte order without consuming it.
    ///
    /// Panics if fewer than four bytes are readable.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut be = [0u8; 4];
        be.copy_from_slice(&self.peek()[..4]);
        u32::from_be_bytes(be)
    }

    /// Consumes and returns a `u32` in network byte order.
    pub fn read_u32(&mut self) -> u32 {
        let value = self.peek_u32();
        self.retrieve(4);
        value
    }

    /// Makes room for at least `len` more writable bytes, compacting the
    /// already-read prefix before growing.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            // Move readable data to the front, keeping the prepend region.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
        self.check_invariants();
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Reads from `fd` directly into the writable tail, spilling into a
    /// stack scratch buffer so one `readv(2)` can absorb up to ~64 KiB even
    /// when the buffer is nearly empty. Saves the `ioctl(FIONREAD)`-then-read
    /// round trip.
    ///
    /// Returns `Ok(0)` at end of stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.buf[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // When there is enough space in the buffer, don't read into the
        // scratch at all.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        self.check_invariants();
        Ok(n)
    }

    #[inline]
    fn check_invariants(&self) {
        debug_assert!(CHEAP_PREPEND <= self.read_index);
        debug_assert!(self.read_index <= self.write_index);
        debug_assert!(self.write_index <= self.buf.len());
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        let head = buf.retrieve_as_vec(50);
        assert_eq!(head.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.retrieve(buf.readable_bytes());
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);
        assert!(buf.peek()[..400].iter().all(|&b| b == b'y'));
        assert!(buf.peek()[400..].iter().all(|&b| b == b'z'));
    }

    #[test]
    fn compacts_inside_capacity() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);
        // 100 readable; room for 900 more without reallocating.
        buf.append(&vec![b'b'; 900]);
        assert_eq!(buf.readable_bytes(), 1000);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.prepend_u32(5);
        assert_eq!(buf.readable_bytes(), 9);
        assert_eq!(buf.peek_u32(), 5);
        assert_eq!(buf.read_u32(), 5);
        assert_eq!(buf.peek(), b"hello");
    }

    #[test]
    fn u32_round_trip() {
        let mut buf = Buffer::new();
        buf.append_u32(0x0102_0304);
        assert_eq!(buf.peek(), &[1, 2, 3, 4]);
        assert_eq!(buf.read_u32(), 0x0102_0304);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"sub weather\r\nrest");
        let pos = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..pos], b"sub weather");
        buf.retrieve(pos + 2);
        assert_eq!(buf.peek(), b"rest");
        assert_eq!(buf.find_crlf(), None);
    }

    #[test]
    fn read_fd_spills_into_scratch() {
        use std::fs::File;
        use std::io::Write;
        use std::os::fd::{AsRawFd, FromRawFd};

        let mut fds = [0; 2];
        let res =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(res, 0);
        // SAFETY: `socketpair(2)` returned two valid fds.
        let rx = unsafe { File::from_raw_fd(fds[0]) };
        let mut tx = unsafe { File::from_raw_fd(fds[1]) };

        let payload = vec![b'q'; 2000];
        tx.write_all(&payload).unwrap();
        drop(tx);

        let mut buf = Buffer::with_capacity(16);
        let mut total = 0;
        while total < payload.len() {
            total += buf.read_fd(rx.as_raw_fd()).unwrap();
        }
        assert_eq!(buf.readable_bytes(), payload.len());
        assert!(buf.peek().iter().all(|&b| b == b'q'));
        assert_eq!(buf.read_fd(rx.as_raw_fd()).unwrap(), 0); // peer closed
    }
}

//! Thin `io::Result` wrappers around the socket syscalls the crate uses.
//!
//! Every fd produced here is non-blocking and close-on-exec from birth
//! (`SOCK_NONBLOCK | SOCK_CLOEXEC`, `accept4(2)`), so there is no window in
//! which a blocking descriptor can leak into the reactor.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Converts a `SocketAddr` into its C representation for syscalls.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the
/// kernel.
fn to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: AF_INET means the storage was written as sockaddr_in.
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: AF_INET6 means the storage was written as sockaddr_in6.
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// A new non-blocking, close-on-exec TCP socket of `addr`'s family.
pub(crate) fn new_nonblocking_stream(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    ))?;
    // SAFETY: `socket(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr(addr);
    syscall!(bind(fd, raw.as_ptr(), len)).map(|_| ())
}

pub(crate) fn listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, libc::SOMAXCONN)).map(|_| ())
}

/// Accepts one pending connection; the returned fd is non-blocking and
/// close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn = syscall!(accept4(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    // SAFETY: `accept4(2)` ensures the fd is valid.
    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
    // SAFETY: the kernel initialised `len` bytes of the storage.
    let storage = unsafe { storage.assume_init() };
    Ok((conn, to_socket_addr(&storage)?))
}

/// Starts a non-blocking connect. An in-progress connect surfaces as
/// `Err(EINPROGRESS)`; the caller classifies the errno.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr(addr);
    syscall!(connect(fd, raw.as_ptr(), len)).map(|_| ())
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

/// Reads and clears `SO_ERROR`.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    match syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    )) {
        Ok(_) => err,
        Err(e) => e.raw_os_error().unwrap_or(0),
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    // SAFETY: the kernel initialised `len` bytes of the storage.
    to_socket_addr(unsafe { &storage.assume_init() })
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    // SAFETY: the kernel initialised `len` bytes of the storage.
    to_socket_addr(unsafe { &storage.assume_init() })
}

/// Connecting to a local ephemeral port can have the kernel pick the very
/// same port as the source, yielding a socket connected to itself.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &val as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub(crate) fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn socket_addr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        let (raw, len) = socket_addr(&addr);
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        // SAFETY: `len` bytes of the C representation fit in the storage.
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                len as usize,
            );
        }
        assert_eq!(to_socket_addr(&storage).unwrap(), addr);
    }

    #[test]
    fn bind_and_introspect() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = new_nonblocking_stream(&addr).unwrap();
        set_reuse_addr(socket.as_raw_fd(), true).unwrap();
        bind(socket.as_raw_fd(), &addr).unwrap();
        listen(socket.as_raw_fd()).unwrap();

        let bound = local_addr(socket.as_raw_fd()).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
        assert_eq!(socket_error(socket.as_raw_fd()), 0);
    }
}

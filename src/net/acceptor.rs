use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::channel::ChannelState;
use crate::net::sock;
use crate::{Channel, EventLoop};

pub(crate) type NewConnectionCallback = Box<dyn FnMut(OwnedFd, SocketAddr) + Send>;

/// The listening socket and its read channel.
///
/// Lives on the server's base loop. Each readiness of the listen socket
/// accepts one connection and hands `(fd, peer address)` to the
/// new-connection callback; if no callback is installed the fd is closed
/// on the spot.
///
/// A placeholder fd (`/dev/null`) is held open from construction. When
/// `accept` fails with `EMFILE` the placeholder is closed, the pending
/// connection accepted and immediately closed, and the placeholder
/// reopened; otherwise the level-triggered listen socket would keep the
/// loop spinning on a connection that can never be accepted.
pub struct Acceptor {
    event_loop: EventLoop,
    socket: OwnedFd,
    channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    idle_fd: Mutex<Option<OwnedFd>>,
}

impl Acceptor {
    /// Creates the listening socket, binds it to `listen_addr`, and
    /// prepares (but does not enable) its channel.
    ///
    /// `SO_REUSEADDR` is always set; `SO_REUSEPORT` only on request.
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = sock::new_nonblocking_stream(&listen_addr)?;
        sock::set_reuse_addr(socket.as_raw_fd(), true)?;
        if reuse_port {
            sock::set_reuse_port(socket.as_raw_fd(), true)?;
        }
        sock::bind(socket.as_raw_fd(), &listen_addr)?;
        let idle_fd = open_idle_fd()?;

        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            socket,
            channel,
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: FnMut(OwnedFd, SocketAddr) + Send + 'static,
    {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Puts the socket in listen state and arms the read channel.
    pub fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        sock::listen(self.socket.as_raw_fd())?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_read();
        Ok(())
    }

    /// The bound address; resolves the actual port when bound to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sock::local_addr(self.socket.as_raw_fd())
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match sock::accept(self.socket.as_raw_fd()) {
            Ok((socket, peer_addr)) => {
                let mut cb = self.new_connection_cb.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(socket, peer_addr),
                    // No callback installed: the connection is ours to
                    // close.
                    None => drop(socket),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("Acceptor::handle_read: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    self.drain_under_fd_pressure();
                }
            }
        }
    }

    // See "The special problem of accept()ing when you can't" in libev's
    // documentation: under EMFILE the pending connection stays in the
    // backlog and the level-triggered listen fd stays hot forever. Burning
    // the placeholder frees one fd to accept and discard it.
    fn drain_under_fd_pressure(&self) {
        let mut idle_fd = self.idle_fd.lock().unwrap();
        drop(idle_fd.take());
        match sock::accept(self.socket.as_raw_fd()) {
            Ok((socket, _)) => drop(socket),
            Err(err) => warn!("accept under fd pressure: {}", err),
        }
        match open_idle_fd() {
            Ok(fd) => *idle_fd = Some(fd),
            Err(err) => error!("failed to reopen placeholder fd: {}", err),
        }
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Acceptor")
            .field("fd", &self.socket.as_raw_fd())
            .field("listening", &self.listening())
            .finish()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // The cleanup may run after the listen socket has closed (deferred
        // to the loop thread), so only undo what was actually flushed to
        // the multiplexer.
        let channel = self.channel.clone();
        self.event_loop.run_in_loop(move || match channel.state() {
            ChannelState::Added => {
                channel.disable_all();
                channel.remove();
            }
            ChannelState::Detached => channel.remove(),
            ChannelState::New => {}
        });
    }
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    // SAFETY: `open(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

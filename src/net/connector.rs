use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::net::sock;
use crate::{Channel, EventLoop};

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub(crate) type NewConnectionCallback = Box<dyn FnMut(OwnedFd) + Send>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Non-blocking outbound connect with exponential-backoff retry.
///
/// Drives `disconnected → connecting → connected` on its loop. A
/// connecting socket reports completion as writability; `SO_ERROR` then
/// decides between success, retry, and the self-connection case (which is
/// also retried). Retryable errnos re-connect on a fresh socket after a
/// delay that doubles from 500ms up to 30s.
///
/// On success the socket's ownership passes whole to the new-connection
/// callback; the connector's channel is released and its role ends.
pub struct Connector {
    event_loop: EventLoop,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: Mutex<State>,
    retry_delay: Mutex<Duration>,
    channel: Mutex<Option<Arc<Channel>>>,
    // The in-flight socket while a connect is pending; the channel itself
    // never owns the fd.
    pending: Mutex<Option<OwnedFd>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    self_weak: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: &EventLoop, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_weak| Connector {
            event_loop: event_loop.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: Mutex::new(State::Disconnected),
            retry_delay: Mutex::new(INIT_RETRY_DELAY),
            channel: Mutex::new(None),
            pending: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: FnMut(OwnedFd) + Send + 'static,
    {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Starts connecting. Callable from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let connector = self.as_arc();
        self.event_loop.run_in_loop(move || connector.start_in_loop());
    }

    /// Cancels a pending connect. The loop-side unwinding is deferred.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let connector = self.as_arc();
        self.event_loop.queue_in_loop(move || connector.stop_in_loop());
    }

    /// Back to square one: reset the backoff and connect again. Must be
    /// called on the loop thread.
    pub fn restart(&self) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        *self.retry_delay.lock().unwrap() = INIT_RETRY_DELAY;
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn as_arc(&self) -> Arc<Connector> {
        self.self_weak
            .upgrade()
            .expect("connector used after its last strong reference was dropped")
    }

    fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.do_connect();
        } else {
            debug!("Connector::start_in_loop - do not connect");
        }
    }

    fn stop_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            let socket = self.remove_and_reset_channel();
            self.retry(socket);
        }
    }

    fn do_connect(&self) {
        let socket = match sock::new_nonblocking_stream(&self.server_addr) {
            Ok(socket) => socket,
            Err(err) => {
                error!("Connector::do_connect - socket: {}", err);
                return;
            }
        };
        let errno = match sock::connect(socket.as_raw_fd(), &self.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(0),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(Some(socket)),

            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!(
                    "Connector::do_connect - connect to {}: {}",
                    self.server_addr,
                    io::Error::from_raw_os_error(errno)
                );
            }

            _ => {
                error!(
                    "Connector::do_connect - unexpected error connecting to {}: {}",
                    self.server_addr,
                    io::Error::from_raw_os_error(errno)
                );
            }
        }
    }

    // Connect is in flight; completion shows up as writability.
    fn connecting(&self, socket: OwnedFd) {
        self.set_state(State::Connecting);
        let channel = Channel::new(&self.event_loop, socket.as_raw_fd());

        let weak = self.self_weak.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.self_weak.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });

        debug_assert!(self.pending.lock().unwrap().is_none());
        *self.pending.lock().unwrap() = Some(socket);
        *self.channel.lock().unwrap() = Some(channel.clone());
        channel.enable_write();
    }

    // The connector's channel only covers the connecting phase; once the
    // socket is writable it is detached and the fd moves on.
    fn remove_and_reset_channel(&self) -> Option<OwnedFd> {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.disable_all();
            channel.remove();
            // Can't drop the channel inside its own handler; defer.
            self.event_loop.queue_in_loop(move || drop(channel));
        }
        self.pending.lock().unwrap().take()
    }

    fn handle_write(&self) {
        trace!("Connector::handle_write {:?}", self.state());
        if self.state() != State::Connecting {
            debug_assert_eq!(self.state(), State::Disconnected);
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };
        // Writability does not mean success; SO_ERROR has the verdict.
        let err = sock::socket_error(socket.as_raw_fd());
        if err != 0 {
            warn!(
                "Connector::handle_write - SO_ERROR = {} {}",
                err,
                io::Error::from_raw_os_error(err)
            );
            self.retry(Some(socket));
        } else if sock::is_self_connect(socket.as_raw_fd()) {
            warn!("Connector::handle_write - self connect");
            self.retry(Some(socket));
        } else {
            self.set_state(State::Connected);
            if self.connect.load(Ordering::Acquire) {
                let mut slot = self.new_connection_cb.lock().unwrap();
                match slot.as_mut() {
                    Some(cb) => cb(socket),
                    None => drop(socket),
                }
            }
            // stop() raced the completion: the socket just closes.
        }
    }

    fn handle_error(&self) {
        error!("Connector::handle_error state={:?}", self.state());
        if self.state() == State::Connecting {
            let Some(socket) = self.remove_and_reset_channel() else {
                return;
            };
            let err = sock::socket_error(socket.as_raw_fd());
            trace!("SO_ERROR = {} {}", err, io::Error::from_raw_os_error(err));
            self.retry(Some(socket));
        }
    }

    // Closes the failed socket and schedules a fresh attempt.
    fn retry(&self, socket: Option<OwnedFd>) {
        drop(socket);
        self.set_state(State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = {
                let mut retry_delay = self.retry_delay.lock().unwrap();
                let delay = *retry_delay;
                *retry_delay = (delay * 2).min(MAX_RETRY_DELAY);
                delay
            };
            info!(
                "Connector::retry - retry connecting to {} in {:?}",
                self.server_addr, delay
            );
            let weak = self.self_weak.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            });
        } else {
            debug!("Connector::retry - do not connect");
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Connector")
            .field("server_addr", &self.server_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        debug_assert!(self.channel.lock().unwrap().is_none());
    }
}

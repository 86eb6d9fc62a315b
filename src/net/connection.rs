use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::net::sock;
use crate::{Buffer, Channel, EventLoop};

/// Default high-water mark: 64 MiB of pending output.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Shared handle to a connection; the server's table and in-flight
/// callbacks each hold one, and the connection lives as long as the
/// longest holder.
pub type TcpConnectionPtr<C = ()> = Arc<TcpConnection<C>>;

/// Fired on the loop thread when a connection goes up or down; inspect
/// [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback<C> = Arc<dyn Fn(&TcpConnectionPtr<C>) + Send + Sync>;

/// Fired on the loop thread when input arrives. The callback must consume
/// some or all readable bytes, or the same data is redelivered.
pub type MessageCallback<C> =
    Arc<dyn Fn(&TcpConnectionPtr<C>, &mut Buffer, Instant) + Send + Sync>;

/// Fired when the output buffer transitions to empty after a send.
pub type WriteCompleteCallback<C> = Arc<dyn Fn(&TcpConnectionPtr<C>) + Send + Sync>;

/// Fired when a single send pushes the pending output from below the
/// threshold to at-or-above it.
pub type HighWaterMarkCallback<C> = Arc<dyn Fn(&TcpConnectionPtr<C>, usize) + Send + Sync>;

pub(crate) type CloseCallback<C> = Arc<dyn Fn(&TcpConnectionPtr<C>) + Send + Sync>;

/// Lifecycle of a connection. Transitions only move forward:
/// `Connecting → Connected → Disconnecting → Disconnected`, with the
/// single shortcut `Connecting → Disconnected` on early failure.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnectionState {
    /// Freshly constructed; the loop has not armed the channel yet.
    Connecting = 0,
    /// Normal operation.
    Connected = 1,
    /// This side initiated a half-close that waits for output to drain.
    Disconnecting = 2,
    /// Terminal.
    Disconnected = 3,
}

fn state_from_u8(value: u8) -> ConnectionState {
    match value {
        0 => ConnectionState::Connecting,
        1 => ConnectionState::Connected,
        2 => ConnectionState::Disconnecting,
        _ => ConnectionState::Disconnected,
    }
}

/// Logs the transition; the stand-in until the user installs a connection
/// callback.
pub fn default_connection_callback<C: Send + 'static>(conn: &TcpConnectionPtr<C>) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
    // No force_close here: some users only care about messages.
}

/// Discards input; the stand-in until the user installs a message
/// callback. Without it a level-triggered loop would redeliver forever.
pub fn default_message_callback<C: Send + 'static>(
    _conn: &TcpConnectionPtr<C>,
    buf: &mut Buffer,
    _receive_time: Instant,
) {
    buf.retrieve_all();
}

/// One established TCP connection: socket, channel, buffers and the user
/// callbacks, pinned to one loop.
///
/// All state-mutating operations are safe to call from any thread; they
/// hop onto the owning loop internally. The message, write-complete and
/// connection callbacks of one connection are serialized on that loop and
/// never run concurrently with each other.
///
/// `C` is a user-chosen per-connection context, stored typed instead of as
/// a runtime any-box; protocol layers keep parser state or subscription
/// sets there via [`with_context`].
///
/// [`with_context`]: TcpConnection::with_context
pub struct TcpConnection<C: Send + 'static = ()> {
    event_loop: EventLoop,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    // Owns the fd: closed when the last holder lets go.
    socket: OwnedFd,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback<C>>>,
    message_cb: Mutex<Option<MessageCallback<C>>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback<C>>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback<C>>>,
    close_cb: Mutex<Option<CloseCallback<C>>>,
    context: Mutex<Option<C>>,
    self_weak: Weak<TcpConnection<C>>,
}

impl<C: Send + 'static> TcpConnection<C> {
    pub(crate) fn new(
        event_loop: EventLoop,
        name: String,
        socket: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr<C> {
        let fd = socket.as_raw_fd();
        let conn = Arc::new_cyclic(|self_weak: &Weak<TcpConnection<C>>| TcpConnection {
            channel: Channel::new(&event_loop, fd),
            event_loop,
            name,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            context: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        let weak = conn.self_weak.clone();
        conn.channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let weak = conn.self_weak.clone();
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = conn.self_weak.clone();
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = conn.self_weak.clone();
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        if let Err(err) = sock::set_keep_alive(fd, true) {
            warn!("SO_KEEPALIVE on [{}]: {}", conn.name, err);
        }
        debug!("TcpConnection::new [{}] fd={}", conn.name, fd);
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn as_ptr(&self) -> TcpConnectionPtr<C> {
        self.self_weak
            .upgrade()
            .expect("connection used after its last strong reference was dropped")
    }

    /// Stores a per-connection context, replacing any previous one.
    pub fn set_context(&self, context: C) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn take_context(&self) -> Option<C> {
        self.context.lock().unwrap().take()
    }

    /// Runs `f` with exclusive access to the context slot.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<C>) -> R) -> R {
        f(&mut self.context.lock().unwrap())
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr<C>) + Send + Sync + 'static,
    {
        self.set_connection_callback_arc(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr<C>, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        self.set_message_callback_arc(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr<C>) + Send + Sync + 'static,
    {
        self.set_write_complete_callback_arc(Arc::new(cb));
    }

    /// Installs the high-water callback and its threshold in bytes.
    pub fn set_high_water_mark_callback<F>(&self, cb: F, threshold: usize)
    where
        F: Fn(&TcpConnectionPtr<C>, usize) + Send + Sync + 'static,
    {
        self.high_water_mark.store(threshold, Ordering::Relaxed);
        *self.high_water_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub(crate) fn set_connection_callback_arc(&self, cb: ConnectionCallback<C>) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_message_callback_arc(&self, cb: MessageCallback<C>) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_write_complete_callback_arc(&self, cb: WriteCompleteCallback<C>) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback_arc(&self, cb: CloseCallback<C>) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Sends `data`, buffering whatever the socket does not take at once.
    ///
    /// On a `Disconnected` connection the data is silently dropped (with a
    /// warning). Callable from any thread.
    pub fn send(&self, data: &[u8]) {
        if self.state() == ConnectionState::Connected {
            if self.event_loop.is_in_loop_thread() {
                self.send_in_loop(data);
            } else {
                let conn = self.as_ptr();
                let data = data.to_vec();
                self.event_loop
                    .queue_in_loop(move || conn.send_in_loop(&data));
            }
        } else {
            warn!(
                "[{}] send on a {:?} connection, {} bytes dropped",
                self.name,
                self.state(),
                data.len()
            );
        }
    }

    /// Sends and drains the whole readable content of `buf`.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        let data = buf.retrieve_all_as_vec();
        self.send(&data);
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            warn!("[{}] disconnected, give up writing", self.name);
            return;
        }

        let mut wrote = 0;
        let mut fault = false;
        // Nothing queued and write interest off: try the socket directly.
        if !self.channel.is_writing() && self.output.lock().unwrap().readable_bytes() == 0 {
            match sock::write(self.socket.as_raw_fd(), data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            let conn = self.as_ptr();
                            // Through the task queue even though the write
                            // completed synchronously, so ordering against
                            // other user callbacks stays predictable.
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if let Some(errno) = err.raw_os_error() {
                            if errno == libc::EPIPE || errno == libc::ECONNRESET {
                                fault = true;
                            }
                        }
                    }
                }
            }
        }

        debug_assert!(wrote <= data.len());
        let remaining = data.len() - wrote;
        if !fault && remaining > 0 {
            let mut output = self.output.lock().unwrap();
            let old_len = output.readable_bytes();
            let threshold = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= threshold && old_len < threshold {
                if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
                    let conn = self.as_ptr();
                    let size = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, size));
                }
            }
            output.append(&data[wrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_write();
            }
        }
    }

    /// Closes the write half once pending output has drained.
    ///
    /// A no-op unless the connection is `Connected`.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.as_ptr();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // Still writing: handle_write issues the shutdown once the output
        // buffer empties.
        if !self.channel.is_writing() {
            if let Err(err) = sock::shutdown_write(self.socket.as_raw_fd()) {
                error!("shutdown [{}]: {}", self.name, err);
            }
        }
    }

    /// Closes now, regardless of pending output.
    pub fn force_close(&self) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnecting);
            let conn = self.as_ptr();
            self.event_loop
                .queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Closes after `delay`; a no-op if the connection reaches
    /// `Disconnected` (or is destroyed) before the delay elapses.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnecting);
            let weak = self.self_weak.clone();
            // Re-checks state at fire time via force_close, not
            // force_close_in_loop.
            self.event_loop.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            // As if we had read 0 bytes.
            self.handle_close();
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = sock::set_tcp_nodelay(self.socket.as_raw_fd(), on) {
            warn!("TCP_NODELAY on [{}]: {}", self.name, err);
        }
    }

    /// Resumes delivering message callbacks. Callable from any thread.
    pub fn start_read(&self) {
        let conn = self.as_ptr();
        self.event_loop.run_in_loop(move || conn.start_read_in_loop());
    }

    fn start_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.reading.load(Ordering::Relaxed) || !self.channel.is_reading() {
            self.channel.enable_read();
            self.reading.store(true, Ordering::Relaxed);
        }
    }

    /// Stops reading from the socket; the kernel buffer then backpressures
    /// the peer. Callable from any thread.
    pub fn stop_read(&self) {
        let conn = self.as_ptr();
        self.event_loop.run_in_loop(move || conn.stop_read_in_loop());
    }

    fn stop_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.reading.load(Ordering::Relaxed) || self.channel.is_reading() {
            self.channel.disable_read();
            self.reading.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    /// Called once by the owning server/client, on the loop thread, to arm
    /// the channel and announce the connection.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        let conn = self.as_ptr();
        self.channel.tie(&conn);
        self.channel.enable_read();

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(&conn);
        }
    }

    /// The last step of teardown: detaches the channel from the loop. Runs
    /// on the loop thread after the owner dropped its reference.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();

            let conn = self.as_ptr();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(&conn);
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();
        let result = {
            let mut input = self.input.lock().unwrap();
            input.read_fd(self.socket.as_raw_fd())
        };
        match result {
            // Peer closed its write half.
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(cb) = self.message_cb.lock().unwrap().clone() {
                    let conn = self.as_ptr();
                    let mut input = self.input.lock().unwrap();
                    cb(&conn, &mut input, receive_time);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("fd {} is down, no more writing", self.channel.fd());
            return;
        }
        let mut output = self.output.lock().unwrap();
        match sock::write(self.socket.as_raw_fd(), output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    // Or the loop would spin on writability.
                    self.channel.disable_write();
                    drop(output);
                    if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                        let conn = self.as_ptr();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("TcpConnection::handle_write [{}]: {}", self.name, err);
            }
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        trace!("fd {} state {:?}", self.channel.fd(), self.state());
        // A hangup and a readable EOF can land in the same dispatch; the
        // down callback is delivered exactly once.
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        // The fd itself stays open until the connection drops; RAII finds
        // leaks for us.
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        let conn = self.as_ptr();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(&conn);
        }
        // Must be last: routes to the owner's remove path, which may drop
        // the final reference.
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(&conn);
        }
    }

    fn handle_error(&self) {
        let err = sock::socket_error(self.socket.as_raw_fd());
        error!(
            "TcpConnection::handle_error [{}] - SO_ERROR = {} {}",
            self.name,
            err,
            io::Error::from_raw_os_error(err)
        );
    }

    /// Bytes currently queued in the output buffer.
    pub fn output_bytes(&self) -> usize {
        self.output.lock().unwrap().readable_bytes()
    }
}

impl<C: Send + 'static> fmt::Debug for TcpConnection<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.socket.as_raw_fd())
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Send + 'static> Drop for TcpConnection<C> {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
    }
}

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{error, info};

use crate::net::connection::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::net::sock;
use crate::net::Connector;
use crate::{Buffer, EventLoop};

/// An outbound TCP client: one [`Connector`] and, once connected, one
/// connection on the client's loop.
///
/// [`connect`] keeps retrying with the connector's backoff until the
/// server answers. With [`enable_retry`], a connection that later drops is
/// re-established the same way.
///
/// [`connect`]: TcpClient::connect
/// [`enable_retry`]: TcpClient::enable_retry
pub struct TcpClient<C: Send + 'static = ()> {
    event_loop: EventLoop,
    connector: Arc<Connector>,
    name: String,
    connection_cb: Mutex<ConnectionCallback<C>>,
    message_cb: Mutex<MessageCallback<C>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback<C>>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr<C>>>,
    self_weak: Weak<TcpClient<C>>,
}

impl<C: Send + 'static> TcpClient<C> {
    pub fn new(
        event_loop: &EventLoop,
        server_addr: SocketAddr,
        name: impl Into<String>,
    ) -> Arc<TcpClient<C>> {
        let client = Arc::new_cyclic(|self_weak: &Weak<TcpClient<C>>| TcpClient {
            event_loop: event_loop.clone(),
            connector: Connector::new(event_loop, server_addr),
            name: name.into(),
            connection_cb: Mutex::new(Arc::new(default_connection_callback::<C>)),
            message_cb: Mutex::new(Arc::new(default_message_callback::<C>)),
            write_complete_cb: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        let weak = client.self_weak.clone();
        client.connector.set_new_connection_callback(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        });
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// The established connection, if any.
    pub fn connection(&self) -> Option<TcpConnectionPtr<C>> {
        self.connection.lock().unwrap().clone()
    }

    /// Reconnect after an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Starts connecting (and keeps retrying with backoff until the server
    /// answers). Callable from any thread.
    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Gracefully shuts down the established connection.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection.lock().unwrap().as_ref() {
            conn.shutdown();
        }
    }

    /// Cancels an in-progress connect.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr<C>) + Send + Sync + 'static,
    {
        *self.connection_cb.lock().unwrap() = Arc::new(cb);
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr<C>, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        *self.message_cb.lock().unwrap() = Arc::new(cb);
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr<C>) + Send + Sync + 'static,
    {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    // The connector completed; runs on the loop thread.
    fn new_connection(&self, socket: OwnedFd) {
        self.event_loop.assert_in_loop_thread();
        let peer_addr = match sock::peer_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("getpeername [{}]: {}", self.name, err);
                return;
            }
        };
        let local_addr = match sock::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname [{}]: {}", self.name, err);
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(
            self.event_loop.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback_arc(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback_arc(self.message_cb.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback_arc(cb);
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback_arc(Arc::new(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr<C>) {
        self.event_loop.assert_in_loop_thread();
        debug_assert!(conn.owner_loop().same_loop(&self.event_loop));
        *self.connection.lock().unwrap() = None;

        let destroyed = conn.clone();
        self.event_loop
            .queue_in_loop(move || destroyed.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl<C: Send + 'static> fmt::Debug for TcpClient<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpClient")
            .field("name", &self.name)
            .field("server_addr", &self.connector.server_addr())
            .finish()
    }
}

impl<C: Send + 'static> Drop for TcpClient<C> {
    fn drop(&mut self) {
        info!("TcpClient::drop [{}]", self.name);
        let conn = self.connection.lock().unwrap().take();
        if let Some(conn) = conn {
            // The client is going away but the connection may outlive it
            // in callbacks; reroute its close path to plain destruction.
            let event_loop = self.event_loop.clone();
            let cb: CloseCallback<C> = {
                let event_loop = event_loop.clone();
                Arc::new(move |conn: &TcpConnectionPtr<C>| {
                    let conn = conn.clone();
                    event_loop.queue_in_loop(move || conn.connect_destroyed());
                })
            };
            let unique = Arc::strong_count(&conn) == 1;
            let detached = conn.clone();
            event_loop.run_in_loop(move || detached.set_close_callback_arc(cb));
            if unique {
                conn.force_close();
            }
        } else {
            self.connector.stop();
        }
    }
}

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{error, info};

use crate::net::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::net::sock;
use crate::net::Acceptor;
use crate::pool::{LoopPool, ThreadInitCallback};
use crate::{Buffer, EventLoop};

/// A multi-loop TCP server.
///
/// The base loop (the one passed to [`new`]) runs the accept path; a pool
/// of worker loops owns the established connections, assigned round-robin
/// and pinned to their loop for life. With [`set_thread_num`] left at zero
/// every connection shares the base loop.
///
/// User callbacks set here are propagated into each new connection.
///
/// [`new`]: TcpServer::new
/// [`set_thread_num`]: TcpServer::set_thread_num
pub struct TcpServer<C: Send + 'static = ()> {
    event_loop: EventLoop,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<LoopPool>,
    connection_cb: Mutex<ConnectionCallback<C>>,
    message_cb: Mutex<MessageCallback<C>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback<C>>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    // Touched only from the base loop.
    connections: Mutex<HashMap<String, TcpConnectionPtr<C>>>,
    self_weak: Weak<TcpServer<C>>,
}

impl<C: Send + 'static> TcpServer<C> {
    /// Binds `listen_addr` (port 0 picks a free port) and wires the accept
    /// path. Listening starts with [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer<C>>> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr()?.to_string();
        let pool = Arc::new(LoopPool::new(event_loop.clone(), name.clone()));

        let server = Arc::new_cyclic(|self_weak: &Weak<TcpServer<C>>| TcpServer {
            event_loop: event_loop.clone(),
            ip_port,
            name,
            acceptor,
            pool,
            connection_cb: Mutex::new(Arc::new(default_connection_callback::<C>)),
            message_cb: Mutex::new(Arc::new(default_message_callback::<C>)),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            self_weak: self_weak.clone(),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            });
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listen address as `"ip:port"`.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of worker loops; zero keeps everything on the base loop.
    /// Must be called before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    /// Runs once on each worker loop before it starts dispatching.
    pub fn set_thread_init_callback<F>(&self, cb: F)
    where
        F: Fn(&EventLoop) + Send + Sync + 'static,
    {
        *self.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
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

    /// Brings the worker pool up and starts listening. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let init = self.thread_init_cb.lock().unwrap().clone();
            self.pool.start(init)?;

            debug_assert!(!self.acceptor.listening());
            let acceptor = self.acceptor.clone();
            self.event_loop.run_in_loop(move || {
                if let Err(err) = acceptor.listen() {
                    // A server that cannot listen has nothing left to do.
                    panic!("TcpServer failed to listen: {}", err);
                }
            });
        }
        Ok(())
    }

    fn as_ptr(&self) -> Arc<TcpServer<C>> {
        self.self_weak
            .upgrade()
            .expect("server used after its last strong reference was dropped")
    }

    fn new_connection(&self, socket: OwnedFd, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match sock::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname for [{}]: {}", conn_name, err);
                return;
            }
        };
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        conn.set_connection_callback_arc(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback_arc(self.message_cb.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback_arc(cb);
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback_arc(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let established = conn;
        io_loop.run_in_loop(move || established.connect_established());
    }

    // Close fires on the connection's worker loop; hop to the base loop to
    // touch the table, then back to the worker to finalize the channel.
    fn remove_connection(&self, conn: &TcpConnectionPtr<C>) {
        let server = self.as_ptr();
        let conn = conn.clone();
        self.event_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr<C>) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.lock().unwrap().remove(conn.name());
        debug_assert!(removed.is_some());

        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }

    /// Connections currently in the table.
    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl<C: Send + 'static> fmt::Debug for TcpServer<C> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("ip_port", &self.ip_port)
            .field("started", &self.started.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: Send + 'static> Drop for TcpServer<C> {
    fn drop(&mut self) {
        // Take the table first: destruction may run inline on the base
        // loop and fire user callbacks.
        let connections: Vec<TcpConnectionPtr<C>> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

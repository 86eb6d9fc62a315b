// Not all functions are used by all tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Once};
use std::time::Duration;

use evio::net::TcpServer;
use evio::{EventLoop, LoopThread};

/// Generous bound for cross-thread assertions; tests should finish far
/// below it.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// A loop running on its own thread, plus nothing else.
pub fn init_with_loop() -> LoopThread {
    init();
    LoopThread::start("test-loop".to_owned(), None).expect("unable to start loop thread")
}

pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn recv_within<T>(rx: &Receiver<T>, what: &str) -> T {
    rx.recv_timeout(TIMEOUT)
        .unwrap_or_else(|err| panic!("timed out waiting for {}: {}", what, err))
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// Asserts the loop handle is usable cross-thread.
pub fn assert_loop_handle_traits() {
    assert_send::<EventLoop>();
    assert_sync::<EventLoop>();
}

/// Builds and starts an echo server on `lt`'s loop (server setup must run
/// on its base loop thread), bound to `addr`. Returns the resolved address
/// and the server handle keeping it alive.
pub fn start_echo_server_at(lt: &LoopThread, addr: SocketAddr) -> (SocketAddr, Arc<TcpServer<()>>) {
    let (tx, rx) = mpsc::channel();
    let loop_handle = lt.event_loop().clone();
    let inner = loop_handle.clone();
    loop_handle.run_in_loop(move || {
        let server = TcpServer::<()>::new(&inner, addr, "echo", false).unwrap();
        server.set_message_callback(|conn, buf, _receive_time| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        });
        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        tx.send((addr, server)).unwrap();
    });
    recv_within(&rx, "echo server startup")
}

pub fn start_echo_server(lt: &LoopThread) -> (SocketAddr, Arc<TcpServer<()>>) {
    start_echo_server_at(lt, any_local_address())
}

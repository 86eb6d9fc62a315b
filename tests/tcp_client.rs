use std::net::TcpListener;
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use evio::net::TcpClient;

mod util;

use util::{any_local_address, init, init_with_loop, recv_within, start_echo_server};

#[test]
fn client_connects_sends_and_receives() {
    init();
    let server_lt = init_with_loop();
    let (addr, _server) = start_echo_server(&server_lt);

    let client_lt = init_with_loop();
    let client = TcpClient::<()>::new(client_lt.event_loop(), addr, "ping-client");

    client.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"ping");
        }
    });
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client.set_message_callback(move |conn, buf, _receive_time| {
        if buf.readable_bytes() >= 4 {
            let data = buf.retrieve_all_as_vec();
            tx.lock().unwrap().send(data).unwrap();
            conn.shutdown();
        }
    });
    client.connect();

    let echoed = recv_within(&rx, "echoed ping");
    assert_eq!(echoed, b"ping");

    client.disconnect();
}

#[test]
fn client_observes_up_and_down() {
    init();
    let server_lt = init_with_loop();
    let (addr, _server) = start_echo_server(&server_lt);

    let client_lt = init_with_loop();
    let client = TcpClient::<()>::new(client_lt.event_loop(), addr, "updown-client");

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client.set_connection_callback(move |conn| {
        tx.lock().unwrap().send(conn.connected()).unwrap();
        if conn.connected() {
            // Immediately wind the connection down again.
            conn.shutdown();
        }
    });
    client.connect();

    assert!(recv_within(&rx, "up event"));
    assert!(!recv_within(&rx, "down event"));

    // The close path clears the client's connection slot right after the
    // down callback; give the loop a moment to get there.
    let deadline = std::time::Instant::now() + util::TIMEOUT;
    while client.connection().is_some() {
        assert!(std::time::Instant::now() < deadline, "connection slot never cleared");
        thread::sleep(Duration::from_millis(10));
    }
}

// Server starts down; the connector keeps retrying with backoff and the
// connection callback fires exactly once when the server appears.
#[test]
fn connector_retries_until_server_appears() {
    init();
    let client_lt = init_with_loop();

    // Reserve a port, then free it so the first attempts are refused.
    let listener = TcpListener::bind(any_local_address()).unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = TcpClient::<()>::new(client_lt.event_loop(), addr, "reconnect-client");
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            tx.lock().unwrap().send(()).unwrap();
        }
    });
    client.connect();

    // The immediate attempt and the first retry (after 500ms) both fail.
    thread::sleep(Duration::from_millis(700));
    assert!(rx.try_recv().is_err(), "connected with no server listening");

    let server_lt = init_with_loop();
    let (_bound, _server) = util::start_echo_server_at(&server_lt, addr);

    // The next backoff attempt lands well within the timeout.
    recv_within(&rx, "connection after server came up");
    assert!(rx.try_recv().is_err(), "connected more than once");

    client.stop();
}

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use evio::net::TcpServer;
use evio::EventLoop;

mod util;

use util::{any_local_address, init, recv_within, TIMEOUT};

// Length-prefixed echo: the server returns each complete frame verbatim.
#[test]
fn echo_round_trip_with_length_prefix() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::<()>::new(&event_loop, any_local_address(), "echo", false).unwrap();
    server.set_message_callback(|conn, buf, _receive_time| {
        while buf.readable_bytes() >= 4 {
            let len = buf.peek_u32() as usize;
            if buf.readable_bytes() < 4 + len {
                // Incomplete frame; wait for the rest.
                break;
            }
            let frame = buf.retrieve_as_vec(4 + len);
            conn.send(&frame);
        }
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let loop_handle = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();

        let mut frame = Vec::new();
        frame.extend_from_slice(&5u32.to_be_bytes());
        frame.extend_from_slice(b"hello");
        stream.write_all(&frame).unwrap();

        let mut echoed = vec![0u8; frame.len()];
        stream.read_exact(&mut echoed).unwrap();
        loop_handle.quit();
        (frame, echoed)
    });

    event_loop.run();
    let (sent, received) = client.join().unwrap();
    assert_eq!(sent, received);
}

// Several clients over a pool of worker loops, random payloads.
#[test]
fn multi_loop_echo_random_payload() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::<()>::new(&event_loop, any_local_address(), "echo-pool", false).unwrap();
    server.set_thread_num(2);
    server.set_message_callback(|conn, buf, _receive_time| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let loop_handle = event_loop.clone();
    let driver = thread::spawn(move || {
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(thread::spawn(move || {
                let mut payload = vec![0u8; 64 * 1024];
                rand::rng().fill(&mut payload[..]);

                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(TIMEOUT)).unwrap();
                stream.write_all(&payload).unwrap();

                let mut received = vec![0u8; payload.len()];
                stream.read_exact(&mut received).unwrap();
                assert_eq!(payload, received);
            }));
        }
        for client in clients {
            client.join().unwrap();
        }
        loop_handle.quit();
    });

    event_loop.run();
    driver.join().unwrap();
}

#[test]
fn connection_callback_fires_up_then_down() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::<()>::new(&event_loop, any_local_address(), "updown", false).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    server.set_connection_callback(move |conn| {
        tx.lock().unwrap().send(conn.connected()).unwrap();
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let stream = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(stream);
    });

    let loop_handle = event_loop.clone();
    let driver = thread::spawn(move || {
        assert!(recv_within(&rx, "up event"), "expected connected=true first");
        assert!(
            !recv_within(&rx, "down event"),
            "expected connected=false second"
        );
        loop_handle.quit();
    });

    event_loop.run();
    client.join().unwrap();
    driver.join().unwrap();
}

// One oversized send crosses the high-water mark exactly once, and the
// write-complete callback fires when the flood has drained.
#[test]
fn high_water_mark_and_write_complete() {
    const THRESHOLD: usize = 64 * 1024;
    // Far beyond what the kernel could buffer, so the direct write can
    // never swallow the whole flood.
    const FLOOD: usize = 32 * 1024 * 1024;

    init();
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::<()>::new(&event_loop, any_local_address(), "flood", false).unwrap();

    let (hwm_tx, hwm_rx) = mpsc::channel();
    let hwm_tx = Mutex::new(hwm_tx);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            let tx = Mutex::new(hwm_tx.lock().unwrap().clone());
            conn.set_high_water_mark_callback(
                move |_conn, size| {
                    tx.lock().unwrap().send(size).unwrap();
                },
                THRESHOLD,
            );
            conn.send(&vec![0x42u8; FLOOD]);
        }
    });

    let (wc_tx, wc_rx) = mpsc::channel();
    let wc_tx = Mutex::new(wc_tx);
    server.set_write_complete_callback(move |_conn| {
        wc_tx.lock().unwrap().send(()).unwrap();
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut received = vec![0u8; FLOOD];
        stream.read_exact(&mut received).unwrap();
        assert!(received.iter().all(|&b| b == 0x42));
    });

    let loop_handle = event_loop.clone();
    let driver = thread::spawn(move || {
        let size = recv_within(&hwm_rx, "high-water event");
        assert!(size >= THRESHOLD, "reported {} below threshold", size);
        recv_within(&wc_rx, "write-complete event");
        // The flood was a single send; one crossing, one signal.
        assert!(hwm_rx.try_recv().is_err());
        loop_handle.quit();
    });

    event_loop.run();
    client.join().unwrap();
    driver.join().unwrap();
}

// An application-level idle kick: the server schedules a delayed close and
// the client observes a clean EOF.
#[test]
fn delayed_force_close_delivers_eof() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::<()>::new(&event_loop, any_local_address(), "idle-kick", false).unwrap();
    server.set_connection_callback(|conn| {
        if conn.connected() {
            conn.force_close_with_delay(Duration::from_millis(200));
        }
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let loop_handle = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0, "expected EOF");
        assert!(start.elapsed() >= Duration::from_millis(150));
        loop_handle.quit();
    });

    event_loop.run();
    client.join().unwrap();
}

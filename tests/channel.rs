use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::mpsc;

use evio::Channel;

mod util;

use util::{any_local_address, init_with_loop, recv_within};

// Registration parity: the fd map holds an armed channel, keeps a muted
// one, and forgets a removed one.
#[test]
fn registration_lifecycle() {
    let lt = init_with_loop();
    let loop_handle = lt.event_loop().clone();
    let listener = TcpListener::bind(any_local_address()).unwrap();

    let (tx, rx) = mpsc::channel();
    let inner = loop_handle.clone();
    loop_handle.run_in_loop(move || {
        let channel = Channel::new(&inner, listener.as_raw_fd());
        let unregistered = inner.has_channel(&channel);

        channel.enable_read();
        let registered = inner.has_channel(&channel);
        assert!(channel.is_reading());
        assert!(!channel.is_writing());

        // Muting drops the kernel interest but keeps the mapping.
        channel.disable_all();
        let muted = inner.has_channel(&channel);
        assert!(channel.interest().is_none());

        // Cheap re-arm after muting.
        channel.enable_write();
        assert!(channel.is_writing());
        channel.disable_all();

        channel.remove();
        let removed = inner.has_channel(&channel);

        tx.send((unregistered, registered, muted, removed)).unwrap();
        drop(listener);
    });

    let (unregistered, registered, muted, removed) = recv_within(&rx, "registration probe");
    assert!(!unregistered);
    assert!(registered);
    assert!(muted);
    assert!(!removed);
}

#[test]
fn interest_mask_composition() {
    let lt = init_with_loop();
    let loop_handle = lt.event_loop().clone();
    let listener = TcpListener::bind(any_local_address()).unwrap();

    let (tx, rx) = mpsc::channel();
    let inner = loop_handle.clone();
    loop_handle.run_in_loop(move || {
        let channel = Channel::new(&inner, listener.as_raw_fd());
        channel.enable_read();
        channel.enable_write();
        let both = channel.is_reading() && channel.is_writing();

        channel.disable_write();
        let read_only = channel.is_reading() && !channel.is_writing();

        channel.disable_all();
        channel.remove();
        tx.send((both, read_only)).unwrap();
        drop(listener);
    });

    let (both, read_only) = recv_within(&rx, "interest probe");
    assert!(both);
    assert!(read_only);
}

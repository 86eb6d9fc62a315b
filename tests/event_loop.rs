use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use evio::net::{TcpClient, TcpConnection, TcpServer};
use evio::EventLoop;

mod util;

use util::{assert_send, assert_sync, init, init_with_loop, recv_within};

#[test]
fn handle_is_send_and_sync() {
    assert_send::<EventLoop>();
    assert_sync::<EventLoop>();
    assert_send::<Arc<TcpConnection<()>>>();
    assert_sync::<Arc<TcpConnection<()>>>();
    assert_send::<Arc<TcpServer<()>>>();
    assert_send::<Arc<TcpClient<()>>>();
}

#[test]
fn run_in_loop_runs_inline_on_loop_thread() {
    init();
    let event_loop = EventLoop::new().expect("unable to create loop");
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    // On the owning thread the task must not be deferred.
    event_loop.run_in_loop(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(event_loop.queue_size(), 0);
}

#[test]
fn queue_in_loop_cross_thread() {
    let lt = init_with_loop();
    let (tx, rx) = mpsc::channel();

    let loop_handle = lt.event_loop().clone();
    let inner_handle = loop_handle.clone();
    loop_handle.queue_in_loop(move || {
        assert!(inner_handle.is_in_loop_thread());
        tx.send(thread::current().id()).unwrap();
    });

    let task_thread = recv_within(&rx, "queued task");
    assert_ne!(task_thread, thread::current().id());
}

#[test]
fn queued_task_can_queue_another() {
    let lt = init_with_loop();
    let (tx, rx) = mpsc::channel();

    let loop_handle = lt.event_loop().clone();
    let inner = loop_handle.clone();
    loop_handle.queue_in_loop(move || {
        // A task queued from inside the drain phase must survive to the
        // next iteration, not get lost.
        inner.queue_in_loop(move || {
            tx.send(()).unwrap();
        });
    });

    recv_within(&rx, "task queued from a task");
}

#[test]
fn run_in_loop_from_other_thread_is_deferred() {
    let lt = init_with_loop();
    let (tx, rx) = mpsc::channel();

    let loop_handle = lt.event_loop().clone();
    loop_handle.run_in_loop(move || {
        tx.send(thread::current().id()).unwrap();
    });

    let task_thread = recv_within(&rx, "deferred task");
    assert_ne!(task_thread, thread::current().id());
}

#[test]
fn iteration_counter_advances() {
    let lt = init_with_loop();
    let loop_handle = lt.event_loop().clone();

    let (tx, rx) = mpsc::channel();
    loop_handle.queue_in_loop(move || tx.send(()).unwrap());
    recv_within(&rx, "first iteration");

    let before = loop_handle.iteration();
    let (tx, rx) = mpsc::channel();
    loop_handle.queue_in_loop(move || tx.send(()).unwrap());
    recv_within(&rx, "second iteration");
    assert!(loop_handle.iteration() > before);
}

#[test]
fn quit_from_other_thread_stops_loop() {
    init();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("unable to create loop");
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });

    let event_loop = recv_within(&rx, "loop handle");
    // Let the loop park in poll, then break it.
    thread::sleep(Duration::from_millis(50));
    assert!(event_loop.is_running());
    event_loop.quit();
    handle.join().expect("loop thread panicked");
    assert!(!event_loop.is_running());
}

#[test]
#[should_panic(expected = "EventLoop owned by")]
fn run_from_wrong_thread_panics() {
    init();
    let lt = init_with_loop();
    // The loop lives on its own thread; running it from here is a
    // thread-affinity violation.
    lt.event_loop().run();
}

#[test]
fn wakeup_interrupts_poll_promptly() {
    let lt = init_with_loop();
    let loop_handle = lt.event_loop().clone();

    // Ensure the loop is parked in poll.
    thread::sleep(Duration::from_millis(50));
    let start = std::time::Instant::now();
    let (tx, rx) = mpsc::channel();
    loop_handle.queue_in_loop(move || tx.send(()).unwrap());
    recv_within(&rx, "wakeup-driven task");
    // Far below the 10s poll timeout.
    assert!(start.elapsed() < Duration::from_secs(2));
}

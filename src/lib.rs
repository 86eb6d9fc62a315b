//! Multithreaded reactor-style TCP networking.
//!
//! evio is an event-driven foundation for servers and clients that handle
//! many concurrent connections with low latency, built on non-blocking
//! sockets and level-triggered `epoll`.
//!
//! The model is *one loop per thread*: an [`EventLoop`] is pinned to the
//! thread that created it, and everything it owns (multiplexer, timers,
//! channels, established connections) is driven from that thread alone.
//! A server runs its accept path on a base loop and spreads connections
//! round-robin over a pool of worker loops; each connection stays on its
//! loop for life. Cross-thread work enters a loop through its deferred
//! task queue and an `eventfd` wakeup.
//!
//! # Example
//!
//! An echo server on four worker loops:
//!
//! ```no_run
//! use evio::net::TcpServer;
//! use evio::EventLoop;
//!
//! # fn main() -> std::io::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let server = TcpServer::<()>::new(
//!     &event_loop,
//!     "127.0.0.1:2007".parse().unwrap(),
//!     "echo",
//!     false,
//! )?;
//! server.set_thread_num(4);
//! server.set_message_callback(|conn, buf, _receive_time| {
//!     let data = buf.retrieve_all_as_vec();
//!     conn.send(&data);
//! });
//! server.start()?;
//! event_loop.run();
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("evio only supports Linux and Android (epoll, eventfd, timerfd)");

#[macro_use]
mod macros;

mod buffer;
mod channel;
mod event_loop;
mod interest;
mod poller;
mod pool;
mod ready;
mod timer;
mod waker;

pub mod net;

pub use crate::buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use crate::channel::Channel;
pub use crate::event_loop::EventLoop;
pub use crate::interest::Interest;
pub use crate::pool::{LoopPool, LoopThread, ThreadInitCallback};
pub use crate::ready::Ready;
pub use crate::timer::TimerId;

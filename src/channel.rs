use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{trace, warn};

use crate::event_loop::Inner;
use crate::{EventLoop, Interest, Ready};

pub(crate) type ReadCallback = Box<dyn FnMut(Instant) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

/// Registration state the multiplexer stashes on a channel.
///
/// Distinguishes a first-time add from a re-arm of a muted channel, so the
/// multiplexer knows whether an update is an `EPOLL_CTL_ADD`, `_MOD` or
/// `_DEL` without a second map lookup.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ChannelState {
    /// Never registered with the multiplexer.
    New,
    /// In the fd map and in the kernel interest set.
    Added,
    /// In the fd map but muted (removed from the kernel set).
    Detached,
}

/// One file descriptor, its interest mask, and its event callbacks.
///
/// A `Channel` is the unit of registration with an [`EventLoop`]'s
/// multiplexer. It does not own the fd and performs no I/O itself; closing
/// the fd is the responsibility of whoever owns it. A channel belongs to
/// exactly one loop, and every mutation of its interest mask must happen on
/// that loop's thread.
///
/// Before the owner of the fd is dropped the channel must be [`remove`]d
/// from its loop.
///
/// [`remove`]: Channel::remove
pub struct Channel {
    fd: RawFd,
    event_loop: Weak<Inner>,
    self_weak: Weak<Channel>,
    interest: AtomicU8,
    revents: AtomicU32,
    state: AtomicU8,
    event_handling: AtomicBool,
    log_hup: AtomicBool,
    tied: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_cb: Mutex<Option<ReadCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
}

impl Channel {
    /// Creates a channel for `fd`, bound to `event_loop`.
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Arc<Channel> {
        Channel::from_weak(Arc::downgrade(event_loop.inner()), fd)
    }

    pub(crate) fn from_weak(event_loop: Weak<Inner>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            fd,
            event_loop,
            self_weak: self_weak.clone(),
            interest: AtomicU8::new(0),
            revents: AtomicU32::new(0),
            state: AtomicU8::new(ChannelState::New as u8),
            event_handling: AtomicBool::new(false),
            log_hup: AtomicBool::new(true),
            tied: AtomicBool::new(false),
            tie: Mutex::new(None),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The current interest mask, `None` when the channel is muted.
    pub fn interest(&self) -> Option<Interest> {
        Interest::from_bits(self.interest.load(Ordering::Relaxed))
    }

    /// Readiness received in the most recent dispatch.
    pub fn revents(&self) -> Ready {
        Ready::from_bits(self.revents.load(Ordering::Relaxed))
    }

    pub(crate) fn set_revents(&self, bits: u32) {
        self.revents.store(bits, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> ChannelState {
        match self.state.load(Ordering::Relaxed) {
            0 => ChannelState::New,
            1 => ChannelState::Added,
            _ => ChannelState::Detached,
        }
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_some_and(Interest::is_readable)
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_some_and(Interest::is_writable)
    }

    pub fn set_read_callback<F>(&self, cb: F)
    where
        F: FnMut(Instant) + Send + 'static,
    {
        *self.read_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_write_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.write_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.close_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.error_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Ties this channel to its owning object.
    ///
    /// Before each dispatch the weak reference is upgraded and held for the
    /// duration of the dispatch; if the upgrade fails the dispatch is
    /// skipped. This keeps the owner alive across a callback that may
    /// remove the owner's last strong reference.
    pub fn tie<T>(&self, owner: &Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        *self.tie.lock().unwrap() = Some(Arc::downgrade(&owner));
        self.tied.store(true, Ordering::Relaxed);
    }

    pub fn enable_read(&self) {
        self.add_interest(Interest::READABLE);
    }

    pub fn disable_read(&self) {
        self.remove_interest(Interest::READABLE);
    }

    pub fn enable_write(&self) {
        self.add_interest(Interest::WRITABLE);
    }

    pub fn disable_write(&self) {
        self.remove_interest(Interest::WRITABLE);
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Relaxed);
        self.update();
    }

    /// Suppresses the warning normally logged when the peer hangs up.
    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.store(on, Ordering::Relaxed);
    }

    fn add_interest(&self, interest: Interest) {
        let new = match self.interest() {
            Some(cur) => cur | interest,
            None => interest,
        };
        self.interest.store(new.bits(), Ordering::Relaxed);
        self.update();
    }

    fn remove_interest(&self, interest: Interest) {
        let new = self.interest().and_then(|cur| cur.remove(interest));
        self.interest
            .store(new.map_or(0, Interest::bits), Ordering::Relaxed);
        self.update();
    }

    fn update(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Unregisters the channel from its loop entirely.
    ///
    /// The interest mask must already be empty (call [`disable_all`]
    /// first).
    ///
    /// [`disable_all`]: Channel::disable_all
    pub fn remove(&self) {
        debug_assert!(self.interest().is_none());
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    /// The strong reference the multiplexer keeps in its fd map.
    pub(crate) fn as_arc(&self) -> Arc<Channel> {
        self.self_weak
            .upgrade()
            .expect("channel used after its last strong reference was dropped")
    }

    /// Dispatches the readiness recorded by the multiplexer.
    ///
    /// Invoked by the event loop on the loop thread, with revents already
    /// set. Dispatch order: close (hangup without input), error, read,
    /// write.
    pub fn handle_event(&self, receive_time: Instant) {
        if self.tied.load(Ordering::Relaxed) {
            let tie = self.tie.lock().unwrap().clone();
            let guard = tie.and_then(|weak| weak.upgrade());
            if guard.is_some() {
                self.handle_event_with_guard(receive_time);
            }
            // Owner already destroyed: skip dispatch.
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.revents();
        self.event_handling.store(true, Ordering::Relaxed);
        trace!("fd {} dispatching {:?}", self.fd, revents);

        if revents.is_hangup() && !revents.has_input() {
            if self.log_hup.load(Ordering::Relaxed) {
                warn!("fd {} hang up", self.fd);
            }
            self.invoke(&self.close_cb);
        }
        if revents.is_error() {
            self.invoke(&self.error_cb);
        }
        if revents.is_readable() {
            self.invoke_read(receive_time);
        }
        if revents.is_writable() {
            self.invoke(&self.write_cb);
        }

        self.event_handling.store(false, Ordering::Relaxed);
    }

    // Callbacks are taken out of their slot for the duration of the call so
    // a callback may install a replacement on this same channel; the old
    // one is only put back if the slot is still empty.
    fn invoke(&self, slot: &Mutex<Option<EventCallback>>) {
        let taken = slot.lock().unwrap().take();
        if let Some(mut cb) = taken {
            cb();
            let mut slot = slot.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn invoke_read(&self, receive_time: Instant) {
        let taken = self.read_cb.lock().unwrap().take();
        if let Some(mut cb) = taken {
            cb(receive_time);
            let mut slot = self.read_cb.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Relaxed));
    }
}

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::channel::ChannelState;
use crate::{Channel, Interest};

const INITIAL_EVENT_CAPACITY: usize = 16;

/// The I/O multiplexer: a level-triggered `epoll` instance plus the
/// fd → channel map.
///
/// Owned by one [`EventLoop`] and only ever touched from its thread. Every
/// registered channel's fd is present in the map exactly once; a channel
/// whose interest mask becomes empty is muted (dropped from the kernel
/// interest set) but keeps its map entry so it can be re-armed cheaply.
///
/// [`EventLoop`]: crate::EventLoop
pub(crate) struct Poller {
    ep: OwnedFd,
    channels: HashMap<RawFd, Arc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Poller {
            ep,
            channels: HashMap::new(),
            events: Vec::with_capacity(INITIAL_EVENT_CAPACITY),
        })
    }

    /// Blocks until at least one channel is ready or `timeout` elapses.
    ///
    /// Ready channels are appended to `active` with their revents set; the
    /// returned timestamp records when the wait returned and becomes the
    /// receive time of this dispatch round.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<Arc<Channel>>,
    ) -> io::Result<Instant> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying
                // a zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        self.events.clear();
        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as i32,
            timeout,
        ))? as usize;
        let now = Instant::now();

        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { self.events.set_len(n_events) };

        for event in &self.events {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd) {
                Some(channel) => {
                    channel.set_revents(event.events);
                    active.push(channel.clone());
                }
                None => warn!("readiness for unregistered fd {}", fd),
            }
        }
        trace!("{} events, {} channels registered", n_events, self.channels.len());

        // A full batch suggests more readiness than fits; grow for the
        // next round.
        if n_events == self.events.capacity() {
            self.events.reserve(n_events);
        }
        Ok(now)
    }

    /// Applies a channel's current interest mask: first registration,
    /// modification, or muting.
    pub(crate) fn update_channel(&mut self, channel: &Channel) {
        let state = channel.state();
        trace!(
            "update fd {} interest {:?} state {:?}",
            channel.fd(),
            channel.interest(),
            state
        );
        match state {
            ChannelState::New | ChannelState::Detached => {
                let fd = channel.fd();
                if state == ChannelState::New {
                    debug_assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, channel.as_arc());
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                channel.set_state(ChannelState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelState::Added => {
                if channel.interest().is_none() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Detached);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Drops a channel from the fd map (and the kernel set if still armed).
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("remove fd {}", fd);
        debug_assert!(channel.interest().is_none());
        let removed = self.channels.remove(&fd);
        debug_assert!(removed.is_some());
        if channel.state() == ChannelState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_state(ChannelState::New);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), channel))
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: channel.fd() as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            ptr::null_mut()
        } else {
            &mut event
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, channel.fd(), event_ptr)) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd {}: {}", channel.fd(), err);
            } else {
                // Registration failure means a bad fd or a double add:
                // the reactor's bookkeeping is broken.
                panic!("epoll_ctl op {} fd {}: {}", op, channel.fd(), err);
            }
        }
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interest_to_epoll(interest: Option<Interest>) -> u32 {
    let mut kind = 0;
    if let Some(interest) = interest {
        if interest.is_readable() {
            kind |= libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP;
        }
        if interest.is_writable() {
            kind |= libc::EPOLLOUT;
        }
    }
    kind as u32
}

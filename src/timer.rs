use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{error, trace};

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

// Never re-used for the lifetime of the process, so a `TimerId` stays a
// valid identity even after its timer's storage is gone.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered timer.
///
/// Returned by [`EventLoop::run_at`] and friends; pass it to
/// [`EventLoop::cancel`]. Cancelling always succeeds structurally: if the
/// timer is currently firing its callback finishes, and cancellation only
/// prevents future firings of a periodic timer.
///
/// [`EventLoop::run_at`]: crate::EventLoop::run_at
/// [`EventLoop::cancel`]: crate::EventLoop::cancel
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn next() -> TimerId {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct TimerEntry {
    id: TimerId,
    when: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
}

impl TimerEntry {
    pub(crate) fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> TimerEntry {
        TimerEntry {
            id: TimerId::next(),
            when,
            interval,
            callback,
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        self.id
    }

    pub(crate) fn fire(&mut self) {
        (self.callback)()
    }
}

/// The ordered timer set and its `timerfd` alarm source.
///
/// Two parallel collections: `timers` ordered by (expiration, id) answers
/// "earliest expiration" pops, `active` keyed by id answers cancellation
/// lookups. Both always contain the same set of live timers.
///
/// The kernel alarm is kept set to the earliest expiration. When it fires,
/// the loop drains the fd, pops everything due, runs the callbacks, then
/// reinserts periodic timers that were not cancelled mid-fire.
pub(crate) struct TimerQueue {
    timerfd: OwnedFd,
    timers: BTreeMap<(Instant, TimerId), TimerEntry>,
    active: HashMap<TimerId, Instant>,
    handling_expired: bool,
    cancelled_in_fire: HashSet<TimerId>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        let timerfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(TimerQueue {
            timerfd,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            handling_expired: false,
            cancelled_in_fire: HashSet::new(),
        })
    }

    pub(crate) fn timerfd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    /// Inserts a timer, re-arming the alarm if the earliest expiration
    /// moved forward.
    pub(crate) fn add(&mut self, entry: TimerEntry) {
        if self.insert(entry) {
            self.rearm();
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.check_parity();
        if let Some(when) = self.active.remove(&id) {
            let removed = self.timers.remove(&(when, id));
            debug_assert!(removed.is_some());
        } else if self.handling_expired {
            // Currently firing: have the restart pass drop it instead of
            // reinserting.
            self.cancelled_in_fire.insert(id);
        }
        self.check_parity();
    }

    /// Drains the alarm fd. Must be called on every alarm readiness, or the
    /// level-triggered fd keeps the loop spinning.
    pub(crate) fn read_timerfd(&self) {
        let mut count = [0u8; 8];
        match syscall!(read(
            self.timerfd.as_raw_fd(),
            count.as_mut_ptr() as *mut libc::c_void,
            count.len(),
        )) {
            Ok(_) => trace!("alarm fired {} time(s)", u64::from_ne_bytes(count)),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("failed to read timerfd: {}", err),
        }
    }

    /// Pops every timer due at `now` and flags the firing phase; pair with
    /// [`restart`].
    ///
    /// [`restart`]: TimerQueue::restart
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        self.check_parity();
        let mut expired = Vec::new();
        while let Some((&(when, _), _)) = self.timers.first_key_value() {
            if when > now {
                break;
            }
            if let Some(((_, id), entry)) = self.timers.pop_first() {
                self.active.remove(&id);
                expired.push(entry);
            }
        }
        self.handling_expired = true;
        self.cancelled_in_fire.clear();
        self.check_parity();
        expired
    }

    /// Reinserts fired periodic timers that were not cancelled while
    /// firing, then re-arms the alarm for the new earliest expiration.
    pub(crate) fn restart(&mut self, expired: Vec<TimerEntry>, now: Instant) {
        for mut entry in expired {
            match entry.interval {
                Some(interval) if !self.cancelled_in_fire.contains(&entry.id) => {
                    entry.when = now + interval;
                    self.insert(entry);
                }
                // One-shot, or cancelled mid-fire: drop.
                _ => {}
            }
        }
        self.handling_expired = false;
        self.rearm();
    }

    fn insert(&mut self, entry: TimerEntry) -> bool {
        self.check_parity();
        let earliest_changed = self
            .timers
            .keys()
            .next()
            .map_or(true, |&(when, _)| entry.when < when);
        self.active.insert(entry.id, entry.when);
        self.timers.insert((entry.when, entry.id), entry);
        self.check_parity();
        earliest_changed
    }

    fn rearm(&self) {
        if let Some(&(when, _)) = self.timers.keys().next() {
            reset_timerfd(self.timerfd.as_raw_fd(), when);
        }
    }

    #[inline]
    fn check_parity(&self) {
        debug_assert_eq!(self.timers.len(), self.active.len());
    }

    #[cfg(test)]
    fn contains(&self, id: TimerId) -> bool {
        self.active.contains_key(&id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.timers.len()
    }
}

fn reset_timerfd(timerfd: RawFd, when: Instant) {
    let delay = when.saturating_duration_since(Instant::now());
    // A zero `it_value` would disarm the fd; keep a small floor so a
    // just-expired deadline still fires.
    let delay = delay.max(Duration::from_micros(100));
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    if let Err(err) = syscall!(timerfd_settime(timerfd, 0, &new_value, ptr::null_mut())) {
        error!("timerfd_settime: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop_entry(when: Instant, interval: Option<Duration>) -> TimerEntry {
        TimerEntry::new(Box::new(|| {}), when, interval)
    }

    #[test]
    fn expiry_order() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let late = noop_entry(now + Duration::from_secs(2), None);
        let early = noop_entry(now + Duration::from_secs(1), None);
        let (late_id, early_id) = (late.id(), early.id());
        queue.add(late);
        queue.add(early);
        assert_eq!(queue.len(), 2);

        let expired = queue.take_expired(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), early_id);
        queue.restart(expired, now + Duration::from_secs(1));

        assert!(queue.contains(late_id));
        assert!(!queue.contains(early_id));
    }

    #[test]
    fn periodic_timer_is_reinserted() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        let entry = TimerEntry::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            now,
            Some(Duration::from_millis(10)),
        );
        let id = entry.id();
        queue.add(entry);

        for round in 0..3 {
            let at = now + Duration::from_millis(10 * round);
            let mut expired = queue.take_expired(at);
            assert_eq!(expired.len(), 1, "round {}", round);
            for entry in expired.iter_mut() {
                entry.fire();
            }
            queue.restart(expired, at);
            assert!(queue.contains(id));
        }
        assert_eq!(fires.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn cancel_live_timer() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let entry = noop_entry(now + Duration::from_secs(1), None);
        let id = entry.id();
        queue.add(entry);
        assert!(queue.contains(id));

        queue.cancel(id);
        assert!(!queue.contains(id));
        assert_eq!(queue.len(), 0);
        assert!(queue.take_expired(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn cancel_while_firing_stops_periodic() {
        let mut queue = TimerQueue::new().unwrap();
        let now = Instant::now();
        let entry = noop_entry(now, Some(Duration::from_millis(10)));
        let id = entry.id();
        queue.add(entry);

        let expired = queue.take_expired(now);
        assert_eq!(expired.len(), 1);
        // The timer is mid-fire: not in the live set, so cancellation lands
        // in the cancelled-in-fire set.
        queue.cancel(id);
        queue.restart(expired, now);
        assert!(!queue.contains(id));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let a = TimerId::next();
        let b = TimerId::next();
        assert_ne!(a, b);
    }
}

use std::cell::Cell;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::poller::Poller;
use crate::timer::{TimerCallback, TimerEntry, TimerQueue};
use crate::waker::Waker;
use crate::{Channel, TimerId};

/// How long one `poll` may block when nothing is ready.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    // One loop per thread: set while this thread owns a live EventLoop.
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

// Writes to a peer that already closed must yield EPIPE, not kill the
// process. Process-wide, set once, never reset.
fn ignore_sigpipe() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // SAFETY: SIG_IGN is a valid disposition and this races with
        // nothing; we are inside a `Once`.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    });
}

/// A reactor pinned to one OS thread.
///
/// An `EventLoop` owns a multiplexer, a timer queue, a wakeup fd and a
/// queue of deferred tasks. [`run`] drives the dispatch cycle forever:
/// wait for readiness, dispatch each ready [`Channel`]'s callbacks, then
/// drain deferred tasks. All of it happens on the thread that called
/// [`new`] (the *loop thread*), and methods that touch loop state from
/// another thread panic.
///
/// The handle itself is cheap to clone and freely shareable; the
/// cross-thread entry points are [`run_in_loop`], [`queue_in_loop`], the
/// timer methods and [`quit`].
///
/// [`run`]: EventLoop::run
/// [`new`]: EventLoop::new
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`quit`]: EventLoop::quit
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    thread: ThreadId,
    poller: Mutex<Poller>,
    timers: Mutex<TimerQueue>,
    timer_channel: Arc<Channel>,
    waker: Arc<Waker>,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
    running: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
}

impl EventLoop {
    /// Creates a loop owned by the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a live `EventLoop`.
    pub fn new() -> io::Result<EventLoop> {
        ignore_sigpipe();

        let poller = Poller::new()?;
        let waker = Arc::new(Waker::new()?);
        let timers = TimerQueue::new()?;
        let timerfd = timers.timerfd();
        let wakeupfd = waker.as_raw_fd();

        // Claimed only after the fallible setup, so a failed construction
        // does not poison this thread.
        LOOP_IN_THIS_THREAD.with(|slot| {
            assert!(
                !slot.get(),
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
            slot.set(true);
        });

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            thread: thread::current().id(),
            poller: Mutex::new(poller),
            timers: Mutex::new(timers),
            timer_channel: Channel::from_weak(weak.clone(), timerfd),
            waker: waker.clone(),
            wakeup_channel: Channel::from_weak(weak.clone(), wakeupfd),
            pending: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
        });

        inner.wakeup_channel.set_read_callback(move |_| waker.drain());
        inner.wakeup_channel.enable_read();

        let weak = Arc::downgrade(&inner);
        inner.timer_channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_timer_expiry();
            }
        });
        inner.timer_channel.enable_read();

        debug!("EventLoop created in {:?}", inner.thread);
        Ok(EventLoop { inner })
    }

    /// Runs the dispatch cycle until [`quit`] is observed.
    ///
    /// Must be called from the loop thread.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        let inner = &self.inner;
        inner.assert_in_loop_thread();
        assert!(
            !inner.running.swap(true, Ordering::AcqRel),
            "EventLoop is already running"
        );
        inner.quit.store(false, Ordering::Release);
        debug!("EventLoop start running in {:?}", inner.thread);

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !inner.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = match inner
                .poller
                .lock()
                .unwrap()
                .poll(Some(POLL_TIMEOUT), &mut active)
            {
                Ok(receive_time) => receive_time,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("poll failed: {}", err);
                    Instant::now()
                }
            };
            inner.iteration.fetch_add(1, Ordering::Relaxed);

            inner.event_handling.store(true, Ordering::Relaxed);
            for channel in &active {
                trace!("active {:?} -> {:?}", channel, channel.revents());
                channel.handle_event(receive_time);
            }
            inner.event_handling.store(false, Ordering::Relaxed);

            inner.do_pending_tasks();
        }

        debug!("EventLoop stop running in {:?}", inner.thread);
        inner.running.store(false, Ordering::Release);
        // Tasks that raced the shutdown still run; anything queued from
        // here on is dropped by `queue`.
        inner.do_pending_tasks();
    }

    /// Makes [`run`] return after the current iteration.
    ///
    /// Callable from any thread.
    ///
    /// [`run`]: EventLoop::run
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.inner.wakeup();
        }
    }

    /// Runs `task` on the loop thread: inline when already there, else
    /// deferred via [`queue_in_loop`].
    ///
    /// [`queue_in_loop`]: EventLoop::queue_in_loop
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the deferred queue; it runs on the loop thread
    /// after the events of the current (or next) iteration.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue(Box::new(task));
    }

    /// Number of tasks currently waiting in the deferred queue.
    pub fn queue_size(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Runs `cb` once at `when`. Callable from any thread.
    pub fn run_at<F>(&self, when: Instant, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(Box::new(cb), when, None)
    }

    /// Runs `cb` once after `delay`. Callable from any thread.
    pub fn run_after<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Runs `cb` every `interval`, first firing one `interval` from now.
    /// Callable from any thread.
    pub fn run_every<F>(&self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(Box::new(cb), Instant::now() + interval, Some(interval))
    }

    fn add_timer(
        &self,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let entry = TimerEntry::new(callback, when, interval);
        let id = entry.id();
        // A `Weak` so an abandoned loop cannot keep itself alive through
        // its own task queue.
        let weak = Arc::downgrade(&self.inner);
        self.inner.run_in_loop(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.timers.lock().unwrap().add(entry);
            }
        }));
        id
    }

    /// Cancels a timer. If it is currently firing, the in-flight callback
    /// finishes but a periodic timer will not fire again.
    pub fn cancel(&self, timer: TimerId) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.run_in_loop(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.timers.lock().unwrap().cancel(timer);
            }
        }));
    }

    /// Breaks the current `poll` sleep.
    pub fn wakeup(&self) {
        self.inner.wakeup();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    /// # Panics
    ///
    /// Panics when called from any thread other than the loop thread.
    pub fn assert_in_loop_thread(&self) {
        self.inner.assert_in_loop_thread();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Dispatch iterations completed so far.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.load(Ordering::Relaxed)
    }

    /// Whether `channel` is registered with this loop's multiplexer.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.inner.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().has_channel(channel)
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Two handles to the same underlying loop compare equal.
    pub fn same_loop(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("thread", &self.inner.thread)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Inner {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by {:?} was used from {:?}",
                self.thread,
                thread::current().id()
            );
        }
    }

    pub(crate) fn run_in_loop(&self, task: Task) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue(task);
        }
    }

    pub(crate) fn queue(&self, task: Task) {
        if self.quit.load(Ordering::Acquire) && !self.running.load(Ordering::Acquire) {
            // The loop has exited: the task can never run, and holding it
            // could keep the loop alive through its own queue.
            warn!("task queued to a terminated EventLoop, dropping it");
            return;
        }
        self.pending.lock().unwrap().push(task);
        // Wake when the caller cannot be sure the loop reaches the drain
        // phase soon: it is another thread, or the drain itself is what is
        // running (a task queued from a task must survive to the next
        // iteration).
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Relaxed) {
            self.wakeup();
        }
    }

    pub(crate) fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            error!("EventLoop wakeup failed: {}", err);
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Relaxed);
        // Swap the queue into a local vector: keeps the critical section
        // short and keeps a task that calls queue_in_loop from deadlocking.
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Relaxed);
    }

    fn handle_timer_expiry(&self) {
        self.assert_in_loop_thread();
        let now = Instant::now();
        let mut expired = {
            let mut timers = self.timers.lock().unwrap();
            timers.read_timerfd();
            timers.take_expired(now)
        };
        // Callbacks run outside the lock so they may add or cancel timers.
        for entry in expired.iter_mut() {
            entry.fire();
        }
        self.timers.lock().unwrap().restart(expired, now);
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        if self.event_handling.load(Ordering::Relaxed) {
            // Legal only because the dispatch list holds its own strong
            // references; the channel just stops getting events.
            trace!("removing fd {} during event dispatch", channel.fd());
        }
        self.poller.lock().unwrap().remove_channel(channel);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("EventLoop of {:?} dropping", self.thread);
        if thread::current().id() == self.thread {
            LOOP_IN_THIS_THREAD.with(|slot| slot.set(false));
        }
    }
}

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::debug;

use crate::EventLoop;

/// Runs once on each freshly started loop thread, before the loop enters
/// its dispatch cycle.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// One worker thread running one [`EventLoop`].
///
/// The loop is constructed *on the spawned thread* (loops are pinned to the
/// thread that creates them); [`start`] blocks until the loop exists and
/// returns a handle to it. Dropping the `LoopThread` asks the loop to quit
/// and joins the thread.
///
/// [`start`]: LoopThread::start
pub struct LoopThread {
    event_loop: EventLoop,
    handle: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> io::Result<LoopThread> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new().name(name).spawn(move || {
            match EventLoop::new() {
                Ok(event_loop) => {
                    // Hand the loop back before running; the starter is
                    // blocked on it.
                    let _ = tx.send(Ok(event_loop.clone()));
                    if let Some(init) = &init {
                        init(&event_loop);
                    }
                    event_loop.run();
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                }
            }
        })?;
        let event_loop = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "loop thread died on startup"))??;
        Ok(LoopThread {
            event_loop,
            handle: Some(handle),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl fmt::Debug for LoopThread {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("LoopThread")
            .field("event_loop", &self.event_loop)
            .finish()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A fixed-size set of worker [`EventLoop`]s, each on its own thread.
///
/// The server's base loop owns the pool; [`next_loop`] hands out workers
/// round-robin for new connections. With zero threads every caller gets the
/// base loop back, so single-threaded servers need no special casing.
///
/// [`next_loop`]: LoopPool::next_loop
pub struct LoopPool {
    base_loop: EventLoop,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<LoopThread>>,
    loops: Mutex<Vec<EventLoop>>,
}

impl LoopPool {
    pub fn new(base_loop: EventLoop, name: impl Into<String>) -> LoopPool {
        LoopPool {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Sets the number of worker threads. Must be called before [`start`].
    ///
    /// [`start`]: LoopPool::start
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started());
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    /// Brings the workers up. Runs `init` once per worker loop (or on the
    /// base loop when there are no workers).
    pub fn start(&self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "LoopPool already started"
        );
        self.base_loop.assert_in_loop_thread();

        let num_threads = self.num_threads.load(Ordering::Relaxed);
        for i in 0..num_threads {
            let thread = LoopThread::start(format!("{}{}", self.name, i), init.clone())?;
            self.loops.lock().unwrap().push(thread.event_loop().clone());
            self.threads.lock().unwrap().push(thread);
        }
        debug!("LoopPool [{}] started {} worker loop(s)", self.name, num_threads);

        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// The next worker loop, round-robin; the base loop when the pool is
    /// empty.
    pub fn next_loop(&self) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        debug_assert!(self.started());
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[index].clone()
        }
    }

    /// A stable worker choice for `key`: the same key always lands on the
    /// same loop.
    pub fn loop_for_hash(&self, key: u64) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            loops[(key % loops.len() as u64) as usize].clone()
        }
    }

    /// Every loop in the pool; just the base loop when the pool is empty.
    pub fn all_loops(&self) -> Vec<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LoopPool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("LoopPool")
            .field("name", &self.name)
            .field("started", &self.started())
            .field("num_threads", &self.num_threads.load(Ordering::Relaxed))
            .finish()
    }
}

//! Single-threaded, non-blocking event loop.
//!
//! One [`Reactor`] is bound to each OS thread of the server: the reactor
//! thread, the supervisor and every worker. It multiplexes descriptors with
//! `poll(2)`, runs timers and deferred callbacks, and hosts the end-of-iteration
//! safe point where classic signal handlers are dispatched.
//!
//! # Architecture
//!
//! ## Loop iteration
//!
//! 1. Compute the wait: zero with deferred callbacks pending, otherwise the
//!    nearest timer bounded by `max_wait`
//! 2. Block in `poll(2)`; `EINTR` just ends the wait early
//! 3. Invoke the handler of every ready descriptor
//! 4. Fire expired timers
//! 5. End stage: deferred callbacks, then end hooks (signal dispatch)
//! 6. Fold the exit conditions over the live event count
//!
//! ## Handles
//!
//! [`ReactorHandle`] is a cheap clone of the shared state. Handlers receive one
//! and may add or remove sources, arm timers or stop the loop while the loop is
//! running; no borrow of the inner state is held across a handler call.
//!
//! # Example
//!
//! ```no_run
//! use spindle::reactor::{Interest, Reactor};
//! use std::os::fd::AsRawFd;
//! use std::os::unix::net::UnixDatagram;
//!
//! let (a, b) = UnixDatagram::pair().unwrap();
//! let reactor = Reactor::new();
//! reactor
//!     .add(b.as_raw_fd(), Interest::READABLE, move |handle, fd, _ready| {
//!         let mut buf = [0u8; 64];
//!         let _ = b.recv(&mut buf);
//!         handle.remove(fd);
//!     })
//!     .unwrap();
//! a.send(b"ping").unwrap();
//! assert_eq!(reactor.run(), 0);
//! ```

mod runtime;
mod timer;

pub use runtime::{Runtime, TokioRuntime};
pub use timer::TimerId;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::{BitOr, BitOrAssign, Deref};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use timer::TimerHeap;
use tracing::{debug, error, warn};

/// Upper bound of a single blocking wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

/// Readiness interest and readiness report for a descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(1 << 1);
    /// Only reported, never requested: hang-up or socket error.
    pub const ERROR: Interest = Interest(1 << 2);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.is_readable() {
            flags |= PollFlags::POLLIN;
        }
        if self.is_writable() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    fn from_revents(revents: PollFlags) -> Interest {
        let mut ready = Interest::NONE;
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
            ready |= Interest::READABLE;
        }
        if revents.contains(PollFlags::POLLOUT) {
            ready |= Interest::WRITABLE;
        }
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            ready |= Interest::ERROR | Interest::READABLE;
        }
        ready
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        if self.is_error() {
            parts.push("ERROR");
        }
        write!(f, "Interest({})", parts.join("|"))
    }
}

/// Tag under which an exit predicate is registered; re-registering a tag replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitTag {
    /// Discounts the signal notification descriptor.
    SignalFd,
    /// Vetoes exit while a draining worker still has coroutines.
    Coroutines,
    Custom(&'static str),
}

/// Tag of a callback run at the end of every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EndHook {
    Signal,
    Custom(&'static str),
}

type Handler = Rc<dyn Fn(&ReactorHandle, RawFd, Interest)>;
type ExitPredicate = Rc<dyn Fn(&ReactorHandle, &mut usize) -> bool>;
type TimerCallback = Box<dyn FnMut(&ReactorHandle)>;
type Deferred = Box<dyn FnOnce(&ReactorHandle)>;
type DestroyCallback = Box<dyn FnOnce(&ReactorHandle)>;

struct Source {
    interest: Interest,
    handler: Handler,
}

pub struct ReactorInner {
    sources: BTreeMap<RawFd, Source>,
    timers: TimerHeap<TimerCallback>,
    defers: VecDeque<Deferred>,
    exit_conditions: BTreeMap<ExitTag, ExitPredicate>,
    end_hooks: BTreeMap<EndHook, Rc<dyn Fn(&ReactorHandle)>>,
    destroy: Vec<DestroyCallback>,
    running: bool,
    max_wait: Duration,
}

impl ReactorInner {
    fn wait_time(&mut self, cap: Option<Duration>) -> Duration {
        if !self.defers.is_empty() {
            return Duration::ZERO;
        }
        let mut wait = cap.unwrap_or(self.max_wait);
        if let Some(deadline) = self.timers.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        wait
    }
}

/// Owner of a reactor. Dropping it runs the destroy callbacks.
pub struct Reactor {
    handle: ReactorHandle,
}

/// Clonable handle to the reactor state, handed to every callback.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Rc<RefCell<ReactorInner>>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::with_max_wait(DEFAULT_MAX_WAIT)
    }

    /// Create a reactor whose blocking wait never exceeds `max_wait`.
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            handle: ReactorHandle {
                inner: Rc::new(RefCell::new(ReactorInner {
                    sources: BTreeMap::new(),
                    timers: TimerHeap::default(),
                    defers: VecDeque::new(),
                    exit_conditions: BTreeMap::new(),
                    end_hooks: BTreeMap::new(),
                    destroy: Vec::new(),
                    running: false,
                    max_wait,
                })),
            },
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Run until stopped or until the exit conditions allow it.
    ///
    /// Returns 0 on a normal exit and a negative errno if polling failed.
    pub fn run(&self) -> i32 {
        let h = &self.handle;
        h.set_running(true);
        let code = loop {
            if !h.is_running() || h.should_exit() {
                break 0;
            }
            if let Err(errno) = h.step(None) {
                error!(%errno, "reactor poll failed");
                break -(errno as i32);
            }
        };
        h.set_running(false);
        code
    }

    /// Run the loop as a task on the current async executor.
    ///
    /// Must be polled inside a `LocalSet` on a current-thread runtime. Between
    /// iterations the loop yields so that coroutines woken by handlers run
    /// before the next blocking wait.
    pub async fn run_with<R: Runtime>(&self) -> i32 {
        let h = &self.handle;
        h.set_running(true);
        let code = loop {
            if !h.is_running() || h.should_exit() {
                break 0;
            }
            if let Err(errno) = h.step(None) {
                error!(%errno, "reactor poll failed");
                break -(errno as i32);
            }
            R::yield_now().await;
        };
        h.set_running(false);
        code
    }

    /// Run a single iteration, waiting at most `timeout`.
    pub fn run_once(&self, timeout: Duration) -> Result<usize, Errno> {
        self.handle.step(Some(timeout))
    }
}

impl Deref for Reactor {
    type Target = ReactorHandle;
    fn deref(&self) -> &ReactorHandle {
        &self.handle
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.handle.teardown();
    }
}

impl ReactorHandle {
    /// Register `fd` with `interest`; fails with `EEXIST` if it is already registered.
    pub fn add<F>(&self, fd: RawFd, interest: Interest, handler: F) -> Result<(), Errno>
    where
        F: Fn(&ReactorHandle, RawFd, Interest) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.sources.contains_key(&fd) {
            return Err(Errno::EEXIST);
        }
        inner.sources.insert(
            fd,
            Source {
                interest,
                handler: Rc::new(handler),
            },
        );
        debug!(fd, ?interest, "reactor add");
        Ok(())
    }

    /// Change the interest of a registered descriptor.
    pub fn set(&self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        match self.inner.borrow_mut().sources.get_mut(&fd) {
            Some(source) => {
                source.interest = interest;
                Ok(())
            }
            None => Err(Errno::ENOENT),
        }
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.inner.borrow().sources.get(&fd).map(|s| s.interest)
    }

    /// Remove `fd`; returns false if it was not registered.
    pub fn remove(&self, fd: RawFd) -> bool {
        let removed = self.inner.borrow_mut().sources.remove(&fd);
        if removed.is_some() {
            debug!(fd, "reactor remove");
        }
        removed.is_some()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.inner.borrow().sources.contains_key(&fd)
    }

    /// Number of registered descriptors.
    pub fn event_num(&self) -> usize {
        self.inner.borrow().sources.len()
    }

    /// Install an exit predicate. Each predicate may adjust the live event
    /// count; returning false vetoes exit for this iteration.
    pub fn set_exit_condition<F>(&self, tag: ExitTag, predicate: F)
    where
        F: Fn(&ReactorHandle, &mut usize) -> bool + 'static,
    {
        self.inner
            .borrow_mut()
            .exit_conditions
            .insert(tag, Rc::new(predicate));
    }

    pub fn remove_exit_condition(&self, tag: ExitTag) {
        self.inner.borrow_mut().exit_conditions.remove(&tag);
    }

    /// Register a callback run exactly once when the reactor is dropped.
    pub fn add_destroy_callback<F>(&self, f: F)
    where
        F: FnOnce(&ReactorHandle) + 'static,
    {
        self.inner.borrow_mut().destroy.push(Box::new(f));
    }

    pub fn set_end_hook<F>(&self, tag: EndHook, f: F)
    where
        F: Fn(&ReactorHandle) + 'static,
    {
        self.inner.borrow_mut().end_hooks.insert(tag, Rc::new(f));
    }

    pub fn remove_end_hook(&self, tag: EndHook) {
        self.inner.borrow_mut().end_hooks.remove(&tag);
    }

    /// Run `f` at the end of the current iteration.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce(&ReactorHandle) + 'static,
    {
        self.inner.borrow_mut().defers.push_back(Box::new(f));
    }

    /// One-shot timer.
    pub fn add_timer<F>(&self, after: Duration, f: F) -> TimerId
    where
        F: FnOnce(&ReactorHandle) + 'static,
    {
        self.insert_timer(after, None, false, once(f))
    }

    /// One-shot timer that does not keep the loop alive.
    pub fn add_detached_timer<F>(&self, after: Duration, f: F) -> TimerId
    where
        F: FnOnce(&ReactorHandle) + 'static,
    {
        self.insert_timer(after, None, true, once(f))
    }

    /// Periodic timer, first firing after `every`.
    pub fn add_interval<F>(&self, every: Duration, f: F) -> TimerId
    where
        F: FnMut(&ReactorHandle) + 'static,
    {
        let every = every.max(Duration::from_millis(1));
        self.insert_timer(every, Some(every), false, Box::new(f))
    }

    fn insert_timer(
        &self,
        after: Duration,
        interval: Option<Duration>,
        detached: bool,
        callback: TimerCallback,
    ) -> TimerId {
        self.inner
            .borrow_mut()
            .timers
            .insert(Instant::now() + after, interval, detached, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.borrow_mut().timers.cancel(id)
    }

    pub fn timer_num(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    /// Ask the loop to return after the current iteration.
    pub fn stop(&self) {
        self.set_running(false);
    }

    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    fn set_running(&self, running: bool) {
        self.inner.borrow_mut().running = running;
    }

    fn should_exit(&self) -> bool {
        let (mut event_num, busy, predicates) = {
            let inner = self.inner.borrow();
            (
                inner.sources.len(),
                inner.timers.attached() > 0 || !inner.defers.is_empty(),
                inner.exit_conditions.values().cloned().collect::<Vec<_>>(),
            )
        };
        if busy {
            return false;
        }
        for predicate in predicates {
            if !predicate(self, &mut event_num) {
                return false;
            }
        }
        event_num == 0
    }

    fn step(&self, cap: Option<Duration>) -> Result<usize, Errno> {
        let (interests, wait) = {
            let mut inner = self.inner.borrow_mut();
            let wait = inner.wait_time(cap);
            let interests: Vec<(RawFd, PollFlags)> = inner
                .sources
                .iter()
                .map(|(fd, s)| (*fd, s.interest.poll_flags()))
                .collect();
            (interests, wait)
        };

        let mut ready = Vec::new();
        {
            // SAFETY: sources are removed before their descriptors are closed.
            let mut fds: Vec<PollFd<'_>> = interests
                .iter()
                .map(|(fd, flags)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *flags))
                .collect();
            match poll(&mut fds, poll_timeout(wait)) {
                Ok(0) => {}
                Ok(_) => {
                    for (pfd, (fd, _)) in fds.iter().zip(&interests) {
                        let Some(revents) = pfd.revents() else {
                            continue;
                        };
                        if revents.contains(PollFlags::POLLNVAL) {
                            warn!(fd = *fd, "descriptor closed while registered, removing");
                            self.inner.borrow_mut().sources.remove(fd);
                            continue;
                        }
                        if !revents.is_empty() {
                            ready.push((*fd, Interest::from_revents(revents)));
                        }
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno),
            }
        }

        let events = ready.len();
        for (fd, ready) in ready {
            let handler = self
                .inner
                .borrow()
                .sources
                .get(&fd)
                .map(|s| s.handler.clone());
            if let Some(handler) = handler {
                handler(self, fd, ready);
            }
        }

        self.expire_timers();
        self.end_stage();
        Ok(events)
    }

    fn expire_timers(&self) {
        let now = Instant::now();
        loop {
            let expired = self.inner.borrow_mut().timers.pop_expired(now);
            let Some((id, mut callback)) = expired else {
                break;
            };
            callback(self);
            self.inner
                .borrow_mut()
                .timers
                .restore(id, callback, Instant::now());
        }
    }

    fn end_stage(&self) {
        let defers = std::mem::take(&mut self.inner.borrow_mut().defers);
        for f in defers {
            f(self);
        }
        let hooks: Vec<_> = self.inner.borrow().end_hooks.values().cloned().collect();
        for hook in hooks {
            hook(self);
        }
    }

    fn teardown(&self) {
        let callbacks = std::mem::take(&mut self.inner.borrow_mut().destroy);
        for callback in callbacks {
            callback(self);
        }
        // Handlers commonly capture handles; drop them outside the borrow.
        let (sources, defers, hooks, conditions) = {
            let mut inner = self.inner.borrow_mut();
            inner.timers.clear();
            (
                std::mem::take(&mut inner.sources),
                std::mem::take(&mut inner.defers),
                std::mem::take(&mut inner.end_hooks),
                std::mem::take(&mut inner.exit_conditions),
            )
        };
        drop((sources, defers, hooks, conditions));
    }
}

fn once<F>(f: F) -> TimerCallback
where
    F: FnOnce(&ReactorHandle) + 'static,
{
    let mut f = Some(f);
    Box::new(move |h| {
        if let Some(f) = f.take() {
            f(h)
        }
    })
}

fn poll_timeout(wait: Duration) -> PollTimeout {
    let ms = wait.as_millis().min(u16::MAX as u128) as u16;
    // Round sub-millisecond waits up so timers are not spun on.
    let ms = if ms == 0 && !wait.is_zero() { 1 } else { ms };
    PollTimeout::from(ms)
}

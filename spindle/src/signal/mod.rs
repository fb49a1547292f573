//! Signal delivery bridged into the reactor.
//!
//! A [`SignalBridge`] is the per-process signal context: it owns the handler
//! table, the backend selection and the backend state. Handlers always run on
//! the reactor thread, never in signal context.
//!
//! # Backends
//!
//! | Backend | Delivery |
//! |---------|----------|
//! | [`SignalBackend::SignalFd`] | signals are blocked and read from a descriptor registered with the reactor |
//! | [`SignalBackend::Kqueue`] | `EVFILT_SIGNAL` events on a kqueue registered with the reactor |
//! | [`SignalBackend::Classic`] | a `sigaction` handler sets a flag, the reactor dispatches at the end of each iteration |
//!
//! The backend is an explicit choice ([`BackendChoice`]); `Auto` picks the
//! platform's native one. Signals registered before the bridge is bound to a
//! reactor, signals on a backend whose setup fails, and `SIGCHLD` under kqueue
//! all go through the classic backend.
//!
//! Kernel-queue blocking applies to the registering thread and to threads it
//! spawns afterwards, so register process signals before spawning workers.
//!
//! # Example
//!
//! ```no_run
//! use spindle::reactor::Reactor;
//! use spindle::signal::{BackendChoice, SafetyMode, SignalBridge};
//!
//! let reactor = Reactor::new();
//! let bridge = SignalBridge::new(BackendChoice::Auto);
//! bridge.bind_to_reactor(&reactor.handle());
//! bridge
//!     .register(nix::libc::SIGTERM, |_| println!("terminating"), SafetyMode::Safe)
//!     .unwrap();
//! reactor.run();
//! ```

mod classic;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(target_os = "linux")]
mod signalfd;

pub use classic::SIGNO_MAX;

use crate::error::SignalError;
use crate::reactor::{EndHook, ExitTag, Interest, ReactorHandle};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Handler invoked with the signal number.
pub type SignalHandler = Rc<dyn Fn(i32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalBackend {
    SignalFd,
    Kqueue,
    Classic,
}

impl SignalBackend {
    /// The preferred backend of the running platform.
    pub fn native() -> Self {
        if cfg!(target_os = "linux") {
            SignalBackend::SignalFd
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            SignalBackend::Kqueue
        } else {
            SignalBackend::Classic
        }
    }

    pub fn is_available(self) -> bool {
        self == SignalBackend::Classic || self == Self::native()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Force(SignalBackend),
}

/// How a handler may be delivered.
///
/// Neither mode runs handler code in signal context; they differ in who may
/// trigger the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyMode {
    /// Delivered only at the reactor's safe point: the end of a loop
    /// iteration or the signal descriptor's readiness callback. Until the
    /// bridge is bound and the loop turns, the signal stays pending.
    Safe,
    /// Also delivered whenever the owner calls
    /// [`SignalBridge::dispatch_pending`], so it works before any reactor
    /// exists. Nested deliveries of a signal whose handler is still running
    /// are discarded.
    Simple,
}

struct Registration {
    handler: SignalHandler,
    backend: SignalBackend,
    mode: SafetyMode,
}

struct BridgeInner {
    table: Vec<Option<Registration>>,
    running: Vec<bool>,
    backend: SignalBackend,
    reactor: Option<ReactorHandle>,
    #[cfg(target_os = "linux")]
    signalfd: Option<signalfd::SignalFdState>,
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    kqueue: Option<kqueue::KqueueState>,
}

pub struct SignalBridge {
    inner: RefCell<BridgeInner>,
    this: Weak<SignalBridge>,
}

impl fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let active: Vec<usize> = (0..SIGNO_MAX)
            .filter(|i| inner.table[*i].is_some())
            .collect();
        f.debug_struct("SignalBridge")
            .field("backend", &inner.backend)
            .field("active", &active)
            .finish()
    }
}

fn validate(signo: i32) -> Result<Signal, SignalError> {
    if signo <= 0 || signo as usize >= SIGNO_MAX {
        return Err(SignalError::InvalidSigno(signo));
    }
    let signal = Signal::try_from(signo).map_err(|_| SignalError::InvalidSigno(signo))?;
    if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
        return Err(SignalError::InvalidSigno(signo));
    }
    Ok(signal)
}

impl SignalBridge {
    pub fn new(choice: BackendChoice) -> Rc<Self> {
        let backend = match choice {
            BackendChoice::Auto => SignalBackend::native(),
            BackendChoice::Force(backend) if backend.is_available() => backend,
            BackendChoice::Force(backend) => {
                warn!(?backend, "signal backend unavailable on this platform, using classic");
                SignalBackend::Classic
            }
        };
        Rc::new_cyclic(|this| SignalBridge {
            inner: RefCell::new(BridgeInner {
                table: (0..SIGNO_MAX).map(|_| None).collect(),
                running: vec![false; SIGNO_MAX],
                backend,
                reactor: None,
                #[cfg(target_os = "linux")]
                signalfd: None,
                #[cfg(any(
                    target_os = "macos",
                    target_os = "ios",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd",
                    target_os = "dragonfly"
                ))]
                kqueue: None,
            }),
            this: this.clone(),
        })
    }

    /// Backend used for reactor-bound registrations.
    pub fn backend(&self) -> SignalBackend {
        self.inner.borrow().backend
    }

    /// Backend an active registration was routed through.
    pub fn backend_of(&self, signo: i32) -> Option<SignalBackend> {
        let index = usize::try_from(signo).ok()?;
        let inner = self.inner.borrow();
        inner.table.get(index)?.as_ref().map(|r| r.backend)
    }

    pub fn mode_of(&self, signo: i32) -> Option<SafetyMode> {
        let index = usize::try_from(signo).ok()?;
        let inner = self.inner.borrow();
        inner.table.get(index)?.as_ref().map(|r| r.mode)
    }

    /// Attach to a reactor: classic flags are scanned at the end of every
    /// iteration, and later registrations use the selected backend.
    pub fn bind_to_reactor(&self, reactor: &ReactorHandle) {
        let this = self.this.clone();
        reactor.set_end_hook(EndHook::Signal, move |_| {
            if let Some(bridge) = this.upgrade() {
                bridge.dispatch_flagged(true);
            }
        });
        self.inner.borrow_mut().reactor = Some(reactor.clone());
    }

    /// Install `handler` for `signo`, returning the handler it replaces.
    pub fn register<F>(
        &self,
        signo: i32,
        handler: F,
        mode: SafetyMode,
    ) -> Result<Option<SignalHandler>, SignalError>
    where
        F: Fn(i32) + 'static,
    {
        let signal = validate(signo)?;
        let handler: SignalHandler = Rc::new(handler);
        let index = signo as usize;

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(reg) = inner.table[index].as_mut() {
                // Already routed; swap the handler without touching the disposition.
                let previous = std::mem::replace(&mut reg.handler, handler);
                reg.mode = mode;
                return Ok(Some(previous));
            }
        }

        let wanted = self.pick_backend(signal);
        let backend = match self.activate(signal, wanted) {
            Ok(()) => wanted,
            Err(errno) if wanted != SignalBackend::Classic => {
                warn!(signo, ?wanted, %errno, "signal backend setup failed, falling back to classic");
                classic::install(signal).map_err(SignalError::Backend)?;
                SignalBackend::Classic
            }
            Err(errno) => return Err(SignalError::Backend(errno)),
        };
        debug!(signo, ?backend, "signal registered");
        self.inner.borrow_mut().table[index] = Some(Registration {
            handler,
            backend,
            mode,
        });
        Ok(None)
    }

    /// Remove the handler for `signo` and restore the default disposition.
    ///
    /// Returns `None` if nothing was registered, so repeated calls are no-ops.
    pub fn unregister(&self, signo: i32) -> Option<SignalHandler> {
        let signal = match validate(signo) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(%e, "unregister ignored");
                return None;
            }
        };
        let reg = self.inner.borrow_mut().table[signo as usize].take()?;
        if let Err(errno) = self.deactivate(signal, reg.backend) {
            warn!(signo, %errno, "failed to restore signal disposition");
        }
        debug!(signo, "signal unregistered");
        Some(reg.handler)
    }

    /// Unregister every signal and release backend resources.
    pub fn clear(&self) {
        for signo in 1..SIGNO_MAX as i32 {
            let active = self.inner.borrow().table[signo as usize].is_some();
            if active {
                self.unregister(signo);
            }
        }
        let reactor = self.inner.borrow().reactor.clone();
        #[cfg(target_os = "linux")]
        {
            let state = self.inner.borrow_mut().signalfd.take();
            if let (Some(state), Some(reactor)) = (state, reactor.as_ref()) {
                reactor.remove(state.raw_fd());
                reactor.remove_exit_condition(ExitTag::SignalFd);
            }
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            let state = self.inner.borrow_mut().kqueue.take();
            if let (Some(state), Some(reactor)) = (state, reactor.as_ref()) {
                reactor.remove(state.raw_fd());
                reactor.remove_exit_condition(ExitTag::SignalFd);
            }
        }
        if let Some(reactor) = reactor {
            reactor.remove_end_hook(EndHook::Signal);
        }
    }

    /// Invoke [`SafetyMode::Simple`] handlers of signals flagged by the
    /// classic backend since the last call. Flags of [`SafetyMode::Safe`]
    /// registrations are left set for the reactor's safe point.
    pub fn dispatch_pending(&self) {
        self.dispatch_flagged(false);
    }

    fn dispatch_flagged(&self, safe_point: bool) {
        if !classic::take_pending() {
            return;
        }
        for signo in 1..SIGNO_MAX {
            if !classic::take(signo) {
                continue;
            }
            if !safe_point && self.mode_of(signo as i32) == Some(SafetyMode::Safe) {
                classic::requeue(signo);
                continue;
            }
            self.invoke(signo as i32);
        }
    }

    fn invoke(&self, signo: i32) {
        let Some(index) = usize::try_from(signo).ok().filter(|i| *i < SIGNO_MAX) else {
            warn!(signo, "invalid signal number delivered");
            return;
        };
        let handler = {
            let inner = &mut *self.inner.borrow_mut();
            if inner.running[index] {
                debug!(signo, "nested signal delivery discarded");
                return;
            }
            match inner.table[index].as_ref() {
                Some(reg) => {
                    inner.running[index] = true;
                    reg.handler.clone()
                }
                None => {
                    warn!(signo, "received unregistered signal");
                    return;
                }
            }
        };
        handler(signo);
        self.inner.borrow_mut().running[index] = false;
    }

    fn pick_backend(&self, signal: Signal) -> SignalBackend {
        let inner = self.inner.borrow();
        if inner.reactor.is_none() {
            return SignalBackend::Classic;
        }
        match inner.backend {
            // Filtering SIGCHLD breaks child reaping on these platforms.
            SignalBackend::Kqueue if signal == Signal::SIGCHLD => SignalBackend::Classic,
            backend => backend,
        }
    }

    fn activate(&self, signal: Signal, backend: SignalBackend) -> Result<(), nix::errno::Errno> {
        match backend {
            SignalBackend::Classic => classic::install(signal),
            #[cfg(target_os = "linux")]
            SignalBackend::SignalFd => {
                self.ensure_signalfd()?;
                match self.inner.borrow_mut().signalfd.as_mut() {
                    Some(state) => state.add(signal),
                    None => Err(nix::errno::Errno::EBADF),
                }
            }
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            SignalBackend::Kqueue => {
                self.ensure_kqueue()?;
                match self.inner.borrow().kqueue.as_ref() {
                    Some(state) => state.add(signal),
                    None => Err(nix::errno::Errno::EBADF),
                }
            }
            #[allow(unreachable_patterns)]
            _ => Err(nix::errno::Errno::ENOSYS),
        }
    }

    fn deactivate(&self, signal: Signal, backend: SignalBackend) -> Result<(), nix::errno::Errno> {
        match backend {
            SignalBackend::Classic => classic::restore_default(signal),
            #[cfg(target_os = "linux")]
            SignalBackend::SignalFd => match self.inner.borrow_mut().signalfd.as_mut() {
                Some(state) => state.remove(signal),
                None => Ok(()),
            },
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            SignalBackend::Kqueue => match self.inner.borrow().kqueue.as_ref() {
                Some(state) => state.remove(signal),
                None => Ok(()),
            },
            #[allow(unreachable_patterns)]
            _ => Ok(()),
        }
    }

    fn deliver_all(&self, signals: Vec<i32>) {
        for signo in signals {
            self.invoke(signo);
        }
    }

    #[cfg(target_os = "linux")]
    fn ensure_signalfd(&self) -> Result<(), nix::errno::Errno> {
        if self.inner.borrow().signalfd.is_some() {
            return Ok(());
        }
        let Some(reactor) = self.inner.borrow().reactor.clone() else {
            return Err(nix::errno::Errno::ENODEV);
        };
        let state = signalfd::SignalFdState::new()?;
        let fd = state.raw_fd();
        let creator = state.creator();

        let this = self.this.clone();
        reactor.add(fd, Interest::READABLE, move |_, _, _| {
            if let Some(bridge) = this.upgrade() {
                let signals = match bridge.inner.borrow_mut().signalfd.as_mut() {
                    Some(state) => state.read(),
                    None => Vec::new(),
                };
                bridge.deliver_all(signals);
            }
        })?;
        // The notification descriptor alone never keeps the loop alive.
        reactor.set_exit_condition(ExitTag::SignalFd, |_, events| {
            *events = events.saturating_sub(1);
            true
        });
        reactor.add_destroy_callback(move |h| {
            if nix::unistd::getpid() == creator {
                h.remove(fd);
            }
        });
        self.inner.borrow_mut().signalfd = Some(state);
        Ok(())
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    fn ensure_kqueue(&self) -> Result<(), nix::errno::Errno> {
        if self.inner.borrow().kqueue.is_some() {
            return Ok(());
        }
        let Some(reactor) = self.inner.borrow().reactor.clone() else {
            return Err(nix::errno::Errno::ENODEV);
        };
        let state = kqueue::KqueueState::new()?;
        let fd = state.raw_fd();
        let this = self.this.clone();
        reactor.add(fd, Interest::READABLE, move |_, _, _| {
            if let Some(bridge) = this.upgrade() {
                let signals = match bridge.inner.borrow().kqueue.as_ref() {
                    Some(state) => state.read(),
                    None => Vec::new(),
                };
                bridge.deliver_all(signals);
            }
        })?;
        reactor.set_exit_condition(ExitTag::SignalFd, |_, events| {
            *events = events.saturating_sub(1);
            true
        });
        let creator = nix::unistd::getpid();
        reactor.add_destroy_callback(move |h| {
            if nix::unistd::getpid() == creator {
                h.remove(fd);
            }
        });
        self.inner.borrow_mut().kqueue = Some(state);
        Ok(())
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use nix::sys::signal::raise;
    use serial_test::serial;
    use std::cell::Cell;
    use std::time::Duration;

    fn counter() -> (Rc<Cell<u32>>, impl Fn(i32) + 'static) {
        let hits = Rc::new(Cell::new(0));
        let sink = hits.clone();
        (hits, move |_| sink.set(sink.get() + 1))
    }

    #[test]
    #[serial]
    fn test_rejects_out_of_range_signo() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        for signo in [0, -1, SIGNO_MAX as i32, 4096] {
            assert_eq!(
                bridge.register(signo, |_| {}, SafetyMode::Safe).err(),
                Some(SignalError::InvalidSigno(signo))
            );
        }
        assert!(bridge.unregister(0).is_none());
    }

    #[test]
    #[serial]
    fn test_unregister_twice_is_noop() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        bridge
            .register(nix::libc::SIGUSR1, |_| {}, SafetyMode::Safe)
            .unwrap();
        assert!(bridge.unregister(nix::libc::SIGUSR1).is_some());
        assert!(bridge.unregister(nix::libc::SIGUSR1).is_none());
    }

    #[test]
    #[serial]
    fn test_reregister_returns_previous_handler() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        let (first_hits, first) = counter();
        let (second_hits, second) = counter();
        assert!(
            bridge
                .register(nix::libc::SIGUSR1, first, SafetyMode::Safe)
                .unwrap()
                .is_none()
        );
        let previous = bridge
            .register(nix::libc::SIGUSR1, second, SafetyMode::Simple)
            .unwrap()
            .unwrap();
        previous(nix::libc::SIGUSR1);
        assert_eq!(first_hits.get(), 1);
        assert_eq!(second_hits.get(), 0);
        assert_eq!(bridge.mode_of(nix::libc::SIGUSR1), Some(SafetyMode::Simple));
    }

    #[test]
    #[serial]
    fn test_classic_flag_dispatched_once() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        let (hits, handler) = counter();
        bridge
            .register(nix::libc::SIGUSR1, handler, SafetyMode::Simple)
            .unwrap();
        assert_eq!(bridge.backend_of(nix::libc::SIGUSR1), Some(SignalBackend::Classic));

        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(hits.get(), 0);
        bridge.dispatch_pending();
        assert_eq!(hits.get(), 1);
        bridge.dispatch_pending();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    #[serial]
    fn test_unregistered_signal_is_only_logged() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        classic::requeue(nix::libc::SIGUSR2 as usize);
        bridge.dispatch_pending();
        assert!(bridge.backend_of(nix::libc::SIGUSR2).is_none());
    }

    #[test]
    #[serial]
    fn test_classic_dispatch_at_reactor_safe_point() {
        let reactor = Reactor::new();
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        bridge.bind_to_reactor(&reactor.handle());
        let (hits, handler) = counter();
        bridge
            .register(nix::libc::SIGUSR2, handler, SafetyMode::Safe)
            .unwrap();
        raise(Signal::SIGUSR2).unwrap();
        reactor.run_once(Duration::from_millis(1)).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    #[serial]
    fn test_safe_handler_waits_for_safe_point() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        let (simple_hits, simple) = counter();
        let (safe_hits, safe) = counter();
        bridge
            .register(nix::libc::SIGUSR1, simple, SafetyMode::Simple)
            .unwrap();
        bridge
            .register(nix::libc::SIGUSR2, safe, SafetyMode::Safe)
            .unwrap();

        raise(Signal::SIGUSR1).unwrap();
        raise(Signal::SIGUSR2).unwrap();
        bridge.dispatch_pending();
        assert_eq!(simple_hits.get(), 1);
        assert_eq!(safe_hits.get(), 0);
        // Still pending, not lost.
        bridge.dispatch_pending();
        assert_eq!(safe_hits.get(), 0);

        let reactor = Reactor::new();
        bridge.bind_to_reactor(&reactor.handle());
        reactor.run_once(Duration::from_millis(1)).unwrap();
        assert_eq!(safe_hits.get(), 1);
        assert_eq!(simple_hits.get(), 1);
        bridge.clear();
    }

    #[test]
    #[serial]
    fn test_unbound_bridge_uses_classic() {
        let bridge = SignalBridge::new(BackendChoice::Auto);
        bridge
            .register(nix::libc::SIGUSR1, |_| {}, SafetyMode::Simple)
            .unwrap();
        assert_eq!(bridge.backend_of(nix::libc::SIGUSR1), Some(SignalBackend::Classic));
    }

    #[test]
    #[serial]
    fn test_nested_delivery_discarded() {
        let bridge = SignalBridge::new(BackendChoice::Force(SignalBackend::Classic));
        let hits = Rc::new(Cell::new(0));
        let sink = hits.clone();
        let weak = Rc::downgrade(&bridge);
        bridge
            .register(
                nix::libc::SIGUSR1,
                move |signo| {
                    sink.set(sink.get() + 1);
                    if let Some(bridge) = weak.upgrade() {
                        bridge.invoke(signo);
                    }
                },
                SafetyMode::Simple,
            )
            .unwrap();
        bridge.invoke(nix::libc::SIGUSR1);
        assert_eq!(hits.get(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial]
    fn test_signalfd_delivers_inside_loop() {
        let reactor = Reactor::new();
        let bridge = SignalBridge::new(BackendChoice::Auto);
        assert_eq!(bridge.backend(), SignalBackend::SignalFd);
        bridge.bind_to_reactor(&reactor.handle());
        let (hits, handler) = counter();
        bridge
            .register(nix::libc::SIGUSR2, handler, SafetyMode::Safe)
            .unwrap();
        assert_eq!(bridge.backend_of(nix::libc::SIGUSR2), Some(SignalBackend::SignalFd));

        // Only the signal descriptor is registered, and it does not count.
        assert_eq!(reactor.run(), 0);

        raise(Signal::SIGUSR2).unwrap();
        reactor.run_once(Duration::from_millis(100)).unwrap();
        assert_eq!(hits.get(), 1);
        bridge.clear();
        assert_eq!(reactor.event_num(), 0);
    }
}

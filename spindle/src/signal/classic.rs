//! Classic `sigaction` backend.
//!
//! The installed handler only flips atomic flags. Everything else happens on
//! the reactor thread when the bridge scans the triggered set.

use nix::errno::Errno;
use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive upper bound of signal numbers the bridge accepts.
pub const SIGNO_MAX: usize = 128;

// Written from signal context; must stay lock-free and allocation-free.
static TRIGGERED: [AtomicBool; SIGNO_MAX] = [const { AtomicBool::new(false) }; SIGNO_MAX];
static PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signo: c_int) {
    let index = signo as usize;
    if index < SIGNO_MAX {
        TRIGGERED[index].store(true, Ordering::Relaxed);
        PENDING.store(true, Ordering::Release);
    }
}

pub(crate) fn install(signal: Signal) -> Result<(), Errno> {
    set_disposition(signal, SigHandler::Handler(on_signal))
}

pub(crate) fn ignore(signal: Signal) -> Result<(), Errno> {
    set_disposition(signal, SigHandler::SigIgn)
}

pub(crate) fn restore_default(signal: Signal) -> Result<(), Errno> {
    set_disposition(signal, SigHandler::SigDfl)
}

fn set_disposition(signal: Signal, handler: SigHandler) -> Result<(), Errno> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: `on_signal` only touches atomics.
    unsafe { sigaction(signal, &action) }.map(|_| ())
}

/// Consume the "something fired" flag.
pub(crate) fn take_pending() -> bool {
    PENDING.swap(false, Ordering::AcqRel)
}

pub(crate) fn take(signo: usize) -> bool {
    TRIGGERED[signo].swap(false, Ordering::AcqRel)
}

/// Set the flag of `signo` again so a later scan picks it up.
pub(crate) fn requeue(signo: usize) {
    on_signal(signo as c_int);
}

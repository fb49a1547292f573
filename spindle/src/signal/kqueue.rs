//! Event-queue-filter backend (`EVFILT_SIGNAL`).
//!
//! The kqueue descriptor is itself registered with the reactor; it turns
//! readable when a filtered signal fires. Each event carries the signal
//! number back as its user data.

use super::classic;
use nix::errno::Errno;
use nix::libc::timespec;
use nix::sys::event::{EvFlags, EventFilter, FilterFlag, KEvent, Kqueue};
use nix::sys::signal::Signal;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use tracing::warn;

const ZERO: timespec = timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

pub(crate) struct KqueueState {
    kq: Kqueue,
}

impl KqueueState {
    pub(crate) fn new() -> Result<Self, Errno> {
        Ok(Self { kq: Kqueue::new()? })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.kq.as_fd().as_raw_fd()
    }

    pub(crate) fn add(&self, signal: Signal) -> Result<(), Errno> {
        self.change(signal, EvFlags::EV_ADD | EvFlags::EV_ENABLE)?;
        // The filter observes the signal even while it is ignored.
        classic::ignore(signal)
    }

    pub(crate) fn remove(&self, signal: Signal) -> Result<(), Errno> {
        self.change(signal, EvFlags::EV_DELETE)?;
        classic::restore_default(signal)
    }

    fn change(&self, signal: Signal, flags: EvFlags) -> Result<(), Errno> {
        let signo = signal as i32;
        let event = KEvent::new(
            signo as usize,
            EventFilter::EVFILT_SIGNAL,
            flags,
            FilterFlag::empty(),
            0,
            signo as isize,
        );
        self.kq.kevent(&[event], &mut [], Some(ZERO)).map(|_| ())
    }

    pub(crate) fn read(&self) -> Vec<i32> {
        let empty = KEvent::new(
            0,
            EventFilter::EVFILT_SIGNAL,
            EvFlags::empty(),
            FilterFlag::empty(),
            0,
            0,
        );
        let mut events = [empty; 16];
        match self.kq.kevent(&[], &mut events, Some(ZERO)) {
            Ok(n) => events[..n].iter().map(|ev| ev.udata() as i32).collect(),
            Err(errno) => {
                warn!(%errno, "kevent read failed");
                Vec::new()
            }
        }
    }
}

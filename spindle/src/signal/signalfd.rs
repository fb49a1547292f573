//! Kernel signal queue backend (Linux `signalfd`).

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::{Pid, getpid};
use std::os::fd::{AsRawFd, RawFd};
use tracing::warn;

pub(crate) struct SignalFdState {
    fd: SignalFd,
    mask: SigSet,
    creator: Pid,
}

impl SignalFdState {
    pub(crate) fn new() -> Result<Self, Errno> {
        let mask = SigSet::empty();
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(Self {
            fd,
            mask,
            creator: getpid(),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn creator(&self) -> Pid {
        self.creator
    }

    /// Route `signal` through the descriptor and block its default delivery
    /// on the calling thread.
    pub(crate) fn add(&mut self, signal: Signal) -> Result<(), Errno> {
        let mut mask = self.mask;
        mask.add(signal);
        self.fd.set_mask(&mask)?;
        single(signal).thread_block()?;
        self.mask = mask;
        Ok(())
    }

    pub(crate) fn remove(&mut self, signal: Signal) -> Result<(), Errno> {
        let mut mask = self.mask;
        mask.remove(signal);
        self.fd.set_mask(&mask)?;
        self.mask = mask;
        single(signal).thread_unblock()
    }

    /// Drain every queued notification.
    pub(crate) fn read(&mut self) -> Vec<i32> {
        let mut signals = Vec::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => signals.push(info.ssi_signo as i32),
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    warn!(%errno, "signalfd read failed");
                    break;
                }
            }
        }
        signals
    }
}

fn single(signal: Signal) -> SigSet {
    let mut set = SigSet::empty();
    set.add(signal);
    set
}

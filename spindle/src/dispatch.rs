//! Worker selection for inbound connections and packets.
//!
//! [`Dispatcher::select_worker`] is called on the reactor thread for every
//! connect, receive, close and datagram event. The outcome is always a worker
//! id in `[0, worker_num)` or an explicit [`DispatchOutcome::Discard`] /
//! [`DispatchOutcome::Close`].

use crate::connection::SessionId;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    RoundRobin,
    #[default]
    FdMod,
    /// Lowest live concurrency wins, lowest id on ties.
    LeastBusy,
    IpMod,
    /// uid modulo, fd modulo until a uid is bound.
    UidMod,
    /// Least-busy on connect, then pinned for the connection's lifetime.
    CoConnLb,
    /// Least-busy for every request.
    CoReqLb,
}

impl DispatchMode {
    /// Numeric codes as used by configuration files.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => DispatchMode::RoundRobin,
            2 => DispatchMode::FdMod,
            3 => DispatchMode::LeastBusy,
            4 => DispatchMode::IpMod,
            5 => DispatchMode::UidMod,
            8 => DispatchMode::CoConnLb,
            9 => DispatchMode::CoReqLb,
            _ => return None,
        })
    }

    /// Whether every event of a connection lands on the same worker.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            DispatchMode::FdMod | DispatchMode::IpMod | DispatchMode::UidMod | DispatchMode::CoConnLb
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    Connect,
    Receive,
    Close,
    Packet,
}

/// What a dispatch decision can see.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub event: DispatchEvent,
    pub fd: RawFd,
    pub session_id: SessionId,
    /// 0 while unbound.
    pub uid: u32,
    pub ip_hash: u32,
    /// Worker the connection was last routed to.
    pub pinned: Option<u32>,
    pub data: Option<&'a [u8]>,
}

/// Result of a user dispatch function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    Worker(u32),
    Discard,
    Close,
    /// Use the configured mode.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Worker(u32),
    Discard,
    Close,
}

pub type DispatchFn = dyn Fn(&DispatchContext<'_>, u32) -> DispatchDecision + Send + Sync;

/// Live load of the event workers.
pub trait WorkerLoad {
    fn concurrency(&self, worker_id: u32) -> u32;
}

impl<const N: usize> WorkerLoad for [u32; N] {
    fn concurrency(&self, worker_id: u32) -> u32 {
        self.get(worker_id as usize).copied().unwrap_or(u32::MAX)
    }
}

impl WorkerLoad for Vec<u32> {
    fn concurrency(&self, worker_id: u32) -> u32 {
        self.get(worker_id as usize).copied().unwrap_or(u32::MAX)
    }
}

pub struct Dispatcher {
    mode: DispatchMode,
    worker_num: u32,
    func: Option<Arc<DispatchFn>>,
    cursor: Cell<u32>,
}

impl Dispatcher {
    /// `worker_num` must be non-zero; configuration validation guarantees it.
    pub fn new(mode: DispatchMode, worker_num: u32, func: Option<Arc<DispatchFn>>) -> Self {
        Self {
            mode,
            worker_num: worker_num.max(1),
            func,
            cursor: Cell::new(0),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Whether connect/close events go to workers.
    pub fn delivers_connection_events(&self, enable_unsafe_event: bool) -> bool {
        self.func.is_some() || self.mode.is_stable() || enable_unsafe_event
    }

    pub fn select_worker(&self, ctx: &DispatchContext<'_>, load: &dyn WorkerLoad) -> DispatchOutcome {
        if let Some(func) = &self.func {
            let decision = catch_unwind(AssertUnwindSafe(|| func(ctx, self.worker_num)));
            match decision {
                Ok(DispatchDecision::Worker(id)) if id < self.worker_num => {
                    return DispatchOutcome::Worker(id);
                }
                Ok(DispatchDecision::Worker(id)) => {
                    warn!(worker_id = id, worker_num = self.worker_num, "invalid target worker-id");
                }
                Ok(DispatchDecision::Discard) => return DispatchOutcome::Discard,
                Ok(DispatchDecision::Close) => return DispatchOutcome::Close,
                Ok(DispatchDecision::Fallback) => {}
                Err(_) => {
                    warn!(session_id = ctx.session_id, "dispatch function panicked, using fallback");
                }
            }
        }
        DispatchOutcome::Worker(self.by_mode(ctx, load))
    }

    fn by_mode(&self, ctx: &DispatchContext<'_>, load: &dyn WorkerLoad) -> u32 {
        let n = self.worker_num;
        match self.mode {
            DispatchMode::RoundRobin => {
                let id = self.cursor.get() % n;
                self.cursor.set(self.cursor.get().wrapping_add(1));
                id
            }
            DispatchMode::FdMod => fd_mod(ctx.fd, n),
            DispatchMode::IpMod => ctx.ip_hash % n,
            DispatchMode::UidMod if ctx.uid != 0 => ctx.uid % n,
            DispatchMode::UidMod => fd_mod(ctx.fd, n),
            DispatchMode::LeastBusy | DispatchMode::CoReqLb => self.least_busy(load),
            DispatchMode::CoConnLb => match ctx.pinned {
                Some(id) if id < n && ctx.event != DispatchEvent::Connect => id,
                _ => self.least_busy(load),
            },
        }
    }

    fn least_busy(&self, load: &dyn WorkerLoad) -> u32 {
        (0..self.worker_num)
            .min_by_key(|id| (load.concurrency(*id), *id))
            .unwrap_or(0)
    }
}

fn fd_mod(fd: RawFd, n: u32) -> u32 {
    fd.unsigned_abs() % n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(event: DispatchEvent, fd: RawFd) -> DispatchContext<'static> {
        DispatchContext {
            event,
            fd,
            session_id: fd as SessionId,
            uid: 0,
            ip_hash: 0,
            pinned: None,
            data: None,
        }
    }

    const IDLE: [u32; 4] = [0, 0, 0, 0];

    #[test]
    fn test_round_robin_sequence() {
        let d = Dispatcher::new(DispatchMode::RoundRobin, 4, None);
        let seq: Vec<_> = (0..8)
            .map(|fd| d.select_worker(&ctx(DispatchEvent::Connect, fd), &IDLE))
            .collect();
        let expected: Vec<_> = [0, 1, 2, 3, 0, 1, 2, 3]
            .into_iter()
            .map(DispatchOutcome::Worker)
            .collect();
        assert_eq!(seq, expected);
    }

    #[test]
    fn test_uid_mod_falls_back_to_fd_until_bound() {
        let d = Dispatcher::new(DispatchMode::UidMod, 4, None);
        let mut c = ctx(DispatchEvent::Receive, 6);
        assert_eq!(d.select_worker(&c, &IDLE), DispatchOutcome::Worker(2));
        c.uid = 13;
        assert_eq!(d.select_worker(&c, &IDLE), DispatchOutcome::Worker(1));
    }

    #[test]
    fn test_least_busy_ties_go_to_lowest_id() {
        let d = Dispatcher::new(DispatchMode::LeastBusy, 4, None);
        let load = [3u32, 1, 5, 1];
        assert_eq!(
            d.select_worker(&ctx(DispatchEvent::Receive, 1), &load),
            DispatchOutcome::Worker(1)
        );
    }

    #[test]
    fn test_co_conn_lb_pins_after_connect() {
        let d = Dispatcher::new(DispatchMode::CoConnLb, 3, None);
        let load = [2u32, 0, 1];
        let mut c = ctx(DispatchEvent::Connect, 9);
        assert_eq!(d.select_worker(&c, &load), DispatchOutcome::Worker(1));
        c.event = DispatchEvent::Receive;
        c.pinned = Some(2);
        assert_eq!(d.select_worker(&c, &load), DispatchOutcome::Worker(2));
    }

    #[test]
    fn test_user_function_sentinels_and_fallback() {
        let func: Arc<DispatchFn> = Arc::new(|c: &DispatchContext<'_>, _n: u32| match c.fd {
            1 => DispatchDecision::Discard,
            2 => DispatchDecision::Close,
            3 => DispatchDecision::Worker(99),
            4 => panic!("boom"),
            5 => DispatchDecision::Fallback,
            _ => DispatchDecision::Worker(0),
        });
        let d = Dispatcher::new(DispatchMode::FdMod, 4, Some(func));
        let pick = |fd| d.select_worker(&ctx(DispatchEvent::Receive, fd), &IDLE);
        assert_eq!(pick(1), DispatchOutcome::Discard);
        assert_eq!(pick(2), DispatchOutcome::Close);
        assert_eq!(pick(3), DispatchOutcome::Worker(3));
        assert_eq!(pick(4), DispatchOutcome::Worker(0));
        assert_eq!(pick(5), DispatchOutcome::Worker(1));
        assert_eq!(pick(6), DispatchOutcome::Worker(0));
    }

    #[test]
    fn test_every_mode_stays_in_range() {
        let modes = [
            DispatchMode::RoundRobin,
            DispatchMode::FdMod,
            DispatchMode::LeastBusy,
            DispatchMode::IpMod,
            DispatchMode::UidMod,
            DispatchMode::CoConnLb,
            DispatchMode::CoReqLb,
        ];
        let load = [4u32, 2, 9];
        for mode in modes {
            let d = Dispatcher::new(mode, 3, None);
            for fd in 0..64 {
                let c = DispatchContext {
                    uid: (fd as u32) * 7,
                    ip_hash: u32::MAX - fd as u32,
                    pinned: Some(fd as u32 % 5),
                    ..ctx(DispatchEvent::Receive, fd)
                };
                match d.select_worker(&c, &load) {
                    DispatchOutcome::Worker(id) => assert!(id < 3, "{mode:?} picked {id}"),
                    other => panic!("{mode:?} returned {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_connection_events_policy() {
        assert!(Dispatcher::new(DispatchMode::FdMod, 2, None).delivers_connection_events(false));
        assert!(!Dispatcher::new(DispatchMode::RoundRobin, 2, None).delivers_connection_events(false));
        assert!(Dispatcher::new(DispatchMode::RoundRobin, 2, None).delivers_connection_events(true));
    }
}

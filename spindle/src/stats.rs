//! Shared counters and the statistics snapshot.
//!
//! [`SharedBlock`] maps a fixed-layout block of atomics with `MAP_SHARED`, so
//! the same memory stays valid for every execution unit, including forked
//! children. Counters are only ever touched with `fetch_add`/`fetch_sub`.

use nix::errno::Errno;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Server-wide counters.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Counters {
    pub start_time: AtomicU64,
    pub accept_count: AtomicU64,
    pub close_count: AtomicU64,
    /// Connections refused or dropped before they were established.
    pub abort_count: AtomicU64,
    pub dispatch_count: AtomicU64,
    pub request_count: AtomicU64,
    pub response_count: AtomicU64,
    pub total_recv_bytes: AtomicU64,
    pub total_send_bytes: AtomicU64,
    pub pipe_packet_msg_id: AtomicU64,
    pub task_count: AtomicU64,
    pub tasking_num: AtomicI64,
    pub reload_count: AtomicU64,
    pub worker_respawn_count: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn tasking(&self) -> i64 {
        self.tasking_num.load(Ordering::Acquire)
    }
}

/// Anonymous shared mapping holding one [`Counters`].
#[derive(Debug)]
pub struct SharedBlock {
    ptr: NonNull<Counters>,
}

// SAFETY: the block only holds atomics and is unmapped once, on drop.
unsafe impl Send for SharedBlock {}
unsafe impl Sync for SharedBlock {}

impl SharedBlock {
    pub fn new() -> Result<Self, Errno> {
        let len = NonZeroUsize::new(std::mem::size_of::<Counters>()).ok_or(Errno::EINVAL)?;
        // SAFETY: fresh anonymous mapping, not aliased by anything yet.
        let raw = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )?
        };
        let ptr = raw.cast::<Counters>();
        // SAFETY: the mapping is page aligned and large enough for `Counters`.
        unsafe { ptr.as_ptr().write(Counters::default()) };
        Ok(Self { ptr })
    }
}

impl Deref for SharedBlock {
    type Target = Counters;
    fn deref(&self) -> &Counters {
        // SAFETY: valid for the lifetime of `self`.
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with exactly this length.
        let _ = unsafe { munmap(self.ptr.cast(), std::mem::size_of::<Counters>()) };
    }
}

/// Runtime statistics.
///
/// The `worker_*` and coroutine fields are filled when the snapshot is taken
/// from inside a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub start_time: u64,
    pub connection_num: u64,
    pub accept_count: u64,
    pub close_count: u64,
    pub abort_count: u64,
    pub dispatch_count: u64,
    pub request_count: u64,
    pub response_count: u64,
    pub total_recv_bytes: u64,
    pub total_send_bytes: u64,
    pub pipe_packet_msg_id: u64,
    pub session_round: u64,
    pub min_fd: i32,
    pub max_fd: i32,
    pub worker_num: u32,
    pub task_worker_num: u32,
    pub user_worker_num: u32,
    pub idle_worker_num: u32,
    pub task_idle_worker_num: u32,
    pub tasking_num: i64,
    pub task_count: u64,
    pub reload_count: u64,
    pub worker_respawn_count: u64,
    /// Not exposed by the datagram transport.
    pub task_queue_num: Option<u64>,
    pub task_queue_bytes: Option<u64>,
    pub worker_id: Option<u32>,
    pub worker_request_count: Option<u64>,
    pub worker_response_count: Option<u64>,
    pub worker_dispatch_count: Option<u64>,
    pub worker_concurrency: Option<u32>,
    pub coroutine_num: Option<u64>,
    pub coroutine_peak_num: Option<u64>,
}

impl StatsSnapshot {
    /// Fill the server-wide counter fields from `counters`.
    pub fn from_counters(counters: &Counters) -> Self {
        Self {
            start_time: Counters::get(&counters.start_time),
            accept_count: Counters::get(&counters.accept_count),
            close_count: Counters::get(&counters.close_count),
            abort_count: Counters::get(&counters.abort_count),
            dispatch_count: Counters::get(&counters.dispatch_count),
            request_count: Counters::get(&counters.request_count),
            response_count: Counters::get(&counters.response_count),
            total_recv_bytes: Counters::get(&counters.total_recv_bytes),
            total_send_bytes: Counters::get(&counters.total_send_bytes),
            pipe_packet_msg_id: Counters::get(&counters.pipe_packet_msg_id),
            tasking_num: counters.tasking(),
            task_count: Counters::get(&counters.task_count),
            reload_count: Counters::get(&counters.reload_count),
            worker_respawn_count: Counters::get(&counters.worker_respawn_count),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_shared_across_threads() {
        let block = Arc::new(SharedBlock::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let block = block.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        Counters::incr(&block.request_count);
                        block.tasking_num.fetch_add(1, Ordering::AcqRel);
                        block.tasking_num.fetch_sub(1, Ordering::AcqRel);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = StatsSnapshot::from_counters(&block);
        assert_eq!(snap.request_count, 4000);
        assert_eq!(snap.tasking_num, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let block = SharedBlock::new().unwrap();
        Counters::add(&block.total_recv_bytes, 42);
        let json = serde_json::to_value(StatsSnapshot::from_counters(&block)).unwrap();
        assert_eq!(json["total_recv_bytes"], 42);
        assert!(json["task_queue_num"].is_null());
    }
}

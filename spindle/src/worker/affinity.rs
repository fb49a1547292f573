use crate::error::ConfigError;
use nix::errno::Errno;

/// CPUs left for workers once `ignore` is removed from `0..cpu_num`.
pub fn available_cpus(cpu_num: usize, ignore: &[usize]) -> Result<Vec<usize>, ConfigError> {
    let cpus: Vec<usize> = (0..cpu_num).filter(|cpu| !ignore.contains(cpu)).collect();
    if cpus.is_empty() {
        return Err(ConfigError::NoAvailableCpu(cpu_num));
    }
    Ok(cpus)
}

/// CPU a worker is pinned to, cycling over the available set.
pub fn cpu_for(worker_id: u32, available: &[usize]) -> Option<usize> {
    if available.is_empty() {
        return None;
    }
    Some(available[worker_id as usize % available.len()])
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pin the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<(), Errno> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> Result<(), Errno> {
    Err(Errno::ENOSYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_cpus_removed() {
        assert_eq!(available_cpus(4, &[0, 2]).unwrap(), vec![1, 3]);
        assert_eq!(
            available_cpus(2, &[0, 1]),
            Err(ConfigError::NoAvailableCpu(2))
        );
    }

    #[test]
    fn test_workers_cycle_over_available() {
        let cpus = [1, 3];
        let picks: Vec<_> = (0..4).map(|id| cpu_for(id, &cpus).unwrap()).collect();
        assert_eq!(picks, vec![1, 3, 1, 3]);
        assert_eq!(cpu_for(0, &[]), None);
    }
}

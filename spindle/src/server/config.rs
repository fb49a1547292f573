use super::listener::ListenerConfig;
use crate::dispatch::DispatchMode;
use crate::error::ConfigError;
use crate::signal::BackendChoice;
use crate::worker::{RequestBudget, WORKER_MIN_REQUEST, available_cpus, cpu_count};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Workers allowed per CPU.
pub const MAX_WORKERS_PER_CPU: u32 = 1000;
/// Worker ids travel in 16-bit envelope fields.
pub const MAX_WORKERS: u32 = u16::MAX as u32 - 1;
pub const MAX_CONNECTION: usize = 1 << 20;
pub const DEFAULT_MAX_CONNECTION: usize = 10_000;
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_PIPE_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Server configuration.
///
/// Every field has a default, so a partial JSON document is a valid
/// configuration. [`ServerConfig::validate`] resolves the derived values and
/// rejects out-of-range input; the server validates before starting.
///
/// # Example
///
/// ```
/// use spindle::server::ServerConfig;
///
/// let mut config = ServerConfig::new()
///     .listen_tcp("127.0.0.1:9501".parse().unwrap())
///     .worker_num(4)
///     .max_request(1000);
/// config.validate().unwrap();
/// assert_eq!(config.max_request_grace, Some(500));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,
    /// Event workers; 0 means one per CPU.
    pub worker_num: u32,
    pub task_worker_num: u32,
    /// Requests an event worker serves before it is recycled; 0 disables.
    pub max_request: u64,
    /// Extra requests a draining worker may take. Defaults to half of `max_request`.
    pub max_request_grace: Option<u64>,
    pub task_max_request: u64,
    pub task_max_request_grace: Option<u64>,
    /// Seconds a draining worker may keep running.
    pub max_wait_time: f64,
    pub max_connection: usize,
    pub start_session_id: i64,
    pub dispatch_mode: DispatchMode,
    /// Deliver connect/close events even when the dispatch mode moves connections around.
    pub enable_unsafe_event: bool,
    /// Suspend `send_yield` callers instead of failing on a full output buffer.
    pub send_yield: bool,
    /// Seconds a `send_yield` caller may stay suspended.
    pub send_timeout: f64,
    pub output_buffer_size: usize,
    /// Bytes the reactor thread may hold for one event worker whose pipe is
    /// full. Connections whose input would exceed it are closed.
    pub pipe_buffer_size: usize,
    /// Seconds between heartbeat sweeps; 0 disables.
    pub heartbeat_check_interval: f64,
    /// Seconds without input after which a connection is evicted.
    pub heartbeat_idle_time: f64,
    pub open_cpu_affinity: bool,
    pub cpu_affinity_ignore: Vec<usize>,
    /// Directory for spooled task payloads.
    pub task_tmpdir: PathBuf,
    pub signal_backend: BackendChoice,
    /// Bind SIGTERM/SIGINT/SIGUSR1/SIGUSR2 in the supervisor.
    pub enable_signals: bool,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            worker_num: 0,
            task_worker_num: 0,
            max_request: 0,
            max_request_grace: None,
            task_max_request: 0,
            task_max_request_grace: None,
            max_wait_time: 3.0,
            max_connection: DEFAULT_MAX_CONNECTION,
            start_session_id: 1,
            dispatch_mode: DispatchMode::default(),
            enable_unsafe_event: false,
            send_yield: false,
            send_timeout: 5.0,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            pipe_buffer_size: DEFAULT_PIPE_BUFFER_SIZE,
            heartbeat_check_interval: 0.0,
            heartbeat_idle_time: 0.0,
            open_cpu_affinity: false,
            cpu_affinity_ignore: Vec::new(),
            task_tmpdir: std::env::temp_dir(),
            signal_backend: BackendChoice::Auto,
            enable_signals: true,
            backlog: 512,
        }
    }
}

fn default_grace(max: u64) -> u64 {
    if max > WORKER_MIN_REQUEST { max / 2 } else { 0 }
}

fn out_of_range(name: &'static str, value: i64, min: i64, max: i64) -> ConfigError {
    ConfigError::OutOfRange {
        name,
        value,
        min,
        max,
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn listen(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listen_tcp(self, addr: SocketAddr) -> Self {
        self.listen(ListenerConfig::tcp(addr))
    }

    pub fn listen_udp(self, addr: SocketAddr) -> Self {
        self.listen(ListenerConfig::udp(addr))
    }

    pub fn worker_num(mut self, n: u32) -> Self {
        self.worker_num = n;
        self
    }

    pub fn task_worker_num(mut self, n: u32) -> Self {
        self.task_worker_num = n;
        self
    }

    pub fn max_request(mut self, n: u64) -> Self {
        self.max_request = n;
        self
    }

    pub fn max_request_grace(mut self, n: u64) -> Self {
        self.max_request_grace = Some(n);
        self
    }

    pub fn task_max_request(mut self, n: u64) -> Self {
        self.task_max_request = n;
        self
    }

    pub fn task_max_request_grace(mut self, n: u64) -> Self {
        self.task_max_request_grace = Some(n);
        self
    }

    pub fn max_wait_time(mut self, secs: f64) -> Self {
        self.max_wait_time = secs;
        self
    }

    pub fn max_connection(mut self, n: usize) -> Self {
        self.max_connection = n;
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn send_yield(mut self, enable: bool) -> Self {
        self.send_yield = enable;
        self
    }

    pub fn output_buffer_size(mut self, bytes: usize) -> Self {
        self.output_buffer_size = bytes;
        self
    }

    pub fn pipe_buffer_size(mut self, bytes: usize) -> Self {
        self.pipe_buffer_size = bytes;
        self
    }

    pub fn heartbeat(mut self, check_interval: f64, idle_time: f64) -> Self {
        self.heartbeat_check_interval = check_interval;
        self.heartbeat_idle_time = idle_time;
        self
    }

    pub fn cpu_affinity(mut self, ignore: Vec<usize>) -> Self {
        self.open_cpu_affinity = true;
        self.cpu_affinity_ignore = ignore;
        self
    }

    pub fn task_tmpdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_tmpdir = dir.into();
        self
    }

    pub fn signal_backend(mut self, choice: BackendChoice) -> Self {
        self.signal_backend = choice;
        self
    }

    pub fn enable_signals(mut self, enable: bool) -> Self {
        self.enable_signals = enable;
        self
    }

    /// Resolve derived values and reject invalid parameters.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListener);
        }
        let cpus = cpu_count() as u32;
        let worker_max = cpus.saturating_mul(MAX_WORKERS_PER_CPU).min(MAX_WORKERS);
        if self.worker_num == 0 {
            self.worker_num = cpus.max(1);
        }
        if self.worker_num > worker_max {
            return Err(out_of_range("worker_num", self.worker_num as i64, 0, worker_max as i64));
        }
        if self.task_worker_num > worker_max {
            return Err(out_of_range(
                "task_worker_num",
                self.task_worker_num as i64,
                0,
                worker_max as i64,
            ));
        }
        if self.worker_num + self.task_worker_num > MAX_WORKERS {
            return Err(out_of_range(
                "worker_num + task_worker_num",
                (self.worker_num + self.task_worker_num) as i64,
                1,
                MAX_WORKERS as i64,
            ));
        }
        if self.max_connection == 0 || self.max_connection > MAX_CONNECTION {
            return Err(out_of_range(
                "max_connection",
                self.max_connection as i64,
                1,
                MAX_CONNECTION as i64,
            ));
        }
        if self.start_session_id <= 0 {
            return Err(out_of_range("start_session_id", self.start_session_id, 1, i64::MAX));
        }
        if self.listeners.len() > u16::MAX as usize {
            return Err(ConfigError::Invalid("too many listeners"));
        }
        if self.send_yield && !matches!(self.dispatch_mode, DispatchMode::FdMod | DispatchMode::IpMod) {
            return Err(ConfigError::SendYieldDispatchMode);
        }
        if self.open_cpu_affinity {
            available_cpus(cpu_count(), &self.cpu_affinity_ignore)?;
        }
        if !(self.max_wait_time > 0.0) {
            return Err(ConfigError::Invalid("max_wait_time must be positive"));
        }
        if !(self.send_timeout > 0.0) {
            return Err(ConfigError::Invalid("send_timeout must be positive"));
        }
        if self.output_buffer_size == 0 {
            return Err(out_of_range("output_buffer_size", 0, 1, i64::MAX));
        }
        if self.pipe_buffer_size == 0 {
            return Err(out_of_range("pipe_buffer_size", 0, 1, i64::MAX));
        }
        if self.heartbeat_check_interval < 0.0 || self.heartbeat_idle_time < 0.0 {
            return Err(ConfigError::Invalid("heartbeat settings must not be negative"));
        }
        if self.heartbeat_idle_time > 0.0 && self.heartbeat_check_interval == 0.0 {
            self.heartbeat_check_interval = (self.heartbeat_idle_time / 2.0).max(1.0);
        } else if self.heartbeat_check_interval > 0.0 && self.heartbeat_idle_time == 0.0 {
            self.heartbeat_idle_time = self.heartbeat_check_interval * 2.0;
        }
        self.max_request_grace
            .get_or_insert_with(|| default_grace(self.max_request));
        self.task_max_request_grace
            .get_or_insert_with(|| default_grace(self.task_max_request));
        Ok(())
    }

    pub fn core_worker_num(&self) -> u32 {
        self.worker_num + self.task_worker_num
    }

    pub fn max_wait_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_time.max(0.001))
    }

    pub fn send_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.send_timeout.max(0.001))
    }

    /// Sweep interval and idle threshold, if heartbeat is on.
    pub fn heartbeat_durations(&self) -> Option<(Duration, Duration)> {
        (self.heartbeat_check_interval > 0.0).then(|| {
            (
                Duration::from_secs_f64(self.heartbeat_check_interval),
                Duration::from_secs_f64(self.heartbeat_idle_time.max(0.0)),
            )
        })
    }

    pub fn worker_budget(&self) -> RequestBudget {
        RequestBudget::new(
            self.max_request,
            self.max_request_grace.unwrap_or_else(|| default_grace(self.max_request)),
        )
    }

    pub fn task_worker_budget(&self) -> RequestBudget {
        RequestBudget::new(
            self.task_max_request,
            self.task_max_request_grace
                .unwrap_or_else(|| default_grace(self.task_max_request)),
        )
    }

    /// Queue depth at which the buffer-full event fires.
    pub fn buffer_high_watermark(&self) -> u64 {
        (self.output_buffer_size as u64 / 4 * 3).max(1)
    }

    /// Queue depth at which the buffer-empty event fires.
    pub fn buffer_low_watermark(&self) -> u64 {
        self.output_buffer_size as u64 / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig::new().listen_tcp("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_listener_required() {
        assert_eq!(ServerConfig::new().validate(), Err(ConfigError::NoListener));
    }

    #[test]
    fn test_worker_num_defaults_to_cpus() {
        let mut config = base();
        config.validate().unwrap();
        assert_eq!(config.worker_num, cpu_count() as u32);
    }

    #[test]
    fn test_grace_defaults() {
        let mut config = base().max_request(100).task_max_request(8);
        config.validate().unwrap();
        assert_eq!(config.max_request_grace, Some(50));
        assert_eq!(config.task_max_request_grace, Some(0));

        let mut explicit = base().task_max_request(100).task_max_request_grace(7);
        explicit.validate().unwrap();
        assert_eq!(explicit.task_max_request_grace, Some(7));
    }

    #[test]
    fn test_heartbeat_derivation() {
        let mut idle_only = base().heartbeat(0.0, 10.0);
        idle_only.validate().unwrap();
        assert_eq!(idle_only.heartbeat_check_interval, 5.0);

        let mut short_idle = base().heartbeat(0.0, 1.0);
        short_idle.validate().unwrap();
        assert_eq!(short_idle.heartbeat_check_interval, 1.0);

        let mut interval_only = base().heartbeat(3.0, 0.0);
        interval_only.validate().unwrap();
        assert_eq!(interval_only.heartbeat_idle_time, 6.0);
    }

    #[test]
    fn test_rejections() {
        let mut c = base().send_yield(true).dispatch_mode(DispatchMode::RoundRobin);
        assert_eq!(c.validate(), Err(ConfigError::SendYieldDispatchMode));

        let mut c = base();
        c.start_session_id = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfRange { name: "start_session_id", .. })
        ));

        let mut c = base().cpu_affinity((0..cpu_count()).collect());
        assert_eq!(c.validate(), Err(ConfigError::NoAvailableCpu(cpu_count())));

        let mut c = base().max_connection(0);
        assert!(c.validate().is_err());

        let mut c = base().worker_num(u32::MAX);
        assert!(c.validate().is_err());

        let mut c = base().pipe_buffer_size(0);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::OutOfRange { name: "pipe_buffer_size", .. })
        ));
    }

    #[test]
    fn test_partial_json() {
        let mut config = ServerConfig::from_json(
            r#"{
                "listeners": [{"addr": {"inet": "127.0.0.1:0"}, "socket_type": "tcp"}],
                "worker_num": 2,
                "dispatch_mode": "round_robin"
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.worker_num, 2);
        assert_eq!(config.dispatch_mode, DispatchMode::RoundRobin);
        assert_eq!(config.max_connection, DEFAULT_MAX_CONNECTION);
    }
}

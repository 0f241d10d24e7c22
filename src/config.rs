use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// MFT dashboard — reconciles live test state from the MFT backend and
/// analyzes uploaded test reports.
#[derive(Parser, Debug, Clone)]
#[command(name = "mft-dashboard")]
pub struct CliArgs {
    /// Base URL of the MFT backend
    #[arg(short = 'b', long = "backend-url", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: String,

    /// Dashboard HTTP port
    #[arg(long = "port", default_value_t = DEFAULT_DASHBOARD_PORT)]
    pub port: u16,

    /// Seconds between history polls
    #[arg(long = "poll-interval-secs", default_value_t = HISTORY_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    /// Seconds between reads of the structured test log
    #[arg(long = "log-poll-interval-secs", default_value_t = LOG_POLL_INTERVAL_SECS)]
    pub log_poll_interval_secs: u64,

    /// Tail a local log file instead of the backend's /logs/latest.log
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Load a report document at startup
    #[arg(short = 'r', long = "report")]
    pub report: Option<PathBuf>,

    /// Do not subscribe to the backend event stream (poll only)
    #[arg(long = "no-events")]
    pub no_events: bool,

    /// Consecutive failed stream connects before the event ingestor gives up
    #[arg(long = "stream-max-retries", default_value_t = STREAM_MAX_RECONNECT_ATTEMPTS)]
    pub stream_max_retries: u32,

    /// Directory for the dashboard's own rolling log files
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub backend_url: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub log_poll_interval: Duration,
    pub log_file: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub events_enabled: bool,
    pub reconnect: ReconnectPolicy,
    pub log_dir: Option<PathBuf>,
}

// Network defaults
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";
pub const DEFAULT_DASHBOARD_PORT: u16 = 3000;
pub const HTTP_TIMEOUT_SECS: u64 = 10;
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 5;

// Producer cadence
pub const HISTORY_POLL_INTERVAL_SECS: u64 = 5;
pub const LOG_POLL_INTERVAL_SECS: u64 = 5;
pub const PRODUCER_STOP_TIMEOUT_MS: u64 = 500;

// Event stream reconnect
pub const STREAM_RECONNECT_INITIAL_MS: u64 = 1_000;
pub const STREAM_RECONNECT_MAX_MS: u64 = 30_000;
pub const STREAM_MAX_RECONNECT_ATTEMPTS: u32 = 10;

// Buffers
pub const RAW_LOG_BUFFER_SIZE: usize = 100;
pub const LOG_BROADCAST_CAPACITY: usize = 256;
pub const STORE_COMMAND_CAPACITY: usize = 256;

// Report analytics
pub const DEFAULT_HISTOGRAM_BINS: usize = 20;
pub const SLOW_REQUEST_LIMIT: usize = 5;
/// Throughput below this many MB/s is presented in KB/s.
pub const MBPS_DISPLAY_THRESHOLD: f64 = 1.0;
pub const KB_PER_MB: f64 = 1024.0;

/// Bounded exponential backoff for the backend event stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(STREAM_RECONNECT_INITIAL_MS),
            max: Duration::from_millis(STREAM_RECONNECT_MAX_MS),
            max_attempts: STREAM_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), doubling up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

impl DashboardConfig {
    pub fn from_args(args: CliArgs) -> Self {
        DashboardConfig {
            backend_url: args.backend_url,
            port: args.port,
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
            log_poll_interval: Duration::from_secs(args.log_poll_interval_secs.max(1)),
            log_file: args.log_file,
            report: args.report,
            events_enabled: !args.no_events,
            reconnect: ReconnectPolicy {
                max_attempts: args.stream_max_retries,
                ..ReconnectPolicy::default()
            },
            log_dir: args.log_dir,
        }
    }

    /// Config pointing at `backend_url` with every other setting at its default.
    pub fn for_backend(backend_url: impl Into<String>) -> Self {
        DashboardConfig {
            backend_url: backend_url.into(),
            port: DEFAULT_DASHBOARD_PORT,
            poll_interval: Duration::from_secs(HISTORY_POLL_INTERVAL_SECS),
            log_poll_interval: Duration::from_secs(LOG_POLL_INTERVAL_SECS),
            log_file: None,
            report: None,
            events_enabled: true,
            reconnect: ReconnectPolicy::default(),
            log_dir: None,
        }
    }
}

//! Opt-in perf counters (`PIXEL_CANVAS_PERF=1`) and logging setup.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::info;

pub const PERF_ENV: &str = "PIXEL_CANVAS_PERF";

/// How often (in samples) a running counter is reported.
const REPORT_EVERY: u64 = 200;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy(PERF_ENV).unwrap_or(false));

static STATS: Lazy<Mutex<BTreeMap<&'static str, PerfStat>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

static GAUGES: Lazy<Mutex<BTreeMap<&'static str, GaugeStat>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

#[derive(Default)]
struct GaugeStat {
    last: u64,
    max: u64,
    samples: u64,
}

#[derive(Default)]
struct PerfStat {
    total_ns: u128,
    max_ns: u128,
    count: u64,
}

impl PerfStat {
    fn avg_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.total_ns / self.count as u128) as f64 / 1_000.0
    }
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_duration(label: &'static str, duration: Duration) {
    if !enabled() {
        return;
    }
    let mut stats = STATS.lock();
    let entry = stats.entry(label).or_default();
    entry.count += 1;
    let nanos = duration.as_nanos();
    entry.total_ns += nanos;
    entry.max_ns = entry.max_ns.max(nanos);
    if entry.count % REPORT_EVERY == 0 {
        info!(
            target = "pixel_canvas::perf",
            label,
            count = entry.count,
            avg_us = entry.avg_us(),
            max_us = entry.max_ns as f64 / 1_000.0,
            "timing"
        );
    }
}

pub fn record_gauge(label: &'static str, value: u64) {
    if !enabled() {
        return;
    }
    let mut gauges = GAUGES.lock();
    let entry = gauges.entry(label).or_default();
    entry.last = value;
    entry.max = entry.max.max(value);
    entry.samples = entry.samples.saturating_add(1);
    if entry.samples % REPORT_EVERY == 0 {
        info!(
            target = "pixel_canvas::perf",
            label,
            last = entry.last,
            max = entry.max,
            samples = entry.samples,
            "gauge"
        );
    }
}

/// Logs every counter collected so far. Called once on shutdown.
pub fn report() {
    if !enabled() {
        return;
    }
    for (label, stat) in STATS.lock().iter() {
        info!(
            target = "pixel_canvas::perf",
            label,
            count = stat.count,
            avg_us = stat.avg_us(),
            max_us = stat.max_ns as f64 / 1_000.0,
            "timing summary"
        );
    }
    for (label, gauge) in GAUGES.lock().iter() {
        info!(
            target = "pixel_canvas::perf",
            label,
            last = gauge.last,
            max = gauge.max,
            samples = gauge.samples,
            "gauge summary"
        );
    }
}

/// Records the time until drop under `label`. `None` when perf is off.
pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        if !enabled() {
            return None;
        }
        Some(Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.label, self.start.elapsed());
    }
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const LOG_FILTER_ENV: &str = "PIXEL_CANVAS_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. A second call is a no-op.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter(config.level.to_filter()))
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    fn env_filter(level: LevelFilter) -> EnvFilter {
        match std::env::var(LOG_FILTER_ENV) {
            Ok(filter) => EnvFilter::new(filter),
            Err(_) => EnvFilter::new(default_filter_for(level)),
        }
    }

    /// Our own crate follows `level`; the WebSocket stack is held at `info`
    /// below that so frame-level noise stays out of trace logs.
    pub(crate) fn default_filter_for(level: LevelFilter) -> String {
        match level {
            LevelFilter::TRACE | LevelFilter::DEBUG => {
                let level = level.to_string().to_ascii_lowercase();
                format!("info,pixel_canvas={level},tungstenite=info,tokio_tungstenite=info")
            }
            other => other.to_string().to_ascii_lowercase(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn verbose_levels_scope_to_this_crate() {
            assert_eq!(
                default_filter_for(LevelFilter::TRACE),
                "info,pixel_canvas=trace,tungstenite=info,tokio_tungstenite=info"
            );
            assert_eq!(default_filter_for(LevelFilter::WARN), "warn");
            assert_eq!(default_filter_for(LevelFilter::OFF), "off");
        }

        #[test]
        fn log_levels_are_ordered_by_verbosity() {
            assert!(LogLevel::Trace > LogLevel::Debug);
            assert_eq!(LogLevel::default(), LogLevel::Warn);
            assert_eq!(LogLevel::Info.to_filter(), LevelFilter::INFO);
        }
    }
}

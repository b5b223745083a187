//! Logging seam for the library and subscriber setup for the binary.
//!
//! The library never prints. It reports through an injected [`Logger`]; the
//! default [`TracingLogger`] forwards to `tracing` events, which the binary
//! routes to stderr with [`init_subscriber`].

use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Progress of one long-running step, e.g. writing a container.
pub trait Progress {
    /// Record `done` units out of the total given at creation.
    fn set(&mut self, done: u64);

    fn finish(&mut self);
}

pub trait Logger {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn progress(&self, label: &str, total: u64) -> Box<dyn Progress + '_>;
}

/// Forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Warn => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }
    }

    fn progress(&self, label: &str, total: u64) -> Box<dyn Progress + '_> {
        Box::new(TracingProgress {
            label: label.to_string(),
            total,
            last_tenth: 0,
        })
    }
}

/// Emits a debug event every 10 %.
struct TracingProgress {
    label: String,
    total: u64,
    last_tenth: u64,
}

impl Progress for TracingProgress {
    fn set(&mut self, done: u64) {
        if self.total == 0 {
            return;
        }
        let tenth = done.min(self.total) * 10 / self.total;
        if tenth > self.last_tenth {
            self.last_tenth = tenth;
            tracing::debug!(label = %self.label, done, total = self.total, "{}%", tenth * 10);
        }
    }

    fn finish(&mut self) {
        tracing::debug!(label = %self.label, "done");
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

struct NullProgress;

impl Progress for NullProgress {
    fn set(&mut self, _done: u64) {}

    fn finish(&mut self) {}
}

impl Logger for NullLogger {
    fn log(&self, _level: Level, _message: &str) {}

    fn progress(&self, _label: &str, _total: u64) -> Box<dyn Progress + '_> {
        Box::new(NullProgress)
    }
}

/// Keeps every message, for inspection after the fact.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn at(&self, level: Level) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: Level, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }

    fn progress(&self, _label: &str, _total: u64) -> Box<dyn Progress + '_> {
        Box::new(NullProgress)
    }
}

/// Install the global subscriber: stderr, filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a subscriber is already installed.
pub fn init_subscriber() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_logger_keeps_levels() {
        let logger = MemoryLogger::new();
        logger.info("starting");
        logger.warn("skipping /dev/null");
        assert_eq!(logger.at(Level::Warn), vec!["skipping /dev/null".to_string()]);
        assert_eq!(logger.lines().len(), 2);
    }

    #[test]
    fn progress_handles_zero_total() {
        let logger = TracingLogger;
        let mut progress = logger.progress("empty", 0);
        progress.set(10);
        progress.finish();
    }
}

//! Kernel log front-end for the scheduler crate.
//!
//! The scheduler logs through the same `klog!`/`kinfo!`/... macros the rest
//! of the kernel uses, but it does not own a console. The kernel (or a test
//! harness) registers a sink with [`set_sink`]; until then records are
//! filtered and dropped. The runtime level filter works exactly like the
//! kernel logger: records above the current level are discarded before the
//! sink is consulted.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
static SINK: Mutex<Option<SinkFn>> = Mutex::new(None);

/// A log sink: receives every record that passes the level filter.
pub type SinkFn = fn(LogLevel, &fmt::Arguments);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    PANIC,
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::PANIC => "PANIC",
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    pub(crate) const fn priority(self) -> u8 {
        match self {
            LogLevel::PANIC => 0,
            LogLevel::FATAL => 1,
            LogLevel::ERROR => 2,
            LogLevel::WARN => 3,
            LogLevel::INFO => 4,
            LogLevel::DEBUG => 5,
            LogLevel::TRACE => 6,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("panic") {
            Some(LogLevel::PANIC)
        } else if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::FATAL)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else {
            None
        }
    }
}

/// Install the sink all scheduler log records are written to.
pub fn set_sink(sink: SinkFn) {
    *SINK.lock() = Some(sink);
}

/// Remove the installed sink; records are dropped again.
pub fn clear_sink() {
    *SINK.lock() = None;
}

/// Set the runtime level filter. Records with a lower priority than `level`
/// are dropped.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn level_enabled(level: LogLevel) -> bool {
    level.priority() <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Write one record. Called through the `klog!` macro family.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !level_enabled(level) {
        return;
    }
    if let Some(sink) = *SINK.lock() {
        sink(level, &args);
    }
}

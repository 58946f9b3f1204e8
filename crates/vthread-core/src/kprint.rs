//! Kernel-style print macros for vthread
//!
//! Leveled, line-at-a-time output to stderr in the spirit of printk. Lines
//! printed from a carrier thread carry a `[c<N>]` tag and, while a virtual
//! thread is mounted, a `[v<id>]` tag.
//!
//! # Environment Variables
//!
//! - `VT_FLUSH_EPRINT=1` - Flush stderr after each line (useful when chasing crashes)
//! - `VT_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0..5
//!
//! ```ignore
//! use vthread_core::{kdebug, kerror, kinfo};
//!
//! kinfo!("carrier {} started", id);
//! kdebug!("preempt {} -> {}", vt, status);
//! kerror!("virtual thread {} faulted", vt);
//! ```

use crate::constants::CARRIER_NONE;
use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

/// Severity of a log line; lower is more severe
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

const LEVELS: [LogLevel; 6] = [
    LogLevel::Off,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

impl LogLevel {
    /// Out-of-range values saturate to `Trace`
    pub fn from_u8(v: u8) -> Self {
        LEVELS[usize::from(v).min(LEVELS.len() - 1)]
    }

    /// Parse a level name or digit; `None` for anything unrecognized
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return LEVELS.get(usize::from(n)).copied();
        }
        LEVELS.iter().copied().find(|l| l.name().eq_ignore_ascii_case(s))
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Low three bits: level. Bit 3: flush after every line.
const LEVEL_MASK: u8 = 0b0111;
const FLUSH_BIT: u8 = 0b1000;

static SETTINGS: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static ENV_LOADED: Once = Once::new();

thread_local! {
    static CARRIER_TAG: Cell<usize> = const { Cell::new(CARRIER_NONE) };
    static VTHREAD_TAG: Cell<u64> = const { Cell::new(0) };
}

/// Load settings from the environment
///
/// Runs on first use; call explicitly for deterministic start-up. Settings
/// made through `set_log_level`/`set_flush_enabled` beforehand win.
pub fn init() {
    ENV_LOADED.call_once(|| {
        let flush = std::env::var("VT_FLUSH_EPRINT")
            .is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"));
        let level = std::env::var("VT_LOG_LEVEL")
            .ok()
            .map(|v| LogLevel::parse(&v).unwrap_or(LogLevel::Info))
            .unwrap_or(LogLevel::Info);
        SETTINGS.store(pack(level, flush), Ordering::Relaxed);
    });
}

#[inline]
fn pack(level: LogLevel, flush: bool) -> u8 {
    level as u8 | if flush { FLUSH_BIT } else { 0 }
}

#[inline]
fn settings() -> u8 {
    init();
    SETTINGS.load(Ordering::Relaxed)
}

fn update(f: impl Fn(u8) -> u8) {
    // An explicit setting replaces whatever the environment would say
    ENV_LOADED.call_once(|| {});
    let _ = SETTINGS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(f(s)));
}

#[inline]
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(settings() & LEVEL_MASK)
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    update(|s| (s & !LEVEL_MASK) | level as u8);
}

#[inline]
pub fn flush_enabled() -> bool {
    settings() & FLUSH_BIT != 0
}

pub fn set_flush_enabled(enabled: bool) {
    update(|s| if enabled { s | FLUSH_BIT } else { s & !FLUSH_BIT });
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Tag this thread's lines with a carrier index
pub fn set_carrier_id(id: usize) {
    CARRIER_TAG.with(|c| c.set(id));
}

pub fn clear_carrier_id() {
    set_carrier_id(CARRIER_NONE);
}

/// Tag this thread's lines with the mounted virtual thread
pub fn set_vthread_id(id: u64) {
    VTHREAD_TAG.with(|v| v.set(id));
}

pub fn clear_vthread_id() {
    set_vthread_id(0);
}

/// Thread context prefixed to leveled lines
struct Tags {
    carrier: usize,
    vthread: u64,
}

impl Tags {
    fn current() -> Self {
        Tags {
            carrier: CARRIER_TAG.with(|c| c.get()),
            vthread: VTHREAD_TAG.with(|v| v.get()),
        }
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.carrier != CARRIER_NONE {
            write!(f, "[c{}] ", self.carrier)?;
        }
        if self.vthread != 0 {
            write!(f, "[v{}] ", self.vthread)?;
        }
        Ok(())
    }
}

fn emit(level: Option<LogLevel>, args: fmt::Arguments<'_>, newline: bool) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = match level {
        Some(level) => write!(out, "[{:<5}] {}{}", level.name().to_ascii_uppercase(), Tags::current(), args),
        None => out.write_fmt(args),
    };
    if newline {
        let _ = out.write_all(b"\n");
    }
    if flush_enabled() {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>, newline: bool) {
    emit(None, args, newline);
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args, true);
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::_print(format_args!($($arg)*), false)
    };
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_print(format_args!(""), true)
    };
    ($($arg:tt)*) => {
        $crate::kprint::_print(format_args!($($arg)*), true)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_log($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) };
}

/// Most verbose level; per-switch tracing
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_ordered() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("2"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("9"), None);
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
        assert_eq!(LogLevel::Info.to_string(), "info");
    }

    #[test]
    fn test_packed_settings() {
        assert_eq!(pack(LogLevel::Debug, false) & LEVEL_MASK, LogLevel::Debug as u8);
        assert_ne!(pack(LogLevel::Off, true) & FLUSH_BIT, 0);
        assert_eq!(LogLevel::from_u8(pack(LogLevel::Trace, true) & LEVEL_MASK), LogLevel::Trace);
    }

    #[test]
    fn test_context_tags() {
        assert_eq!(Tags::current().to_string(), "");

        set_carrier_id(3);
        set_vthread_id(17);
        assert_eq!(Tags::current().to_string(), "[c3] [v17] ");

        clear_vthread_id();
        assert_eq!(Tags::current().to_string(), "[c3] ");
        clear_carrier_id();
        assert_eq!(Tags::current().to_string(), "");
    }

    #[test]
    fn test_off_is_never_enabled() {
        assert!(!level_enabled(LogLevel::Off));
    }

    #[test]
    fn test_macros_compile() {
        kprint!("");
        kprintln!();
        ktrace!("trace {}", 1);
        kdebug!("debug {}", 2);
    }
}

use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::SystemTime;

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Serial logger printing colored lines stamped with time since boot
struct EnhancedLogger;

impl log::Log for EnhancedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now()
            .duration_since(*boot_time)
            .unwrap_or_default();

        println!(
            "{}{} [{}] {:>12} | {}{}",
            level_color(record.level()),
            format_uptime(elapsed.as_secs(), elapsed.subsec_millis()),
            level_char(record.level()),
            short_module(record.module_path()),
            record.args(),
            colors::RESET
        );
    }

    fn flush(&self) {}
}

static LOGGER: EnhancedLogger = EnhancedLogger;

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => colors::BRIGHT_RED,
        Level::Warn => colors::BRIGHT_YELLOW,
        Level::Info => colors::BRIGHT_GREEN,
        Level::Debug => colors::BRIGHT_BLUE,
        Level::Trace => colors::GRAY,
    }
}

fn level_char(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

// Compact uptime: seconds with millis, then m/s, then h/m
fn format_uptime(seconds: u64, millis: u32) -> String {
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

// Last path segment, at most 12 chars
fn short_module(path: Option<&str>) -> &str {
    let module = path
        .unwrap_or("unknown")
        .rsplit("::")
        .next()
        .unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((idx, _)) => &module[..idx],
        None => module,
    }
}

/// Install the serial logger. Fails if another logger is already set.
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(SystemTime::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);

    println!(
        "{}== {} ==={}",
        colors::BRIGHT_GREEN,
        crate::version::full_version(),
        colors::RESET
    );
    Ok(())
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(filter) => {
            log::set_max_level(filter);
            true
        }
        None => false,
    }
}

/// Current global max level
pub fn current_max_level() -> LevelFilter {
    log::max_level()
}

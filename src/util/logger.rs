use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Verbosity names accepted in `RUST_LOG`, matched case-insensitively.
const LEVELS: &[(&str, LevelFilter)] = &[
    ("off", LevelFilter::Off),
    ("error", LevelFilter::Error),
    ("warn", LevelFilter::Warn),
    ("info", LevelFilter::Info),
    ("debug", LevelFilter::Debug),
    ("trace", LevelFilter::Trace),
];

fn level_from_str(value: &str) -> LevelFilter {
    LEVELS
        .iter()
        .find(|(name, _)| value.eq_ignore_ascii_case(name))
        .map(|&(_, level)| level)
        // A set but unrecognized value still asks for output.
        .unwrap_or(LevelFilter::Info)
}

fn level_from_env() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(value) => level_from_str(&value),
        Err(_) => LevelFilter::Warn,
    }
}

/// Stderr logger for a multi-process runtime: workers interleave, so every
/// line leads with the pid.
struct RuntimeLogger;

impl Log for RuntimeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let pid = unsafe { libc::getpid() };
            match (record.file(), record.line()) {
                (Some(file), Some(line)) => eprintln!(
                    "[pid {}] {} {}:{}: {}",
                    pid,
                    record.level(),
                    file,
                    line,
                    record.args()
                ),
                _ => eprintln!("[pid {}] {} {}", pid, record.level(), record.args()),
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: RuntimeLogger = RuntimeLogger;

/// Install the logger, reading the verbosity from `RUST_LOG`. A region may
/// be opened more than once per process; only the first call wins and later
/// ones report the expected error.
pub fn try_init() -> Result<(), SetLoggerError> {
    log::set_max_level(level_from_env());
    log::set_logger(&LOGGER)
}

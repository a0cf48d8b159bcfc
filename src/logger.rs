use log::{LevelFilter, Log, Metadata, Record};
use spin::RwLock;

pub(crate) static LOGGER: Logger = Logger::new();

pub(crate) struct Logger {
    inner: RwLock<LoggerInner>,
}

struct LoggerInner {
    level: LevelFilter,
    // prefix records with the emitting thread, which is the simulated CPU in stress runs
    thread_names: bool,
}

impl Logger {
    pub(crate) const fn new() -> Self {
        Self {
            inner: RwLock::new(LoggerInner::new()),
        }
    }

    pub(crate) fn set_level(&self, level: LevelFilter) {
        self.inner.write().level = level;
        log::set_max_level(level);
    }

    pub(crate) fn set_thread_names(&self, enable: bool) {
        self.inner.write().thread_names = enable;
    }
}

impl LoggerInner {
    const fn new() -> Self {
        Self {
            level: LevelFilter::Info,
            thread_names: false,
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.inner.read().level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let logger = self.inner.read();
        if logger.thread_names {
            let t = std::thread::current();
            eprintln!(
                "[{}] [{}] {}",
                record.level(),
                t.name().unwrap_or("?"),
                record.args()
            );
        } else {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs [LOGGER] as the global logger.
pub(crate) fn init(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    LOGGER.set_level(level);
    Ok(())
}

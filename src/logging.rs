// Logging - process-wide log endpoint
//
// env_logger behind the `log` facade, initialised once per process. With
// `log_to_file` set, records are also appended to the configured file
// after it has been truncated and stamped.

use crate::config::DebugConfig;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Once;

static INIT: Once = Once::new();

/// Flushes the logger when dropped; hold it for the life of `main`
#[must_use = "dropping the guard flushes and ends the logging session"]
pub struct LoggingGuard {
    _private: (),
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        log::logger().flush();
    }
}

/// Stderr plus an optional log file
struct TeeWriter {
    file: Option<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = &self.file {
            // A failing log file must not take console logging down with it
            let _ = file.lock().write_all(buf);
        }
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
        io::stderr().flush()
    }
}

fn open_log_file(path: &str) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "=== vkframe log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

/// Initialise logging. Later calls only hand out another guard.
pub fn init_logging(config: &DebugConfig) -> LoggingGuard {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        if let Some(filter) = &config.log_filter {
            builder.parse_filters(filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filter);
        } else {
            builder.filter_level(log::LevelFilter::Info);
        }

        let file = if config.log_to_file {
            match open_log_file(&config.log_file) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    eprintln!("Failed to open log file {}: {}", config.log_file, e);
                    None
                }
            }
        } else {
            None
        };
        builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));

        // Another logger may already be installed (tests, embedding apps)
        if builder.try_init().is_ok() {
            log::debug!("logging initialized");
        }
    });
    LoggingGuard { _private: () }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = DebugConfig {
            log_to_file: false,
            ..DebugConfig::default()
        };
        let first = init_logging(&config);
        let second = init_logging(&config);
        log::info!("still logging after two init calls");
        drop(second);
        drop(first);
    }
}

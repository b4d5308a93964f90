//! Process-wide log sink.
//!
//! The sink backs the `log` facade macros used across the crate. Records go
//! to the file named at [`init`] time, or to standard error when no file is
//! configured. One formatted line is written per record:
//!
//! ```text
//! YYYY-MM-DD HH:MM:SS.ff [LEVEL] [module] [file:line] - message
//! ```
//!
//! File writes hold an advisory exclusive lock on the log fd for the duration
//! of the write: the forked child shares the sink with the supervisor, so
//! serialization of writers must come from the file descriptor rather than an
//! in-process mutex. A failed file write permanently reroutes the sink to
//! standard error.
//!

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use nix::fcntl::{flock, FlockArg};

/// The level-gated line writer registered as the `log` facade backend.
pub struct LogSink {
    /// Destination file; `None` means standard error.
    file: Mutex<Option<File>>,

    /// Whether DEBUG records pass the gate.
    verbose: bool,
}

impl LogSink {
    /// Create a sink writing to the given path. The empty path and the
    /// literal `stderr` select standard error; a file that cannot be opened
    /// falls back to standard error as well.
    fn open(path: &str, verbose: bool) -> LogSink {
        let file = if path.is_empty() || path == "stderr" {
            None
        } else {
            match OpenOptions::new().append(true).create(true).open(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    eprintln!("cannot open log file {}: {}, logging to stderr", path, e);
                    None
                },
            }
        };

        LogSink {
            file: Mutex::new(file),
            verbose,
        }
    }

    /// Format one record into the sink's line shape.
    fn format_record(record: &Record) -> String {
        let now = Local::now();
        format!("{}.{:02} [{}] [{}] [{}:{}] - {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis() / 10,
            record.level(),
            record.module_path().unwrap_or("?"),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args())
    }

    /// Write one line to the file under an exclusive flock.
    fn write_locked(file: &mut File, line: &str) -> std::io::Result<()> {
        let fd = file.as_raw_fd();
        flock(fd, FlockArg::LockExclusive)
            .map_err(|_| std::io::Error::last_os_error())?;
        let res = file.write_all(line.as_bytes());
        let _ = flock(fd, FlockArg::Unlock);
        res
    }
}

impl Log for LogSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if self.verbose {
            metadata.level() <= Level::Debug
        } else {
            metadata.level() <= Level::Info
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = LogSink::format_record(record);
        let mut file = self.file.lock().unwrap();
        match file.as_mut() {
            Some(f) => {
                if let Err(e) = LogSink::write_locked(f, &line) {
                    eprintln!("cannot write to log file: {}, logging to stderr", e);
                    eprint!("{}", line);
                    *file = None;
                }
            },
            None => eprint!("{}", line),
        }
    }

    fn flush(&self) {
        let mut file = self.file.lock().unwrap();
        if let Some(f) = file.as_mut() {
            let _ = f.flush();
        }
    }
}

/// Initialize the process-wide sink. Call once, near process entry, before
/// the first record is emitted.
///
/// `path` selects the destination (`""` or `"stderr"` for standard error);
/// `verbose` enables DEBUG records.
pub fn init(path: &str, verbose: bool) -> std::result::Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(LogSink::open(path, verbose)))?;
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use log::{Level, Log, Record};

    use super::LogSink;

    fn record<'a>(level: Level, args: std::fmt::Arguments<'a>) -> Record<'a> {
        Record::builder()
            .level(level)
            .args(args)
            .module_path(Some("sandbox::logger::tests"))
            .file(Some("logger.rs"))
            .line(Some(42))
            .build()
    }

    #[test]
    fn test_debug_gated_by_verbose() {
        let quiet = LogSink::open("", false);
        let verbose = LogSink::open("", true);

        assert!(!quiet.enabled(record(Level::Debug, format_args!("x")).metadata()));
        assert!(quiet.enabled(record(Level::Info, format_args!("x")).metadata()));
        assert!(verbose.enabled(record(Level::Debug, format_args!("x")).metadata()));
    }

    #[test]
    fn test_record_line_shape() {
        let line = LogSink::format_record(
            &record(Level::Warn, format_args!("something happened")));

        assert!(line.ends_with("[WARN] [sandbox::logger::tests] [logger.rs:42] - something happened\n"));
        // Leading timestamp: date, time and a two-digit fraction.
        let prefix = line.split(" [").next().unwrap();
        assert_eq!(22, prefix.len());
        assert_eq!(Some('.'), prefix.chars().rev().nth(2));
    }

    #[test]
    fn test_records_appended_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.log");
        let path_str = path.to_str().unwrap();

        let sink = LogSink::open(path_str, false);
        sink.log(&record(Level::Info, format_args!("first")));
        sink.log(&record(Level::Info, format_args!("second")));
        // Gated out: must not reach the file.
        sink.log(&record(Level::Debug, format_args!("invisible")));

        let mut content = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        let lines = content.lines().collect::<Vec<&str>>();
        assert_eq!(2, lines.len());
        assert!(lines[0].ends_with("- first"));
        assert!(lines[1].ends_with("- second"));
    }
}

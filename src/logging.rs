//! Access log and diagnostic logger setup.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use crate::text::{ClfDate, LogEncoded};

/// Where the access log should go, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Syslog,
    File(PathBuf),
}

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    pub fn open(target: &LogTarget) -> Result<Self> {
        Ok(match target {
            LogTarget::Stdout => Self::Stdout,
            LogTarget::Syslog => {
                let ident = CString::new(env!("CARGO_PKG_NAME"))?;
                // openlog keeps the pointer, so the identity must live forever
                let ident: &'static CString = Box::leak(Box::new(ident));
                unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
                Self::Syslog
            }
            LogTarget::File(path) => Self::File(BufWriter::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?,
            )),
        })
    }

    fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = std::io::stdout();
                write!(stdout, "{}", message)?;
                stdout.flush()?;
            }
            Self::Syslog => {
                let message = CString::new(message.replace('\0', ""))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

/// One completed request, as recorded in the access log.
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub client: IpAddr,
    pub user: Option<&'a str>,
    pub request_line: &'a str,
    pub status: u16,
    pub bytes_sent: u64,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

impl<'a> AccessRecord<'a> {
    /// Common Log Format line, with referer and user agent appended.
    pub fn format(&self, now: SystemTime) -> String {
        format!(
            "{} - {} {} \"{}\" {} {} \"{}\" \"{}\"\n",
            self.client,
            self.user.map(LogEncoded).map_or("-".to_string(), |u| u.to_string()),
            ClfDate(now),
            LogEncoded(self.request_line),
            self.status,
            self.bytes_sent,
            LogEncoded(self.referer.unwrap_or("")),
            LogEncoded(self.user_agent.unwrap_or(""))
        )
    }
}

/// Access log shared by all connection threads.
#[derive(Debug)]
pub struct AccessLog {
    sink: Mutex<LogSink>,
}

impl AccessLog {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn record(&self, record: &AccessRecord) {
        let message = record.format(SystemTime::now());
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sink.log(&message) {
            log::warn!("failed to write access log: {}", e);
        }
    }
}

/// Level filter for a `-v` count.
pub fn level_filter(verbosity: u32) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Send diagnostics to stderr.
pub fn init(verbosity: u32) -> Result<()> {
    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Off)
        .build();
    TermLogger::init(
        level_filter(verbosity),
        config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("failed to initialize logger")
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn record<'a>() -> AccessRecord<'a> {
        AccessRecord {
            client: IpAddr::V4(Ipv4Addr::LOCALHOST),
            user: None,
            request_line: "GET /a\"b HTTP/1.1",
            status: 200,
            bytes_sent: 42,
            referer: Some("http://example.com/"),
            user_agent: None,
        }
    }

    #[test]
    fn access_record_format_works() {
        let line = record().format(SystemTime::UNIX_EPOCH);
        assert!(line.starts_with("127.0.0.1 - - ["));
        assert!(line.ends_with("] \"GET /a%22b HTTP/1.1\" 200 42 \"http://example.com/\" \"\"\n"));

        let mut with_user = record();
        with_user.user = Some("alice");
        assert!(with_user
            .format(SystemTime::UNIX_EPOCH)
            .starts_with("127.0.0.1 - alice ["));
    }

    #[test]
    fn access_log_appends_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(&path, "earlier\n").unwrap();
        let log = AccessLog::new(LogSink::open(&LogTarget::File(path.clone())).unwrap());
        log.record(&record());
        log.record(&record());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.starts_with("earlier\n127.0.0.1"));
    }

    #[test]
    fn level_filter_works() {
        assert_eq!(level_filter(0), LevelFilter::Warn);
        assert_eq!(level_filter(1), LevelFilter::Info);
        assert_eq!(level_filter(2), LevelFilter::Debug);
        assert_eq!(level_filter(7), LevelFilter::Trace);
    }
}

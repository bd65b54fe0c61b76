//! Stderr logger for binaries and tests that use this crate.
//!
//! Records are printed as `[elapsed LEVEL target] message`. The level comes
//! either from the caller ([`init_with_level`]) or from the
//! `PLANAR_HOMOGRAPHY_LOG` environment variable ([`init_from_env`]).

use std::io::Write;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read by [`init_from_env`].
pub const LOG_ENV: &str = "PLANAR_HOMOGRAPHY_LOG";

struct StderrLogger {
    level: LevelFilter,
    started: Instant,
}

impl StderrLogger {
    fn write_record(&self, out: &mut impl Write, record: &Record) -> std::io::Result<()> {
        writeln!(
            out,
            "[{:8.3}s {:>5} {}] {}",
            self.started.elapsed().as_secs_f64(),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = self.write_record(&mut std::io::stderr().lock(), record);
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

/// Install the stderr logger at `level`.
///
/// Only the first call installs a logger; later calls return `Ok(())`
/// without changing the level.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = LOGGER.get_or_init(|| StderrLogger {
        level,
        started: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

/// Install the stderr logger with the level named in [`LOG_ENV`]
/// (`off`, `error`, `warn`, `info`, `debug`, `trace`), defaulting to `warn`.
pub fn init_from_env() -> Result<(), log::SetLoggerError> {
    init_with_level(level_from_env(std::env::var(LOG_ENV).ok().as_deref()))
}

fn level_from_env(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(LevelFilter::Warn)
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Spans close with their timing, so the instrumented estimation entry points
/// report how long they took.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);
    if json {
        let _ = builder.json().flatten_event(true).finish().try_init();
    } else {
        let _ = builder
            .with_timer(fmt::time::Uptime::default())
            .finish()
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_level_parsing() {
        assert_eq!(level_from_env(Some("debug")), LevelFilter::Debug);
        assert_eq!(level_from_env(Some(" TRACE ")), LevelFilter::Trace);
        assert_eq!(level_from_env(Some("bogus")), LevelFilter::Warn);
        assert_eq!(level_from_env(None), LevelFilter::Warn);
    }

    #[test]
    fn record_is_written_as_one_line() {
        let logger = StderrLogger {
            level: LevelFilter::Info,
            started: Instant::now(),
        };
        let mut out = Vec::new();
        logger
            .write_record(
                &mut out,
                &Record::builder()
                    .args(format_args!("n={}", 5))
                    .level(log::Level::Info)
                    .target("planar_homography::dlt")
                    .build(),
            )
            .unwrap();

        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with('['));
        assert!(line.ends_with(" INFO planar_homography::dlt] n=5\n"), "{:?}", line);
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        init_with_level(LevelFilter::Debug).unwrap();
        init_with_level(LevelFilter::Trace).unwrap();
        log::debug!("logger installed");
    }
}

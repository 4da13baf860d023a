use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Context as _;
use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

/// Append-only per-run message and debug logs.
///
/// Message lines record request admissions and responses and can be replayed
/// after a restart; the debug log additionally carries diagnostics.
#[derive(Debug)]
pub(crate) struct AuditLog {
    messages_path: PathBuf,
    debug_path: PathBuf,
    errors_path: PathBuf,
    files: Mutex<LogFiles>,
    write_failed: AtomicBool,
}

/// Append handles, kept open for the lifetime of the run.
#[derive(Debug)]
struct LogFiles {
    messages: File,
    debug: File,
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to create log file `{}`", path.display()))
}

impl AuditLog {
    /// Creates both log files in `directory`, named after `started`.
    pub(crate) fn create(directory: &Path, started: OffsetDateTime) -> anyhow::Result<Self> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create directory `{}`", directory.display()))?;

        let stamp = started
            .format(format_description!(
                "[year]-[month]-[day]T[hour].[minute].[second]"
            ))
            .context("Failed to format log file timestamp")?;

        let messages_path = directory.join(format!("{stamp}-messages.log"));
        let debug_path = directory.join(format!("{stamp}-debug.log"));
        let files = LogFiles {
            messages: open_append(&messages_path)?,
            debug: open_append(&debug_path)?,
        };

        Ok(Self {
            messages_path,
            debug_path,
            errors_path: directory.join(format!("{stamp}-errors.log")),
            files: Mutex::new(files),
            write_failed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub(crate) fn messages_path(&self) -> &Path {
        &self.messages_path
    }

    /// Companion file for process warnings and errors of the same run.
    #[must_use]
    pub(crate) fn errors_path(&self) -> &Path {
        &self.errors_path
    }

    /// Records `entry` for request `request_id` in the message and debug logs.
    pub(crate) fn message(&self, request_id: u64, entry: &str) {
        let line = format!("{request_id} {entry}");
        info!("{line}");

        let mut files = self.files.lock();
        self.append_line(&mut files.messages, &self.messages_path, &line);
        self.append_line(&mut files.debug, &self.debug_path, &line);
    }

    /// Records a diagnostic for request `request_id` in the debug log.
    pub(crate) fn debug(&self, request_id: u64, entry: &str) {
        let line = format!("{request_id} {} {entry}", timestamp(OffsetDateTime::now_utc()));
        debug!("{line}");

        let mut files = self.files.lock();
        self.append_line(&mut files.debug, &self.debug_path, &line);
    }

    /// Failures are reported once as a warning, afterwards only at debug level.
    fn append_line(&self, file: &mut File, path: &Path, line: &str) {
        if let Err(err) = writeln!(file, "{line}") {
            if self.write_failed.swap(true, Ordering::Relaxed) {
                debug!("Failed to write to log `{}`:  {err}", path.display());
            } else {
                warn!("Failed to write to log `{}`:  {err}", path.display());
            }
        }
    }
}

/// RFC 3339 rendering used inside log lines.
#[must_use]
pub(crate) fn timestamp(time: OffsetDateTime) -> String {
    time.format(&Rfc3339)
        .unwrap_or_else(|_| time.unix_timestamp().to_string())
}

//! Crash report collection.
//!
//! At startup the previous stderr log is rotated aside and the process
//! stderr file descriptor is redirected into a fresh file inside the
//! `crash_report` work area of the state directory. If the rotated log
//! shows a panic (or a crash diagnostic was left behind by a previous
//! run), the evidence is bundled into a dated ZIP: the old stderr, the
//! retained crash diagnostic, and a fresh best-effort diagnostic produced
//! by a caller-supplied callback under a 30 second budget. A retention cap
//! keeps the archive count bounded.
//!
//! A flag file marks a bundle assembly in progress; a flag found at
//! startup means the previous bundling itself crashed and is aborted.

use crate::BootstrapResult;
use crate::telemetry::log;
use anyhow::Context as _;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Work area inside the state directory.
pub const WORK_DIR: &str = "crash_report";

const STDERR_FILE: &str = "stderr.log";
const OLD_STDERR_FILE: &str = "stderr.old.log";
const IN_PROGRESS_FLAG: &str = "crashreport_in_progress";
const CRASH_DIAGNOSTIC_DIR: &str = "crash_diagnostic";
const PENDING_DIAGNOSTIC_DIR: &str = "diagnostic-pending";

const ARCHIVE_PREFIX: &str = "crashreport_";
const ARCHIVE_SUFFIX: &str = ".zip";

// Only the head of the rotated log is scanned for the panic marker.
const PANIC_SCAN_LIMIT: u64 = 4096;

const DIAGNOSTIC_BUDGET: Duration = Duration::from_secs(30);

static STDERR_REDIRECTED: OnceLock<()> = OnceLock::new();

/// Best-effort diagnostic generator: writes state files into the given
/// directory.
pub type DiagnosticFn = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

/// Diagnostic generation failure.
#[derive(Debug, Error)]
pub enum DiagnosticError {
    /// The callback panicked.
    #[error("failed to collect diagnostic: callback panicked")]
    Panicked,

    /// The 30 second budget ran out.
    #[error("failed to collect diagnostic: budget exhausted")]
    TimedOut,

    /// The callback reported an error.
    #[error("failed to collect diagnostic: {0}")]
    Failed(#[source] anyhow::Error),
}

#[derive(Clone, Default)]
struct Options {
    enabled: bool,
    state_dir: PathBuf,
    diagnostic: Option<DiagnosticFn>,
}

/// Process-wide crash report manager. Lives from process start to process
/// exit.
#[derive(Default)]
pub struct CrashReporter {
    options: Mutex<Options>,
}

impl CrashReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the manager.
    pub fn set_options(
        &self,
        enabled: bool,
        state_dir: impl Into<PathBuf>,
        diagnostic: Option<DiagnosticFn>,
    ) {
        *self.options.lock() = Options {
            enabled,
            state_dir: state_dir.into(),
            diagnostic,
        };
    }

    /// Rotates the previous stderr log and redirects the current process
    /// stderr into a fresh file. Idempotent.
    ///
    /// A leftover in-progress flag means the previous bundling crashed; the
    /// aborted bundle is discarded and startup continues.
    pub fn setup_stderr_redirection(&self) -> BootstrapResult<()> {
        let options = self.options.lock().clone();

        if !options.enabled {
            return Ok(());
        }

        if STDERR_REDIRECTED.get().is_some() {
            return Ok(());
        }

        let workdir = options.state_dir.join(WORK_DIR);
        fs::create_dir_all(&workdir)
            .with_context(|| format!("creating crash report dir {}", workdir.display()))?;

        let flag = workdir.join(IN_PROGRESS_FLAG);
        if flag.exists() {
            log::warn!("aborting crash report bundle left unfinished by a previous run");
            fs::remove_file(&flag).context("removing stale crash report flag")?;
        }

        let current = workdir.join(STDERR_FILE);
        if current.exists() {
            fs::rename(&current, workdir.join(OLD_STDERR_FILE))
                .context("rotating previous stderr log")?;
        }

        redirect_stderr(&current)?;

        let _ = STDERR_REDIRECTED.set(());

        Ok(())
    }

    /// Returns whether the previous run left evidence of a crash.
    pub fn crash_detected(&self) -> bool {
        let options = self.options.lock().clone();
        let workdir = options.state_dir.join(WORK_DIR);

        if stderr_mentions_panic(&workdir.join(OLD_STDERR_FILE)) {
            return true;
        }

        dir_has_entries(&workdir.join(CRASH_DIAGNOSTIC_DIR))
    }

    /// Bundles the crash evidence into a dated ZIP, enforcing the retention
    /// cap. Returns the archive path, or `None` when disabled or when no
    /// crash was detected.
    pub async fn bundle_crash_report(&self, max_reports: usize) -> Option<PathBuf> {
        let options = self.options.lock().clone();

        if !options.enabled || !self.crash_detected() {
            return None;
        }

        let workdir = options.state_dir.join(WORK_DIR);
        let flag = workdir.join(IN_PROGRESS_FLAG);

        if let Err(err) = fs::write(&flag, []) {
            log::warn!("cannot create crash report flag"; "error" => %err);

            return None;
        }

        // Fresh best-effort diagnostic, collected under a budget.
        let pending = workdir.join(PENDING_DIAGNOSTIC_DIR);
        let _ = fs::remove_dir_all(&pending);

        if let Some(diagnostic) = options.diagnostic.clone() {
            if fs::create_dir_all(&pending).is_ok() {
                if let Err(err) = generate_diagnostic(diagnostic, pending.clone()).await {
                    log::warn!("diagnostic generation failed"; "error" => %err);
                }
            }
        }

        let name = format!(
            "{ARCHIVE_PREFIX}{}{ARCHIVE_SUFFIX}",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let archive = options.state_dir.join(name);

        let result = write_archive(&archive, &workdir, &pending);

        let _ = fs::remove_dir_all(&pending);

        match result {
            Ok(()) => {
                // The retained diagnostic has been consumed by the archive.
                let _ = fs::remove_dir_all(workdir.join(CRASH_DIAGNOSTIC_DIR));
                let _ = fs::remove_file(&flag);

                self.purge(max_reports, &[archive.clone()]);

                log::info!("crash report bundled"; "path" => archive.display().to_string());

                Some(archive)
            }
            Err(err) => {
                log::warn!("cannot write crash report archive"; "error" => %err);

                let _ = fs::remove_file(&archive);
                let _ = fs::remove_file(&flag);

                None
            }
        }
    }

    /// Deletes the oldest archives above the cap, never touching the ones
    /// listed in `preserve`. Archive names are chronological, so a name
    /// sort is a time sort.
    pub fn purge(&self, max_reports: usize, preserve: &[PathBuf]) {
        let state_dir = self.options.lock().state_dir.clone();

        let mut archives: Vec<PathBuf> = match fs::read_dir(&state_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| is_archive_name(path))
                .collect(),
            Err(_) => return,
        };

        archives.sort();

        // Everything older than the newest `max_reports` archives goes,
        // except the preserved ones.
        let above_cap = archives.len().saturating_sub(max_reports);
        let preserved: Vec<_> = preserve.iter().filter_map(|path| path.file_name()).collect();

        for path in &archives[..above_cap] {
            if path
                .file_name()
                .is_some_and(|name| preserved.contains(&name))
            {
                continue;
            }

            if let Err(err) = fs::remove_file(path) {
                log::warn!("cannot purge crash report"; "path" => path.display().to_string(), "error" => %err);
            }
        }
    }
}

fn stderr_mentions_panic(path: &Path) -> bool {
    use std::io::Read as _;

    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };

    let mut head = Vec::with_capacity(PANIC_SCAN_LIMIT as usize);
    if file.take(PANIC_SCAN_LIMIT).read_to_end(&mut head).is_err() {
        return false;
    }

    head.windows(b"panic".len()).any(|window| window == b"panic")
}

fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Matches `crashreport_YYYYMMDD-HHMMSS.zip`.
fn is_archive_name(path: &Path) -> bool {
    let name = match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => name,
        None => return false,
    };

    let stamp = match name
        .strip_prefix(ARCHIVE_PREFIX)
        .and_then(|rest| rest.strip_suffix(ARCHIVE_SUFFIX))
    {
        Some(stamp) => stamp,
        None => return false,
    };

    stamp.len() == 15
        && stamp
            .char_indices()
            .all(|(i, c)| if i == 8 { c == '-' } else { c.is_ascii_digit() })
}

async fn generate_diagnostic(diagnostic: DiagnosticFn, dir: PathBuf) -> Result<(), DiagnosticError> {
    let task = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| diagnostic(&dir)))
            .map_err(|_| DiagnosticError::Panicked)?
            .map_err(DiagnosticError::Failed)
    });

    match tokio::time::timeout(DIAGNOSTIC_BUDGET, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(DiagnosticError::Panicked),
        Err(_) => Err(DiagnosticError::TimedOut),
    }
}

fn write_archive(archive: &Path, workdir: &Path, pending: &Path) -> io::Result<()> {
    let file = File::create(archive)?;
    let mut zip = ZipWriter::new(file);

    let old_stderr = workdir.join(OLD_STDERR_FILE);
    if old_stderr.exists() {
        add_file(&mut zip, &old_stderr, STDERR_FILE)?;
    }

    add_dir(&mut zip, &workdir.join(CRASH_DIAGNOSTIC_DIR), CRASH_DIAGNOSTIC_DIR)?;
    add_dir(&mut zip, pending, "diagnostic")?;

    zip.finish()?;

    Ok(())
}

fn add_dir(zip: &mut ZipWriter<File>, dir: &Path, entry_prefix: &str) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    for entry in entries {
        let entry = entry?;

        if entry.file_type()?.is_file() {
            let name = format!("{entry_prefix}/{}", entry.file_name().to_string_lossy());
            add_file(zip, &entry.path(), &name)?;
        }
    }

    Ok(())
}

fn add_file(zip: &mut ZipWriter<File>, path: &Path, entry_name: &str) -> io::Result<()> {
    let mut options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    if let Some(modified) = entry_mtime(path) {
        options = options.last_modified_time(modified);
    }

    zip.start_file(entry_name, options)?;

    let mut source = File::open(path)?;
    io::copy(&mut source, zip)?;

    Ok(())
}

fn entry_mtime(path: &Path) -> Option<zip::DateTime> {
    use chrono::{Datelike as _, Timelike as _};

    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let datetime: chrono::DateTime<Utc> = modified.into();

    zip::DateTime::from_date_and_time(
        u16::try_from(datetime.year()).ok()?,
        datetime.month() as u8,
        datetime.day() as u8,
        datetime.hour() as u8,
        datetime.minute() as u8,
        datetime.second() as u8,
    )
    .ok()
}

#[cfg(unix)]
fn redirect_stderr(path: &Path) -> BootstrapResult<()> {
    use std::os::fd::IntoRawFd as _;

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening stderr log {}", path.display()))?;

    let fd = file.into_raw_fd();

    // SAFETY: fd is a freshly opened, owned descriptor.
    let rc = unsafe { libc::dup2(fd, libc::STDERR_FILENO) };
    unsafe { libc::close(fd) };

    if rc == -1 {
        return Err(io::Error::last_os_error()).context("redirecting stderr");
    }

    Ok(())
}

#[cfg(not(unix))]
fn redirect_stderr(path: &Path) -> BootstrapResult<()> {
    // No fd-level redirection on this platform; the log file still exists
    // so rotation and bundling behave uniformly.
    File::create(path).with_context(|| format!("opening stderr log {}", path.display()))?;

    Ok(())
}

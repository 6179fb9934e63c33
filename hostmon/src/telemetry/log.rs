//! Logging-related functionality.
//!
//! The agent logs through [slog]. A process-global logger is built once from
//! [`LoggingSettings`]; before [`init`] is called a terminal fallback logger
//! is used, so early bootstrap code can log too.
//!
//! [slog]: https://crates.io/crates/slog

use crate::settings::{LogFormat, LogOutput, LoggingSettings};
use crate::{BootstrapResult, ServiceInfo};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use slog::{Drain, FnValue, Logger, Never, SendSyncRefUnwindSafeDrain};
use slog_async::Async as AsyncDrain;
use slog_json::Json as JsonDrain;
use slog_term::{FullFormat as TextDrain, PlainDecorator, TermDecorator};
use std::fs::File;
use std::io;
use std::sync::Arc;

// NOTE: the slog-async default of 128 is too small for bursty fan-out paths.
const CHANNEL_SIZE: usize = 1024;

/// Shared handle to the current logger.
pub type SharedLog = Arc<RwLock<Logger>>;

static HARNESS: OnceCell<SharedLog> = OnceCell::new();

static PRE_INIT_LOG: Lazy<SharedLog> = Lazy::new(|| {
    let settings = LoggingSettings::default();
    let drain = base_drain(&settings).unwrap_or_else(|_| AsyncDrain::new(slog::Discard).build());

    Arc::new(RwLock::new(build_log_with_drain(
        &settings,
        slog::o!(),
        Arc::new(drain.fuse()),
    )))
});

/// Returns the current logger.
///
/// Used by the logging macros; can also be used to hand a raw [`slog::Logger`]
/// to libraries that take one.
pub fn current_log() -> &'static SharedLog {
    HARNESS.get().unwrap_or(&PRE_INIT_LOG)
}

/// Initializes logging from settings.
///
/// Does nothing if logging has already been initialized in this process.
pub fn init(service_info: &ServiceInfo, settings: &LoggingSettings) -> BootstrapResult<()> {
    if HARNESS.get().is_some() {
        return Ok(());
    }

    let drain = base_drain(settings)?;
    let root_kv = slog::o!(
        "module" => FnValue(|record| {
            format!("{}:{}", record.module(), record.line())
        }),
        "version" => service_info.version,
        "pid" => std::process::id(),
    );

    let root_log = build_log_with_drain(settings, root_kv, Arc::new(drain.fuse()));
    let _ = HARNESS.set(Arc::new(RwLock::new(root_log)));

    Ok(())
}

fn base_drain(settings: &LoggingSettings) -> Result<AsyncDrain, anyhow::Error> {
    Ok(match (&settings.output, &settings.format) {
        (LogOutput::Terminal, LogFormat::Text) => {
            let drain = TextDrain::new(TermDecorator::new().stdout().build())
                .build()
                .fuse();
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
        (LogOutput::Terminal, LogFormat::Json) => {
            let drain = build_json_log_drain(io::stdout());
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
        (LogOutput::File(file), LogFormat::Text) => {
            let drain = TextDrain::new(PlainDecorator::new(File::create(file)?))
                .build()
                .fuse();
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
        (LogOutput::File(file), LogFormat::Json) => {
            let drain = build_json_log_drain(File::create(file)?);
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
    })
}

fn build_log_with_drain<K>(
    settings: &LoggingSettings,
    kv: slog::OwnedKV<K>,
    drain: Arc<dyn SendSyncRefUnwindSafeDrain<Ok = (), Err = Never>>,
) -> Logger
where
    K: slog::SendSyncRefUnwindSafeKV + 'static,
{
    let drain = drain.filter_level(settings.verbosity.into()).fuse();

    Logger::root(drain, kv)
}

fn build_json_log_drain<O>(output: O) -> slog::Fuse<JsonDrain<O>>
where
    O: io::Write + Send + 'static,
{
    JsonDrain::new(output)
        .add_default_keys()
        .set_pretty(false)
        .build()
        .fuse()
}

/// Log error level record.
///
/// If duplicate fields are specified for the record then the last one takes
/// precedence and overwrites the value of the previous one.
#[macro_export]
#[doc(hidden)]
macro_rules! __log_error {
    ( $($args:tt)+ ) => {
        $crate::reexports_for_macros::slog::error!(
            $crate::telemetry::log::current_log().read(),
            $($args)+
        );
    };
}

/// Log warning level record.
#[macro_export]
#[doc(hidden)]
macro_rules! __log_warn {
    ( $($args:tt)+ ) => {
        $crate::reexports_for_macros::slog::warn!(
            $crate::telemetry::log::current_log().read(),
            $($args)+
        );
    };
}

/// Log info level record.
#[macro_export]
#[doc(hidden)]
macro_rules! __log_info {
    ( $($args:tt)+ ) => {
        $crate::reexports_for_macros::slog::info!(
            $crate::telemetry::log::current_log().read(),
            $($args)+
        );
    };
}

/// Log debug level record.
#[macro_export]
#[doc(hidden)]
macro_rules! __log_debug {
    ( $($args:tt)+ ) => {
        $crate::reexports_for_macros::slog::debug!(
            $crate::telemetry::log::current_log().read(),
            $($args)+
        );
    };
}

#[doc(inline)]
pub use {__log_debug as debug, __log_error as error, __log_info as info, __log_warn as warn};

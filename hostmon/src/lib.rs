//! Hostmon is an infrastructure monitoring agent. It runs on each host,
//! collects metrics and check results into a short-horizon in-memory time
//! series store, and exposes them through several protocol front-ends:
//!
//! * a JSON-over-HTTPS uplink towards the monitoring vendor API,
//! * a local HTTP API with Prometheus text exposition and GraphQL,
//! * legacy check-protocol servers speaking NRPE (v2/v3) and Zabbix (v1).
//!
//! The crate is organised around the metric [`store`]: check servers and
//! probes push [`store::MetricPoint`] batches into it, the store compresses
//! points into XOR chunks and fans accepted batches out to registered
//! notifiees. One of those notifiees feeds the bounded [`queue::Queue`]
//! drained by the [`uplink`] forwarder. The [`crashreport`] manager runs
//! independently at startup and bundles evidence of previous crashes.

pub mod api;
pub mod check;
pub mod cli;
pub mod crashreport;
pub mod nrpe;
pub mod queue;
pub mod settings;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod uplink;
pub mod zabbix;

mod net;

#[doc(hidden)]
pub mod reexports_for_macros {
    pub use slog;
}

/// Error that can be returned on agent initialisation.
///
/// This is an alias for [`anyhow::Error`]: bootstrap errors are propagated
/// to `main` and terminate the process, and `anyhow` keeps the creation-site
/// context attached on the way up.
pub type BootstrapError = anyhow::Error;

/// Result that has [`BootstrapError`] as an error variant.
pub type BootstrapResult<T> = anyhow::Result<T>;

/// A generic operational (post-initialization) error without backtraces.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operational (post-initialization) result that has [`Error`] as an error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Basic service information.
#[derive(Clone, Debug, Default)]
pub struct ServiceInfo {
    /// The name of the service.
    pub name: &'static str,

    /// The version of the service.
    pub version: &'static str,

    /// Service author.
    pub author: &'static str,

    /// The description of the service.
    pub description: &'static str,
}

/// Creates [`ServiceInfo`] from the information in the `Cargo.toml` manifest
/// of the service.
#[macro_export]
macro_rules! service_info {
    () => {
        $crate::ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            author: env!("CARGO_PKG_AUTHORS"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    };
}

//! HTTP checks.
//!
//! A check probes a URL with a GET and classifies the outcome into a
//! tri-state [`Status`]. The scheduler runs configured checks on a fixed
//! interval and pushes the result into the metric store as a
//! `check_status` point (0 ok, 1 warning, 2 critical) with the status
//! description in the annotations.

use crate::settings::HttpCheckSettings;
use crate::store::{Annotations, MetricPoint, Store, label_set};
use crate::telemetry::log;
use crate::BootstrapResult;
use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Severity of a check result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// Everything is fine.
    Ok,
    /// Degraded but serving.
    Warning,
    /// Down or failing.
    Critical,
}

impl StatusLevel {
    /// Numeric representation stored as the metric value.
    pub fn as_value(self) -> f64 {
        match self {
            Self::Ok => 0.0,
            Self::Warning => 1.0,
            Self::Critical => 2.0,
        }
    }
}

/// Tri-state check result with a human-readable description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Severity.
    pub level: StatusLevel,

    /// Description, e.g. `HTTP CRITICAL - http_code=503`.
    pub description: String,
}

impl Status {
    /// An OK status.
    pub fn ok(description: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Ok,
            description: description.into(),
        }
    }

    /// A warning status.
    pub fn warning(description: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Warning,
            description: description.into(),
        }
    }

    /// A critical status.
    pub fn critical(description: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Critical,
            description: description.into(),
        }
    }
}

/// A single HTTP-GET probe.
pub struct HttpCheck {
    name: String,
    url: String,
    expected_status_code: Option<u16>,
    client: reqwest::Client,
}

impl HttpCheck {
    /// Creates a check against `url`.
    ///
    /// `expected_status_code` of 0 means "classify by status class"; any
    /// other value turns a mismatching response into a critical status.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        expected_status_code: u16,
    ) -> BootstrapResult<Self> {
        // Probes assert reachability, not certificate hygiene: verification
        // is off and redirects are not followed.
        let client = reqwest::Client::builder()
            .timeout(CHECK_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .context("building HTTP check client")?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            expected_status_code: (expected_status_code != 0).then_some(expected_status_code),
            client,
        })
    }

    /// Name reported in the `check` label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs one probe.
    pub async fn do_check(&self) -> Status {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Status::critical("Connection timed out after 10 seconds");
            }
            Err(_) => return Status::critical("Connection refused"),
        };

        let code = response.status().as_u16();

        if let Some(expected) = self.expected_status_code {
            if code != expected {
                return Status::critical(format!(
                    "HTTP CRITICAL - http_code={code} (expected {expected})"
                ));
            }

            return Status::ok(format!("HTTP OK - http_code={code}"));
        }

        if code >= 500 {
            Status::critical(format!("HTTP CRITICAL - http_code={code}"))
        } else if code >= 400 {
            Status::warning(format!("HTTP WARN - http_code={code}"))
        } else {
            Status::ok(format!("HTTP OK - http_code={code}"))
        }
    }
}

/// Runs one configured check on its interval until cancellation, pushing
/// each result into the store.
pub async fn run_scheduled(
    settings: HttpCheckSettings,
    store: Arc<Store>,
    token: CancellationToken,
) {
    let check = match HttpCheck::new(&settings.name, &settings.url, settings.expected_status_code) {
        Ok(check) => check,
        Err(err) => {
            log::error!("cannot build HTTP check"; "name" => &settings.name, "error" => %err);

            return;
        }
    };

    let interval = Duration::from_secs(settings.interval_secs.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }

        let status = check.do_check().await;

        let point = MetricPoint {
            labels: label_set([
                ("__name__", "check_status"),
                ("check", check.name()),
                ("instance", check.url()),
            ]),
            annotations: Annotations {
                status: Some(status.clone()),
                ..Default::default()
            },
            time: Utc::now(),
            value: status.level.as_value(),
        };

        if let Err(err) = store.push_points(vec![point]) {
            log::warn!("cannot store check result"; "check" => check.name(), "error" => %err);
        }
    }
}

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

/// Used when `RUST_LOG` is unset. `usage` is the target of the usage sink.
const DEFAULT_LOG_FILTER: &str = "warn,gateway=info,counsel_internal=info,usage=info";
const DEBUG_LOG_FILTER: &str = "warn,gateway=debug,counsel_internal=debug,usage=info";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Handle for switching on debug logs once the config file has been read.
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        // An explicit `RUST_LOG` wins over `gateway.debug`
        if self.from_env {
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// Installs the global `tracing` subscriber. Must be called once, before anything logs.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    };
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);
    let result = match log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    result.map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to initialize tracing subscriber: {e}"),
        })
    })?;
    Ok(DelayedDebugLogs { handle, from_env })
}

/// Installs the global Prometheus recorder. The handle renders `/metrics`.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), DURATION_BUCKETS)
        .and_then(PrometheusBuilder::install_recorder)
        .map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to install Prometheus exporter: {e}"),
            })
        })
}

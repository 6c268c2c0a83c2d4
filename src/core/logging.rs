//! Logging Initialization
//!
//! Tracing setup driven by [`LoggingConfig`]: a human-readable stdout layer
//! always, plus an optional rolling JSON file under the configured log
//! directory. `log`-macro events from dependencies are bridged into the
//! same pipeline.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Dependencies whose default chatter would drown the engine's own logs;
/// they are pinned to `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["surrealdb", "sqlx", "hyper", "reqwest", "tokenizers"];

/// Build the event filter: an explicit `RUST_LOG` takes the whole filter
/// verbatim; otherwise the configured engine level applies globally with
/// the noisy dependency targets capped.
fn build_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
    EnvFilter::new(directives.join(","))
}

/// Initialize the logging system from configuration.
///
/// Returns the file writer's flush guard, which must be kept alive for the
/// process lifetime; `None` when the file sink is disabled or its
/// directory cannot be created (stdout logging still works in that case —
/// a broken log directory must not prevent the engine from starting).
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(true)
        .compact()
        .with_filter(build_filter(&config.level));

    let mut flush_guard = None;
    let file_layer = config
        .file_enabled
        .then(|| {
            let sink_dir = config.log_dir();
            if let Err(e) = std::fs::create_dir_all(&sink_dir) {
                eprintln!(
                    "cannot create log directory {}: {} — file logging disabled",
                    sink_dir.display(),
                    e
                );
                return None;
            }

            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(&sink_dir, "ragweave.log"),
            );
            flush_guard = Some(guard);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .json()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_filter(build_filter(&config.level)),
            )
        })
        .flatten();

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Dependencies still on the `log` crate feed the same subscriber.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("failed to bridge log events into tracing: {}", e);
    }

    if flush_guard.is_some() {
        tracing::info!(
            level = %config.level,
            file = %config.log_dir().join("ragweave.log").display(),
            "logging initialized"
        );
    } else {
        tracing::info!(level = %config.level, "logging initialized (stdout only)");
    }

    flush_guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_caps_noisy_targets() {
        // Built without RUST_LOG influence by constructing directly.
        let mut directives = vec!["debug".to_string()];
        directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
        let spec = directives.join(",");

        assert!(spec.starts_with("debug,"));
        assert!(spec.contains("surrealdb=warn"));
        assert!(spec.contains("sqlx=warn"));
        // The spec must parse as a valid filter.
        let _filter = EnvFilter::new(spec);
    }

    #[test]
    fn test_build_filter_accepts_all_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let _filter = build_filter(level);
        }
    }
}

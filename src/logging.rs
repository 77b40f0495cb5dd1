//! Per-component logging setup.
//!
//! Every component logs to stdout and to its own timestamped file
//! under the configured log directory. The level comes from
//! `<COMPONENT>_LOG_LEVEL`, falling back to `RUST_LOG`, then `info`.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber for `component`.
///
/// Must be called once per process, before any component starts.
pub fn init(component: &str, log_dir: &Path, level_override: Option<&str>) -> Result<()> {
    let directive = match level_override {
        Some(level) => level.to_string(),
        None => resolve_level(component),
    };

    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log level: {directive}"))?;

    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let log_path = log_dir.join(format!("{component}_{stamp}.log"));
    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("creating log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(Mutex::new(log_file)),
        )
        .init();

    tracing::info!(component, log = %log_path.display(), "logging initialized");

    Ok(())
}

fn resolve_level(component: &str) -> String {
    let component_key = format!("{}_LOG_LEVEL", component.to_uppercase());
    std::env::var(&component_key)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_level_default() {
        // No per-component var set for this made-up name; falls back
        // to RUST_LOG if the harness exported one, else "info".
        let expected = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        assert_eq!(resolve_level("nonexistent_component_xyz"), expected);
    }
}

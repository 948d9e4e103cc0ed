use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the compact stderr subscriber. `RUST_LOG` wins over the
/// `--log-level` directive, which wins over the `warn` default.
pub(crate) fn init_tracing(log_level: Option<&str>) {
    let mut builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    if let Some(directive) = log_level.and_then(|raw| raw.trim().parse().ok()) {
        builder = builder.with_default_directive(directive);
    }
    let env_filter = builder.from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

pub(crate) fn default_database_path() -> PathBuf {
    let base = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".coda").join("sessions.sqlite")
}

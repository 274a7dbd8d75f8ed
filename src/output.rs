//! Diagnostic output. The wrapped tool owns this process's stdout and
//! stderr byte-for-byte, so our own diagnostics only ever go to the
//! CACHE_LOG_FILE, or to stderr when the user explicitly opts in with a
//! CACHE_DEBUG filter directive.

use crate::config::Config;
use std::sync::Arc;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

pub fn init(config: &Config) {
    let file_layer = config.log_file.as_ref().and_then(|path| {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            // nowhere to report this yet; run silently without the log
            .ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        )
    });

    let stderr_layer = config.debug_filter.as_ref().map(|directive| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::OFF.into())
                    .parse_lossy(directive),
            )
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // route `log` records from dependencies through tracing too
    let _ = tracing_log::LogTracer::init();
}

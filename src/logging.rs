//! Log output
//!
//! The crate logs through `tracing`. On Android the events reach logcat via
//! `tracing`'s `log` compatibility and `android_logger`; everywhere else a
//! `tracing-subscriber` formatter writes to stderr.

use std::sync::Once;

/// Tag log lines carry in logcat
pub const LOG_TAG: &str = "LlamaInferenceJNI";

static INIT: Once = Once::new();

/// Installs the platform logger. Safe to call from every entry point.
pub fn init() {
    INIT.call_once(install);
}

#[cfg(target_os = "android")]
fn install() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Info)
            .with_tag(LOG_TAG),
    );
}

#[cfg(not(target_os = "android"))]
fn install() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("llama_inference_jni=info"));

    // The host application may already own the global subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

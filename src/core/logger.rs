// Structured Logging for the depth relay
// tracing + tracing-subscriber, initialised once per process

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

// Upstream/HTTP libraries are chatty at debug level
const QUIET_TARGETS: &[&str] = &[
    "tokio_tungstenite=warn",
    "tungstenite=warn",
    "hyper=warn",
    "reqwest=warn",
    "tower_http=info",
];

/// Map a config string to a tracing level (unknown values fall back to INFO)
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Filter from `RUST_LOG` when it is set and valid, else from `log_level`
///
/// The quiet-target caps only apply to the config-driven filter; an explicit
/// `RUST_LOG` is taken as written.
fn build_filter(log_level: &str, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("Ignoring invalid RUST_LOG {:?}: {}", directives, e),
        }
    }

    let mut filter = EnvFilter::default().add_directive(parse_level(log_level).into());
    for target in QUIET_TARGETS {
        if let Ok(directive) = target.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Setup structured logging for the entire application
///
/// `RUST_LOG`, when set, replaces `log_level` entirely. Calling this more
/// than once is a no-op.
pub fn setup_logging(log_level: &str, json_format: bool) {
    INIT.call_once(|| {
        let filter = build_filter(log_level, std::env::var("RUST_LOG").ok().as_deref());

        let result = if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
        };

        // A subscriber installed elsewhere (tests) is fine
        if result.is_ok() {
            tracing::info!(log_level = %log_level, json = json_format, "Logging initialized");
        }
    });
}

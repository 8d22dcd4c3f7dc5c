//! Process-wide logging setup shared by the packflow binaries.
//!
//! All three services (api, worker, reaper) emit structured JSON by
//! default, with span fields flattened into each event so `run_id` and
//! `tenant_id` attached at the instrumentation sites survive into the log
//! pipeline as top-level keys. Set `PACKFLOW_LOG=pretty` for
//! human-readable output during local development. Filtering comes from
//! `RUST_LOG`, with a default that keeps the chattiest dependencies quiet.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn,aws_config=warn,aws_smithy_runtime=warn";

/// Install the global tracing subscriber.
///
/// Later calls are no-ops, so binaries and tests can both call this
/// without coordinating.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let pretty = std::env::var("PACKFLOW_LOG").is_ok_and(|mode| mode == "pretty");
    if pretty {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .try_init();
    }
}

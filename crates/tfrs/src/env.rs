use std::env;
use std::sync::OnceLock;

static TFRS_TARGET: OnceLock<Option<String>> = OnceLock::new();
static TFRS_TRACE_RUNS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Engine address used when a session config sets no target.
pub(crate) fn default_target() -> Option<&'static str> {
    TFRS_TARGET
        .get_or_init(|| match env::var("TFRS_TARGET") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .as_deref()
}

/// Whether per-run timings are logged at info level instead of debug.
pub(crate) fn trace_runs() -> bool {
    *TFRS_TRACE_RUNS.get_or_init(|| match env::var("TFRS_TRACE_RUNS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

use std::env;
use std::sync::OnceLock;

static TFRS_TENSORFLOW_LIB: OnceLock<Option<String>> = OnceLock::new();

/// Explicit path to the TensorFlow C library, if configured.
pub(crate) fn tensorflow_lib() -> Option<&'static str> {
    TFRS_TENSORFLOW_LIB
        .get_or_init(|| match env::var("TFRS_TENSORFLOW_LIB") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .as_deref()
}

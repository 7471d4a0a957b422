//! Process-wide metrics registry and declaration macros.
//!
//! Instruments are declared next to the code they measure with the
//! `register_*` macros; the reported metric name is the lower_snake_case
//! version of the declared static's identifier.

use std::sync::LazyLock;

pub use paste::paste;
pub use prometheus;
use prometheus::{
    Encoder,
    Registry,
    TextEncoder,
};

mod macros;
mod timer;

pub use timer::{
    StatusTimer,
    Timer,
    STATUS_LABEL,
};

/// Registry that every `register_*` macro invocation registers into.
pub static SERVER_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Render the registry in the Prometheus text exposition format.
pub fn export_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&SERVER_METRICS_REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod tests {
    use crate::register_counter;

    register_counter!(TEST_EVENTS_TOTAL, "Count of test events");
    register_counter!(TEST_LABELED_EVENTS_TOTAL, "Count of labeled test events", &["kind"]);

    #[test]
    fn test_names_derive_from_identifiers() {
        TEST_EVENTS_TOTAL.inc();
        TEST_LABELED_EVENTS_TOTAL.with_label_values(&["a"]).inc();
        let exported = crate::export_metrics().unwrap();
        assert!(exported.contains("test_events_total"));
        assert!(exported.contains("test_labeled_events_total"));
    }
}

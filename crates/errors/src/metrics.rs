use metrics::register_counter;

use crate::ErrorCode;

register_counter!(
    pub CLASSIFIED_ERRORS_TOTAL,
    "Count of classified errors surfaced to clients",
    &["code"]
);

pub fn log_error(code: ErrorCode) {
    CLASSIFIED_ERRORS_TOTAL
        .with_label_values(&[&code.as_i32().to_string()])
        .inc();
}

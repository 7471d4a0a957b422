/// Register an integer counter with the server metrics registry and store it
/// in a static. An optional third argument specifies label names, which makes
/// the static an `IntCounterVec`.
#[macro_export]
macro_rules! register_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                $crate::prometheus::register_int_counter_with_registry!(
                    name,
                    $HELP,
                    &*$crate::SERVER_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                $crate::prometheus::register_int_counter_vec_with_registry!(
                    name,
                    $HELP,
                    $LABELS,
                    &*$crate::SERVER_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register an integer gauge with the server metrics registry and store it in
/// a static.
#[macro_export]
macro_rules! register_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntGauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                $crate::prometheus::register_int_gauge_with_registry!(
                    name,
                    $HELP,
                    &*$crate::SERVER_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register a histogram with the server metrics registry and store it in a
/// static. An optional third argument specifies label names, which makes the
/// static a `HistogramVec`.
#[macro_export]
macro_rules! register_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                $crate::prometheus::register_histogram_with_registry!(
                    name,
                    $HELP,
                    &*$crate::SERVER_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                $crate::prometheus::register_histogram_vec_with_registry!(
                    name,
                    $HELP,
                    $LABELS,
                    &*$crate::SERVER_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}

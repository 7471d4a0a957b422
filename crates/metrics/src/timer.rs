use std::time::{
    Duration,
    Instant,
};

use prometheus::{
    Histogram,
    HistogramVec,
};

pub const STATUS_LABEL: &[&str; 1] = &["status"];

/// Records its lifetime into a histogram on drop.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Timer over a `status`-labeled histogram. Call [`StatusTimer::finish`] on
/// the success path; dropping the timer without finishing records the
/// duration under the `"error"` label.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    finished: bool,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            finished: false,
        }
    }

    pub fn finish(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram
            .with_label_values(&["success"])
            .observe(elapsed.as_secs_f64());
        self.finished = true;
        elapsed
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() {
            return;
        }
        self.histogram
            .with_label_values(&["error"])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

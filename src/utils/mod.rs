use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::info;

/// Logs how long a labelled stretch of work took when dropped.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("⏱  Finished: {} (took {:.2?})", self.label, self.elapsed());
    }
}

/// Uniformly random duration in `[min, max]`; `min` when the range is empty.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    Duration::from_secs_f64(rand::random_range(min.as_secs_f64()..=max.as_secs_f64()))
}

/// Sleep for a random duration in `[min, max]`. Returns at once for zero.
pub async fn random_delay(min: Duration, max: Duration) {
    let d = random_between(min, max);
    if !d.is_zero() {
        sleep(d).await;
    }
}

/// Format a count with thousands separators.
pub fn fmt_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, ch) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    result
}

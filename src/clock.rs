use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed since the process-local epoch.
///
/// Monotonic: all response-time measurements are `end - start` pairs from
/// this source, never wall-clock.
pub fn now_us() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Measures the elapsed microseconds of one operation.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: u64,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self { start: now_us() }
    }

    pub fn elapsed_us(&self) -> u64 {
        now_us().saturating_sub(self.start)
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_stopwatch_measures_sleep() {
        let sw = Stopwatch::start();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(sw.elapsed_us() >= 10_000);
    }
}

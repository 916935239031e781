use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

/// Read and error counters for the current monitoring window.
#[derive(Debug)]
pub struct ReadStats {
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    reads: u64,
    errors: u64,
    since: Instant,
    generation: u64,
}

/// Identifies the window a read was counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowId(u64);

/// Counters drained at the end of a monitoring window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReport {
    pub reads: u64,
    pub errors: u64,
    pub elapsed_secs: f64,
}

impl WindowReport {
    pub fn rate(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.reads as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }

    pub fn error_pct(&self) -> f64 {
        self.errors as f64 / self.reads as f64 * 100.0
    }
}

impl Default for ReadStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadStats {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                reads: 0,
                errors: 0,
                since: Instant::now(),
                generation: 0,
            }),
        }
    }

    pub fn record_read(&self) -> WindowId {
        let mut window = self.lock();
        window.reads += 1;
        WindowId(window.generation)
    }

    /// Counts a failed read and returns the error count including it.
    ///
    /// If the window the read was counted in has since been drained, the read
    /// is counted again in the current one so errors never outnumber reads.
    pub fn record_error(&self, read_in: WindowId) -> u64 {
        let mut window = self.lock();
        if window.generation != read_in.0 {
            window.reads += 1;
        }
        window.errors += 1;
        window.errors
    }

    /// `(reads, errors)` in the current window.
    pub fn snapshot(&self) -> (u64, u64) {
        let window = self.lock();
        (window.reads, window.errors)
    }

    /// Returns the window and starts a new one, or `None` when nothing was
    /// read, in which case the window keeps accumulating.
    pub fn drain(&self) -> Option<WindowReport> {
        let mut window = self.lock();
        if window.reads == 0 {
            return None;
        }
        let now = Instant::now();
        let report = WindowReport {
            reads: window.reads,
            errors: window.errors,
            elapsed_secs: now.duration_since(window.since).as_secs_f64(),
        };
        *window = Window {
            reads: 0,
            errors: 0,
            since: now,
            generation: window.generation.wrapping_add(1),
        };
        Some(report)
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::ReadStats;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn drain_reports_and_resets_window() {
        let stats = ReadStats::new();
        for _ in 1..10 {
            stats.record_read();
        }
        let window = stats.record_read();
        assert_eq!(stats.record_error(window), 1);
        assert_eq!(stats.record_error(window), 2);
        tokio::time::advance(Duration::from_secs(5)).await;

        let report = stats.drain().expect("reads were recorded");
        assert_eq!(report.reads, 10);
        assert_eq!(report.errors, 2);
        assert!((report.rate() - 2.0).abs() < 1e-9);
        assert!((report.error_pct() - 20.0).abs() < 1e-9);
        assert_eq!(stats.snapshot(), (0, 0));
    }

    #[test]
    fn empty_window_is_not_drained() {
        let stats = ReadStats::new();
        assert!(stats.drain().is_none());
    }

    #[test]
    fn error_after_drain_lands_with_its_read() {
        let stats = ReadStats::new();
        let window = stats.record_read();
        let report = stats.drain().expect("reads were recorded");
        assert_eq!((report.reads, report.errors), (1, 0));

        assert_eq!(stats.record_error(window), 1);
        let (reads, errors) = stats.snapshot();
        assert!(errors <= reads, "{errors} errors over {reads} reads");

        let report = stats.drain().expect("late failure counts as a read");
        assert!(report.error_pct() <= 100.0);
    }
}

//! Periodic read-rate reporting. Never touches the instrument.

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::info;

use crate::stats::{ReadStats, WindowReport};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub struct PerformanceMonitor {
    stats: Arc<ReadStats>,
    interval: Duration,
}

impl PerformanceMonitor {
    pub fn new(stats: Arc<ReadStats>, interval: Duration) -> Self {
        Self { stats, interval }
    }

    /// Reports and resets the current window if any reads happened.
    pub fn tick(&self) -> Option<WindowReport> {
        let report = self.stats.drain()?;
        info!(
            reads = report.reads,
            errors = report.errors,
            "performance: {:.1} reads/s, {:.1}% errors",
            report.rate(),
            report.error_pct()
        );
        Some(report)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PerformanceMonitor;
    use crate::stats::ReadStats;
    use std::{sync::Arc, time::Duration};

    #[tokio::test(start_paused = true)]
    async fn tick_without_reads_keeps_window() {
        let stats = Arc::new(ReadStats::new());
        let monitor = PerformanceMonitor::new(Arc::clone(&stats), Duration::from_secs(30));
        assert!(monitor.tick().is_none());

        let window = stats.record_read();
        stats.record_error(window);
        tokio::time::advance(Duration::from_secs(4)).await;
        let report = monitor.tick().expect("one read was recorded");
        assert_eq!((report.reads, report.errors), (1, 1));
        assert!((report.elapsed_secs - 4.0).abs() < 1e-6);
        assert_eq!(stats.snapshot(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_drains_on_interval() {
        let stats = Arc::new(ReadStats::new());
        let task = PerformanceMonitor::new(Arc::clone(&stats), Duration::from_secs(30)).spawn();
        stats.record_read();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(stats.snapshot(), (1, 0));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(stats.snapshot(), (0, 0));
        task.abort();
    }
}

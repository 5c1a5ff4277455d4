//! In-memory query metrics ring buffer.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use tradevault_core::config::QueryConfig;
use tradevault_core::metrics::{LatencyClass, QueryMetrics, QueryStats, SlowQueryAlert};

#[derive(Debug, Default)]
struct Buffers {
    samples: VecDeque<QueryMetrics>,
    alerts: VecDeque<SlowQueryAlert>,
    total_recorded: u64,
}

/// Fixed-capacity ring buffer of recent [`QueryMetrics`] plus the most
/// recent slow-query alerts. Oldest entries are evicted first.
#[derive(Debug)]
pub struct MetricsRecorder {
    capacity: usize,
    alert_capacity: usize,
    slow_threshold: Duration,
    critical_threshold: Duration,
    buffers: Mutex<Buffers>,
}

impl MetricsRecorder {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            capacity: config.metrics_capacity.max(1),
            alert_capacity: config.alert_capacity.max(1),
            slow_threshold: config.slow_query_threshold,
            critical_threshold: config.critical_query_threshold,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Append a sample. Returns the latency class so the caller can decide
    /// how loudly to log it.
    pub fn record(&self, sample: QueryMetrics) -> LatencyClass {
        let class =
            LatencyClass::classify(sample.duration, self.slow_threshold, self.critical_threshold);

        let mut buffers = self.buffers.lock();
        if class != LatencyClass::Normal {
            if buffers.alerts.len() == self.alert_capacity {
                buffers.alerts.pop_front();
            }
            buffers.alerts.push_back(SlowQueryAlert {
                query_hash: sample.query_hash.clone(),
                statement_type: sample.statement_type,
                duration: sample.duration,
                class,
                observed_at: Utc::now(),
            });
        }

        if buffers.samples.len() == self.capacity {
            buffers.samples.pop_front();
        }
        buffers.samples.push_back(sample);
        buffers.total_recorded += 1;
        class
    }

    /// Copy of the samples currently held, oldest first.
    pub fn samples(&self) -> Vec<QueryMetrics> {
        self.buffers.lock().samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples recorded over the recorder's lifetime, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.buffers.lock().total_recorded
    }

    pub fn summary(&self) -> QueryStats {
        let buffers = self.buffers.lock();
        QueryStats::from_samples(
            buffers.samples.iter(),
            self.slow_threshold,
            self.critical_threshold,
        )
    }

    /// Mean latency over the buffer, `None` when empty.
    pub fn average_latency(&self) -> Option<Duration> {
        let buffers = self.buffers.lock();
        if buffers.samples.is_empty() {
            return None;
        }
        let total: Duration = buffers.samples.iter().map(|s| s.duration).sum();
        Some(total / buffers.samples.len() as u32)
    }

    /// Most recent alerts, newest last.
    pub fn recent_slow_queries(&self) -> Vec<SlowQueryAlert> {
        self.buffers.lock().alerts.iter().cloned().collect()
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradevault_core::metrics::StatementType;

    fn recorder(capacity: usize) -> MetricsRecorder {
        MetricsRecorder::new(&QueryConfig {
            metrics_capacity: capacity,
            alert_capacity: 2,
            slow_query_threshold: Duration::from_millis(100),
            critical_query_threshold: Duration::from_millis(500),
            ..Default::default()
        })
    }

    fn sample(hash: &str, ms: u64) -> QueryMetrics {
        QueryMetrics::success(hash, StatementType::Select, Duration::from_millis(ms), 1)
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let metrics = recorder(3);
        for (i, ms) in [1, 2, 3, 4].into_iter().enumerate() {
            metrics.record(sample(&format!("q{i}"), ms));
        }

        let hashes: Vec<_> = metrics.samples().into_iter().map(|s| s.query_hash).collect();
        assert_eq!(hashes, vec!["q1", "q2", "q3"]);
        assert_eq!(metrics.total_recorded(), 4);
        assert_eq!(metrics.average_latency(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_slow_queries_raise_alerts() {
        let metrics = recorder(10);
        assert_eq!(metrics.record(sample("fast", 10)), LatencyClass::Normal);
        assert_eq!(metrics.record(sample("slow", 200)), LatencyClass::Slow);
        assert_eq!(metrics.record(sample("bad", 900)), LatencyClass::Critical);
        assert_eq!(metrics.record(sample("slow2", 150)), LatencyClass::Slow);

        let alerts = metrics.recent_slow_queries();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].query_hash, "bad");
        assert_eq!(alerts[1].class, LatencyClass::Slow);

        let stats = metrics.summary();
        assert_eq!(stats.sample_count, 4);
        assert_eq!(stats.slow_count, 2);
        assert_eq!(stats.critical_count, 1);
    }

    #[test]
    fn test_empty_recorder() {
        let metrics = recorder(5);
        assert!(metrics.is_empty());
        assert_eq!(metrics.average_latency(), None);
        assert_eq!(metrics.summary().sample_count, 0);
    }
}

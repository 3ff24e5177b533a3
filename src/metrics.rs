//! Usage accounting
//!
//! Process-wide counters for token consumption and round durations, keyed by
//! provider. Rounds record into an [`UsageMetrics`] shared behind an `Arc`;
//! a front-end renders a point-in-time [`MetricsSnapshot`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Per-provider running totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStats {
    /// Tokens consumed across all rounds.
    pub tokens: u64,
    /// Completed rounds.
    pub rounds: u64,
    /// Summed wall-clock duration of completed rounds.
    pub total_duration: Duration,
}

impl ProviderStats {
    /// Mean round duration, zero when no round has completed.
    pub fn avg_duration(&self) -> Duration {
        if self.rounds == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.rounds as u32
    }
}

/// Process-wide usage counters.
#[derive(Debug, Default)]
pub struct UsageMetrics {
    total_tokens: AtomicU64,
    providers: DashMap<String, ProviderStats>,
}

impl UsageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add token usage reported by one stream event or sync reply.
    pub fn record_tokens(&self, provider: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
        self.providers
            .entry(provider.to_string())
            .or_default()
            .tokens += tokens;
    }

    /// Record one completed round and its wall-clock duration.
    pub fn record_round(&self, provider: &str, duration: Duration) {
        let mut stats = self.providers.entry(provider.to_string()).or_default();
        stats.rounds += 1;
        stats.total_duration += duration;
    }

    /// Total tokens consumed across all providers.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters, providers in stable name order.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut providers: Vec<(String, ProviderStats)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        providers.sort_by(|a, b| a.0.cmp(&b.0));
        MetricsSnapshot {
            total_tokens: self.total_tokens(),
            providers,
        }
    }
}

/// A point-in-time copy of [`UsageMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_tokens: u64,
    pub providers: Vec<(String, ProviderStats)>,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total tokens: {}", self.total_tokens)?;
        for (name, stats) in &self.providers {
            writeln!(
                f,
                "  {}: {} tokens, {} rounds, avg {:.1}s",
                name,
                stats.tokens,
                stats.rounds,
                stats.avg_duration().as_secs_f64()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_accumulate_globally_and_per_provider() {
        let metrics = UsageMetrics::new();
        metrics.record_tokens("deepseek", 10);
        metrics.record_tokens("deepseek", 7);
        metrics.record_tokens("openrouter", 3);

        assert_eq!(metrics.total_tokens(), 20);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.providers.len(), 2);
        assert_eq!(snapshot.providers[0].0, "deepseek");
        assert_eq!(snapshot.providers[0].1.tokens, 17);
        assert_eq!(snapshot.providers[1].1.tokens, 3);
    }

    #[test]
    fn test_zero_usage_creates_no_entry() {
        let metrics = UsageMetrics::new();
        metrics.record_tokens("deepseek", 0);

        assert_eq!(metrics.total_tokens(), 0);
        assert!(metrics.snapshot().providers.is_empty());
    }

    #[test]
    fn test_round_durations_average() {
        let metrics = UsageMetrics::new();
        metrics.record_round("deepseek", Duration::from_secs(2));
        metrics.record_round("deepseek", Duration::from_secs(4));

        let snapshot = metrics.snapshot();
        let (_, stats) = &snapshot.providers[0];
        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.total_duration, Duration::from_secs(6));
        assert_eq!(stats.avg_duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_avg_duration_without_rounds_is_zero() {
        assert_eq!(ProviderStats::default().avg_duration(), Duration::ZERO);
    }

    #[test]
    fn test_snapshot_renders_for_display() {
        let metrics = UsageMetrics::new();
        metrics.record_tokens("deepseek", 42);
        metrics.record_round("deepseek", Duration::from_millis(1500));

        let rendered = metrics.snapshot().to_string();
        assert!(rendered.contains("total tokens: 42"));
        assert!(rendered.contains("deepseek"));
        assert!(rendered.contains("1 rounds"));
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = std::sync::Arc::new(UsageMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = std::sync::Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    metrics.record_tokens("deepseek", 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.total_tokens(), 800);
        assert_eq!(metrics.snapshot().providers[0].1.tokens, 800);
    }
}

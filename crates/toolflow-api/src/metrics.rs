//! Prometheus counters for runs and the documentation cache, served as text
//! on `/metrics`.
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use toolflow_cache::CacheStats;
use toolflow_core::{RunResult, Termination};

#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    runs: IntCounterVec,
    run_errors: IntCounter,
    run_duration: Histogram,
    invalidated: IntCounter,
    cache_entries: IntGauge,
    cache_bytes: IntGauge,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    cache_evictions: IntGauge,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("toolflow".into()), None)?;

        let runs = IntCounterVec::new(Opts::new("runs_total", "Pipeline runs by termination"), &["termination"])?;
        let run_errors = IntCounter::new("run_errors_total", "Stage errors recorded across all runs")?;
        let run_duration = Histogram::with_opts(
            HistogramOpts::new("run_duration_seconds", "Wall-clock time of pipeline runs")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
        )?;
        let invalidated = IntCounter::new("cache_invalidated_total", "Cache entries removed through the API")?;
        let cache_entries = IntGauge::new("cache_entries", "Entries in the memory tier")?;
        let cache_bytes = IntGauge::new("cache_bytes", "Bytes held by the memory tier")?;
        let cache_hits = IntGauge::new("cache_hits", "Cache hits, fresh and stale")?;
        let cache_misses = IntGauge::new("cache_misses", "Cache misses")?;
        let cache_evictions = IntGauge::new("cache_evictions", "LRU evictions from the memory tier")?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(run_errors.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(invalidated.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;

        Ok(Self {
            registry,
            runs,
            run_errors,
            run_duration,
            invalidated,
            cache_entries,
            cache_bytes,
            cache_hits,
            cache_misses,
            cache_evictions,
        })
    }

    pub fn observe_run(&self, result: &RunResult) {
        self.runs
            .with_label_values(&[termination_label(&result.termination)])
            .inc();
        self.run_errors.inc_by(result.errors.len() as u64);
        self.run_duration.observe(result.execution_time_ms as f64 / 1000.0);
    }

    pub fn observe_invalidation(&self, removed: usize) {
        self.invalidated.inc_by(removed as u64);
    }

    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_entries.set(saturating_i64(stats.total_entries as u64));
        self.cache_bytes.set(saturating_i64(stats.total_size_bytes));
        self.cache_hits.set(saturating_i64(stats.hits + stats.stale_hits));
        self.cache_misses.set(saturating_i64(stats.misses));
        self.cache_evictions.set(saturating_i64(stats.evictions));
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

impl std::fmt::Debug for ApiMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiMetrics").finish_non_exhaustive()
    }
}

pub fn termination_label(termination: &Termination) -> &'static str {
    match termination {
        Termination::Completed => "completed",
        Termination::EarlyStop { .. } => "early_stop",
        Termination::BudgetExhausted { .. } => "budget_exhausted",
        Termination::StageFailed { .. } => "stage_failed",
        Termination::Misconfigured => "misconfigured",
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_prefixed_counters() {
        let metrics = ApiMetrics::new().unwrap();
        metrics.observe_invalidation(3);
        let text = metrics.encode().unwrap();
        assert!(text.contains("toolflow_cache_invalidated_total 3"));
    }

    #[test]
    fn test_cache_gauges_follow_stats() {
        let metrics = ApiMetrics::new().unwrap();
        let stats = CacheStats {
            total_entries: 4,
            hits: 2,
            stale_hits: 1,
            misses: 5,
            ..CacheStats::default()
        };
        metrics.observe_cache(&stats);
        let text = metrics.encode().unwrap();
        assert!(text.contains("toolflow_cache_entries 4"));
        assert!(text.contains("toolflow_cache_hits 3"));
        assert!(text.contains("toolflow_cache_misses 5"));
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::StageStatus;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub stages_succeeded: u64,
    pub stages_failed: u64,
    pub stages_tolerated: u64,
    pub stages_skipped: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_status(&self, status: StageStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                StageStatus::Succeeded => guard.stages_succeeded += 1,
                StageStatus::Failed => guard.stages_failed += 1,
                StageStatus::Tolerated => guard.stages_tolerated += 1,
                StageStatus::Skipped => guard.stages_skipped += 1,
                StageStatus::NotRun => {}
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        succeeded = snapshot.stages_succeeded,
        failed = snapshot.stages_failed,
        tolerated = snapshot.stages_tolerated,
        skipped = snapshot.stages_skipped,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP mlsecops_stage_outcomes_total Stage outcomes by status\n");
        output.push_str("# TYPE mlsecops_stage_outcomes_total counter\n");
        for (status, count) in [
            ("succeeded", self.stages_succeeded),
            ("failed", self.stages_failed),
            ("tolerated", self.stages_tolerated),
            ("skipped", self.stages_skipped),
        ] {
            output.push_str(&format!(
                "mlsecops_stage_outcomes_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        output.push_str("# HELP mlsecops_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE mlsecops_stage_calls_total counter\n");
        output.push_str(
            "# HELP mlsecops_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE mlsecops_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP mlsecops_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE mlsecops_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "mlsecops_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "mlsecops_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "mlsecops_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP mlsecops_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE mlsecops_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "mlsecops_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

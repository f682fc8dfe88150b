use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("emissions output io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("emissions record encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One in-flight measurement. Owned by exactly one relay task, so concurrent
/// requests cannot contaminate each other's attribution.
#[derive(Debug)]
pub struct EmissionsScope {
    pub id: Uuid,
    started_at: DateTime<Utc>,
    begun: Instant,
}

impl EmissionsScope {
    /// Fresh scope stamped with the current wall and monotonic clocks.
    pub fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            begun: Instant::now(),
        }
    }
}

/// Start/stop-bracketed resource tracking around one backend call.
///
/// Start is called at most once per relay, stop exactly once per successful
/// start. Implementations must tolerate overlapping scopes from concurrent
/// requests. Faults here are logged by the caller and never surfaced to the
/// client stream.
#[async_trait]
pub trait EmissionsTracker: Send + Sync {
    async fn start(&self) -> Result<EmissionsScope, TrackerError>;
    async fn stop(&self, scope: EmissionsScope) -> Result<(), TrackerError>;
}

/// Package power draw assumed when no hardware counters are available,
/// matching a mid-range desktop CPU running an inference workload.
const DEFAULT_PACKAGE_WATTS: f64 = 85.0;
/// Global-average grid carbon intensity, gCO2e per kWh.
const DEFAULT_GRID_INTENSITY: f64 = 475.0;

const OUTPUT_FILE: &str = "emissions.jsonl";

#[derive(Debug, Serialize)]
struct EmissionsRecord {
    scope_id: Uuid,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    energy_kwh: f64,
    emissions_g: f64,
}

/// Appends one JSON record per scope under the configured output directory.
#[derive(Clone)]
pub struct FileEmissionsTracker {
    output_dir: PathBuf,
    package_watts: f64,
    grid_intensity: f64,
}

impl FileEmissionsTracker {
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            package_watts: DEFAULT_PACKAGE_WATTS,
            grid_intensity: DEFAULT_GRID_INTENSITY,
        })
    }
}

#[async_trait]
impl EmissionsTracker for FileEmissionsTracker {
    async fn start(&self) -> Result<EmissionsScope, TrackerError> {
        Ok(EmissionsScope::open())
    }

    async fn stop(&self, scope: EmissionsScope) -> Result<(), TrackerError> {
        let elapsed = scope.begun.elapsed();
        let energy_kwh = self.package_watts * elapsed.as_secs_f64() / 3_600_000.0;
        let record = EmissionsRecord {
            scope_id: scope.id,
            started_at: scope.started_at,
            duration_ms: elapsed.as_millis() as u64,
            energy_kwh,
            emissions_g: energy_kwh * self.grid_intensity,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.output_dir.join(OUTPUT_FILE))
            .await?;
        file.write_all(&line).await?;
        tracing::debug!(
            scope_id = %record.scope_id,
            duration_ms = record.duration_ms,
            "emissions scope recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_record_per_scope() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileEmissionsTracker::new(dir.path()).unwrap();

        for _ in 0..2 {
            let scope = tracker.start().await.unwrap();
            tracker.stop(scope).await.unwrap();
        }

        let contents = std::fs::read_to_string(dir.path().join(OUTPUT_FILE)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(record.get("scope_id").is_some());
            assert!(record["energy_kwh"].as_f64().unwrap() >= 0.0);
            assert!(record["emissions_g"].as_f64().unwrap() >= 0.0);
        }
    }

    #[tokio::test]
    async fn creates_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out").join("emissions");
        let _tracker = FileEmissionsTracker::new(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn overlapping_scopes_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileEmissionsTracker::new(dir.path()).unwrap();

        let first = tracker.start().await.unwrap();
        let second = tracker.start().await.unwrap();
        assert_ne!(first.id, second.id);

        tracker.stop(second).await.unwrap();
        tracker.stop(first).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(OUTPUT_FILE)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}

//! Run-history persistence for monitored tests
//!
//! One JSON record per monitored test name. Prioritization and flaky-test
//! heuristics read these records; the core only owns the persistence. The
//! file may not exist on first run - that is "no history", not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::Result;

/// Accumulated history for one monitored test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRecord {
    pub total_runs: u64,
    pub failures: u64,
    /// Failures since the last pass
    pub consecutive_failures: u64,
    pub last_passed: Option<bool>,
    pub last_run: Option<DateTime<Utc>>,
}

impl TestRecord {
    /// Fraction of recorded runs that failed
    pub fn failure_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.failures as f64 / self.total_runs as f64
        }
    }
}

/// Append-or-replace store of test records, backed by a single JSON file
#[derive(Debug)]
pub struct RunHistory {
    path: PathBuf,
    records: BTreeMap<String, TestRecord>,
}

impl RunHistory {
    /// Load history from disk; a missing file yields an empty store
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, records })
    }

    /// Write all records back to disk, creating parent directories as needed
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&self.records)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    /// Record a passing run for a test
    pub fn record_pass(&mut self, test_name: &str) {
        let record = self.records.entry(test_name.to_string()).or_default();
        record.total_runs += 1;
        record.consecutive_failures = 0;
        record.last_passed = Some(true);
        record.last_run = Some(Utc::now());
    }

    /// Record a failing run for a test
    pub fn record_failure(&mut self, test_name: &str) {
        let record = self.records.entry(test_name.to_string()).or_default();
        record.total_runs += 1;
        record.failures += 1;
        record.consecutive_failures += 1;
        record.last_passed = Some(false);
        record.last_run = Some(Utc::now());
    }

    pub fn get(&self, test_name: &str) -> Option<&TestRecord> {
        self.records.get(test_name)
    }

    pub fn records(&self) -> &BTreeMap<String, TestRecord> {
        &self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let history = RunHistory::load(temp_dir.path().join("history.json"))
            .await
            .unwrap();
        assert!(history.records().is_empty());
    }

    #[tokio::test]
    async fn test_record_and_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/history.json");

        let mut history = RunHistory::load(&path).await.unwrap();
        history.record_failure("api::login");
        history.record_failure("api::login");
        history.record_pass("api::login");
        history.record_pass("ui::render");
        history.save().await.unwrap();

        let reloaded = RunHistory::load(&path).await.unwrap();
        let record = reloaded.get("api::login").unwrap();
        assert_eq!(record.total_runs, 3);
        assert_eq!(record.failures, 2);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_passed, Some(true));
        assert!(reloaded.get("ui::render").is_some());
    }

    #[test]
    fn test_failure_rate() {
        let mut record = TestRecord::default();
        assert_eq!(record.failure_rate(), 0.0);

        record.total_runs = 4;
        record.failures = 1;
        assert!((record.failure_rate() - 0.25).abs() < f64::EPSILON);
    }
}

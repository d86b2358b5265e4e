//! Per-run metrics records and the bounded ring that keeps them.
//!
//! The orchestrator only produces a [`RunRecord`] per run and hands it to a
//! [`MetricsSink`]. [`MetricsRing`] is the in-process sink: an explicitly
//! owned ring buffer of the newest records with summary statistics, reset
//! whenever the process restarts.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::ids::RecordId;

/// Outcome of a run as seen by the metrics collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

/// One record per pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub status: RunStatus,
    /// Content type of the primary upload.
    pub file_type: String,
    /// Total bytes uploaded for the run.
    pub file_size_bytes: u64,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Destination for run records.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: RunRecord);
}

/// A stored record, stamped on arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEntry {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: RunRecord,
}

/// Aggregates over the retained window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsStats {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub avg_processing_time_ms: u64,
}

/// Records (newest first) plus stats, ready for a dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: Vec<MetricsEntry>,
    pub stats: MetricsStats,
}

/// Bounded ring of the most recent run records.
pub struct MetricsRing {
    capacity: usize,
    entries: RwLock<VecDeque<MetricsEntry>>,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current stats over the retained records.
    pub fn stats(&self) -> MetricsStats {
        let entries = self.entries.read();
        compute_stats(entries.iter())
    }

    /// Copy of all retained records (newest first) and their stats.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let entries = self.entries.read();
        MetricsSnapshot {
            requests: entries.iter().cloned().collect(),
            stats: compute_stats(entries.iter()),
        }
    }
}

impl Default for MetricsRing {
    fn default() -> Self {
        Self::new(50)
    }
}

impl MetricsSink for MetricsRing {
    fn record(&self, record: RunRecord) {
        if self.capacity == 0 {
            return;
        }
        let entry = MetricsEntry {
            id: RecordId::new(),
            timestamp: Utc::now(),
            record,
        };
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_back();
        }
        entries.push_front(entry);
    }
}

fn compute_stats<'a>(entries: impl Iterator<Item = &'a MetricsEntry>) -> MetricsStats {
    let mut stats = MetricsStats::default();
    let mut total_time: u64 = 0;
    for entry in entries {
        stats.total += 1;
        match entry.record.status {
            RunStatus::Success => stats.success += 1,
            RunStatus::Error => stats.error += 1,
        }
        total_time += entry.record.processing_time_ms;
    }
    if stats.total > 0 {
        stats.avg_processing_time_ms = total_time / stats.total as u64;
    }
    stats
}

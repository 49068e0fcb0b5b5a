//! Process-wide operation counters and the monitor snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::operation::OpPoolStats;
use crate::protocol::RequestTag;
use crate::scheduler::WorkerPoolStats;

const TAGS: usize = RequestTag::ALL.len();

/// Lock-free counters updated on the request path.
#[derive(Debug)]
pub struct CoreStats {
    initiated: [AtomicU64; TAGS],
    completed: [AtomicU64; TAGS],
    connections_total: AtomicU64,
    busy_rejections: AtomicU64,
    submit_failures: AtomicU64,
    abandoned: AtomicU64,
    bytes_read: AtomicU64,
    pdus_read: AtomicU64,
}

impl Default for CoreStats {
    fn default() -> Self {
        Self {
            initiated: std::array::from_fn(|_| AtomicU64::new(0)),
            completed: std::array::from_fn(|_| AtomicU64::new(0)),
            connections_total: AtomicU64::new(0),
            busy_rejections: AtomicU64::new(0),
            submit_failures: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            pdus_read: AtomicU64::new(0),
        }
    }
}

impl CoreStats {
    pub fn op_initiated(&self, tag: RequestTag) {
        self.initiated[tag.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_completed(&self, tag: RequestTag) {
        self.completed[tag.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn busy_rejection(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submit_failure(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abandoned(&self, n: u64) {
        self.abandoned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn pdu_read(&self, bytes: usize) {
        self.pdus_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn initiated(&self, tag: RequestTag) -> u64 {
        self.initiated[tag.index()].load(Ordering::Relaxed)
    }

    pub fn completed(&self, tag: RequestTag) -> u64 {
        self.completed[tag.index()].load(Ordering::Relaxed)
    }

    fn per_tag(counters: &[AtomicU64; TAGS]) -> BTreeMap<&'static str, u64> {
        RequestTag::ALL
            .iter()
            .map(|tag| (tag.name(), counters[tag.index()].load(Ordering::Relaxed)))
            .collect()
    }

    /// Combine the counters with live component state.
    pub fn snapshot(
        &self,
        connections_current: usize,
        write_waiters: usize,
        op_pool: OpPoolStats,
        workers: WorkerPoolStats,
    ) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: Utc::now(),
            connections_current,
            connections_total: self.connections_total.load(Ordering::Relaxed),
            ops_initiated: Self::per_tag(&self.initiated),
            ops_completed: Self::per_tag(&self.completed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            pdus_read: self.pdus_read.load(Ordering::Relaxed),
            write_waiters,
            op_pool,
            workers,
        }
    }
}

/// Serializable statistics for the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub connections_current: usize,
    pub connections_total: u64,
    pub ops_initiated: BTreeMap<&'static str, u64>,
    pub ops_completed: BTreeMap<&'static str, u64>,
    pub busy_rejections: u64,
    pub submit_failures: u64,
    pub abandoned: u64,
    pub bytes_read: u64,
    pub pdus_read: u64,
    pub write_waiters: usize,
    pub op_pool: OpPoolStats,
    pub workers: WorkerPoolStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_tag_counters() {
        let stats = CoreStats::default();
        stats.op_initiated(RequestTag::Search);
        stats.op_initiated(RequestTag::Search);
        stats.op_completed(RequestTag::Search);
        assert_eq!(stats.initiated(RequestTag::Search), 2);
        assert_eq!(stats.completed(RequestTag::Search), 1);
        assert_eq!(stats.initiated(RequestTag::Bind), 0);

        let snap = stats.snapshot(0, 0, OpPoolStats::default(), WorkerPoolStats::default());
        assert_eq!(snap.ops_initiated["search"], 2);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["ops_completed"]["search"], 1);
    }
}
